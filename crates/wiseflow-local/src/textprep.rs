//! Minimal, deterministic text helpers shared by preprocessing and LLM output parsing.

use regex::Regex;
use std::sync::OnceLock;

pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Truncate to at most `max_chars` characters. Returns `(text, clipped)`.
pub fn truncate_chars(s: &str, max_chars: usize) -> (String, bool) {
    match s.char_indices().nth(max_chars) {
        Some((byte, _)) => (s[..byte].to_string(), true),
        None => (s.to_string(), false),
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF | 0xF900..=0xFAFF)
}

/// True when at least 30% of the non-whitespace characters are CJK ideographs.
pub fn is_chinese(s: &str) -> bool {
    let mut total = 0usize;
    let mut cjk = 0usize;
    for ch in s.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if is_cjk(ch) {
            cjk += 1;
        }
    }
    total > 0 && cjk * 10 >= total * 3
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{4})\s*[-/.年]\s*(\d{1,2})\s*[-/.月]\s*(\d{1,2})").expect("static regex")
    })
}

fn compact_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})(\d{2})(\d{2})\b").expect("static regex"))
}

/// Find the first recognizable calendar date in `s` and render it as `YYYY-MM-DD`.
pub fn normalize_date(s: &str) -> Option<String> {
    let caps = date_re()
        .captures(s)
        .or_else(|| compact_date_re().captures(s))?;
    let year: u32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;
    if !(1900..=2999).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("{year:04}-{month:02}-{day:02}"))
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex"))
}

/// Parse JSON out of an LLM answer.
///
/// Tries, in order: the whole text, the first fenced code block, the outermost
/// `[...]` span, the outermost `{...}` span.
pub fn parse_json_lenient(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    if let Some(inner) = fenced_json_re()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
    {
        if let Ok(v) = serde_json::from_str(inner) {
            return Some(v);
        }
    }
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), ("hé".to_string(), true));
        assert_eq!(truncate_chars("abc", 3), ("abc".to_string(), false));
        assert_eq!(truncate_chars("abc", 0), (String::new(), true));
    }

    #[test]
    fn detects_chinese_text() {
        assert!(is_chinese("人工智能 新闻"));
        assert!(is_chinese("关注 AI 新闻"));
        assert!(!is_chinese("AI news about chips"));
        assert!(!is_chinese("   "));
    }

    #[test]
    fn normalizes_common_date_shapes() {
        assert_eq!(normalize_date("2024-3-7").as_deref(), Some("2024-03-07"));
        assert_eq!(normalize_date("on 2024/12/01 at noon").as_deref(), Some("2024-12-01"));
        assert_eq!(normalize_date("2024年5月20日").as_deref(), Some("2024-05-20"));
        assert_eq!(normalize_date("20230115").as_deref(), Some("2023-01-15"));
        assert_eq!(normalize_date("2024-13-01"), None);
        assert_eq!(normalize_date("NA"), None);
    }

    #[test]
    fn parses_json_from_chatty_answers() {
        let v = parse_json_lenient(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);

        let v = parse_json_lenient("Sure!\n```json\n[\"x\", \"y\"]\n```\nDone.").unwrap();
        assert_eq!(v.as_array().map(|a| a.len()), Some(2));

        let v = parse_json_lenient(r#"Result: {"source": "Reuters", "publish_date": "2024-01-02"} hope it helps"#)
            .unwrap();
        assert_eq!(v["source"], "Reuters");

        assert!(parse_json_lenient("no json here").is_none());
    }
}
