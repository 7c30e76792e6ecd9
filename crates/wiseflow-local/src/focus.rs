//! Focus-point extraction over a preprocessed page.
//!
//! Link chunks feed [`get_more_related_urls`], content chunks feed [`get_info`],
//! and the head of the page feeds [`get_author_and_publish_date`]. A failed LLM
//! call on one chunk is logged and contributes nothing; the other chunks proceed.

use crate::prompts;
use crate::textprep::{is_chinese, normalize_date, parse_json_lenient, truncate_chars};
use futures_util::future::join_all;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use wiseflow_core::{
    ChatBackend, ChatRequest, FocusPoint, InfoItem, PageMeta, PreprocessOutput, ReferenceMap,
};

/// Characters of page text shown to the author/date prompt.
const META_HEAD_CHARS: usize = 2_000;

fn link_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+\]").expect("static regex"))
}

fn any_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(?:img)?\d+\]").expect("static regex"))
}

fn info_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<info>(.*?)</info>").expect("static regex"))
}

fn field_re(name: &str) -> Regex {
    Regex::new(&format!(r#"(?i)"?{name}"?\s*[:：]\s*"?([^"\n,}}]*)"#)).expect("static regex")
}

fn source_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| field_re("source"))
}

fn date_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| field_re("publish_date"))
}

fn is_na(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s.eq_ignore_ascii_case("na") || s.eq_ignore_ascii_case("n/a")
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FocusExtraction {
    pub focus_id: String,
    pub related_urls: BTreeSet<String>,
    pub infos: Vec<InfoItem>,
    pub meta: PageMeta,
}

async fn ask(llm: &dyn ChatBackend, what: &str, req: ChatRequest) -> Option<String> {
    match llm.chat(&req).await {
        Ok(answer) => Some(answer),
        Err(e) => {
            tracing::warn!(call = what, backend = llm.name(), error = %e, "llm call failed; skipping chunk");
            None
        }
    }
}

fn chat_request(system: String, user: String) -> ChatRequest {
    ChatRequest {
        temperature: Some(0.1),
        ..ChatRequest::new(system, user)
    }
}

/// Resolve the `[N]` markers in an answer through `references`; unknown markers are ignored.
pub fn resolve_link_markers(answer: &str, references: &ReferenceMap) -> BTreeSet<String> {
    link_marker_re()
        .find_iter(answer)
        .filter_map(|m| references.get(m.as_str()).cloned())
        .collect()
}

/// Ask which links in each link chunk relate to `focus`.
pub async fn get_more_related_urls(
    llm: &dyn ChatBackend,
    focus: &FocusPoint,
    output: &PreprocessOutput,
) -> BTreeSet<String> {
    let zh = is_chinese(&focus.focus);
    let system = prompts::related_urls_system(focus, zh);
    let calls = output.link_chunks.iter().map(|chunk| {
        let req = chat_request(system.clone(), prompts::related_urls_user(chunk, zh));
        ask(llm, "related_urls", req)
    });
    join_all(calls)
        .await
        .into_iter()
        .flatten()
        .flat_map(|answer| resolve_link_markers(&answer, &output.references))
        .collect()
}

/// Pull info item texts out of an answer: a JSON array (strings or `{"content": ..}`
/// objects), else `<info>...</info>` tags.
pub fn parse_info_answer(answer: &str) -> Vec<String> {
    let from_json: Vec<String> = match parse_json_lenient(answer) {
        Some(serde_json::Value::Array(values)) => values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Object(o) => o
                    .get("content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Some(serde_json::Value::Object(o)) => o
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    // A stray `[1]` marker parses as a JSON array, so tags are tried whenever JSON yields nothing.
    let items = if from_json.is_empty() {
        info_tag_re()
            .captures_iter(answer)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    } else {
        from_json
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !is_na(s))
        .collect()
}

fn info_item(focus_id: &str, content: String, references: &ReferenceMap) -> InfoItem {
    let cited = any_marker_re()
        .find_iter(&content)
        .filter_map(|m| {
            references
                .get(m.as_str())
                .map(|url| (m.as_str().to_string(), url.clone()))
        })
        .collect();
    InfoItem {
        focus_id: focus_id.to_string(),
        content,
        references: cited,
    }
}

/// Extract focus-related info items from each content chunk.
pub async fn get_info(
    llm: &dyn ChatBackend,
    focus: &FocusPoint,
    output: &PreprocessOutput,
    meta: &PageMeta,
) -> Vec<InfoItem> {
    let zh = is_chinese(&focus.focus);
    let system = prompts::info_system(focus, zh);
    let calls = output.content_chunks.iter().map(|chunk| {
        let user = prompts::info_user(chunk, &meta.author, &meta.publish_date, zh);
        ask(llm, "get_info", chat_request(system.clone(), user))
    });
    join_all(calls)
        .await
        .into_iter()
        .flatten()
        .flat_map(|answer| parse_info_answer(&answer))
        .map(|content| info_item(&focus.id, content, &output.references))
        .collect()
}

/// Parse a `{"source", "publish_date"}` answer, with a key/value regex fallback.
pub fn parse_author_and_date(answer: &str) -> PageMeta {
    let (source, date) = match parse_json_lenient(answer) {
        Some(serde_json::Value::Object(o)) => (
            o.get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            o.get("publish_date")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        ),
        _ => {
            let grab = |re: &Regex| {
                re.captures(answer)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default()
            };
            (grab(source_field_re()), grab(date_field_re()))
        }
    };
    PageMeta {
        author: if is_na(&source) {
            String::new()
        } else {
            source.trim().to_string()
        },
        publish_date: normalize_date(&date).unwrap_or_default(),
    }
}

/// Ask for the page's source and publication date from the start of its text.
pub async fn get_author_and_publish_date(llm: &dyn ChatBackend, text: &str) -> PageMeta {
    if text.trim().is_empty() {
        return PageMeta::default();
    }
    let (head, _) = truncate_chars(text, META_HEAD_CHARS);
    let zh = is_chinese(&head);
    let req = chat_request(
        prompts::author_date_system(zh),
        prompts::author_date_user(&head, zh),
    );
    match ask(llm, "author_date", req).await {
        Some(answer) => parse_author_and_date(&answer),
        None => PageMeta::default(),
    }
}

/// Run all three extractions for one page and one focus point.
///
/// `known_meta` fields that are already filled are not asked for again.
pub async fn extract_page(
    llm: &dyn ChatBackend,
    focus: &FocusPoint,
    output: &PreprocessOutput,
    known_meta: &PageMeta,
) -> FocusExtraction {
    let mut meta = known_meta.clone();
    if meta.author.is_empty() || meta.publish_date.is_empty() {
        let head = output
            .content_chunks
            .first()
            .or_else(|| output.link_chunks.first())
            .map(String::as_str)
            .unwrap_or("");
        let asked = get_author_and_publish_date(llm, head).await;
        if meta.author.is_empty() {
            meta.author = asked.author;
        }
        if meta.publish_date.is_empty() {
            meta.publish_date = asked.publish_date;
        }
    }

    let (related_urls, infos) = futures_util::join!(
        get_more_related_urls(llm, focus, output),
        get_info(llm, focus, output, &meta)
    );
    tracing::debug!(
        focus_id = %focus.id,
        related_urls = related_urls.len(),
        infos = infos.len(),
        "focus extraction done"
    );
    FocusExtraction {
        focus_id: focus.id.clone(),
        related_urls,
        infos,
        meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiseflow_core::{Error, Result};

    /// Answers by matching the prompt; counts calls.
    struct Scripted<F> {
        answer: F,
        calls: AtomicUsize,
    }

    impl<F> Scripted<F>
    where
        F: Fn(&ChatRequest) -> Result<String> + Send + Sync,
    {
        fn new(answer: F) -> Self {
            Self {
                answer,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl<F> ChatBackend for Scripted<F>
    where
        F: Fn(&ChatRequest) -> Result<String> + Send + Sync,
    {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat(&self, req: &ChatRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.answer)(req)
        }
    }

    fn focus() -> FocusPoint {
        FocusPoint {
            id: "f1".into(),
            focus: "semiconductor export controls".into(),
            explanation: String::new(),
        }
    }

    fn output() -> PreprocessOutput {
        let mut references = ReferenceMap::new();
        references.insert("[1]".into(), "https://a.com/chips".into());
        references.insert("[2]".into(), "https://a.com/sports".into());
        references.insert("[img3]".into(), "https://a.com/chart.png".into());
        PreprocessOutput {
            references,
            link_chunks: vec!["Chip rules[1]\nFootball[2]".into()],
            content_chunks: vec!["New export rules were announced[1]. Chart[img3]".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn related_urls_map_markers_and_ignore_unknown_ones() {
        let llm = Scripted::new(|_req: &ChatRequest| Ok("[1]\n[99]\n[img3]".to_string()));
        let urls = get_more_related_urls(&llm, &focus(), &output()).await;
        assert_eq!(urls, BTreeSet::from(["https://a.com/chips".to_string()]));
    }

    #[tokio::test]
    async fn info_items_carry_their_cited_references() {
        let llm = Scripted::new(|_req: &ChatRequest| {
            Ok(r#"```json
[{"content": "The US announced new export rules[1], see chart[img3]"}, {"content": "NA"}]
```"#
                .to_string())
        });
        let infos = get_info(&llm, &focus(), &output(), &PageMeta::default()).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].focus_id, "f1");
        assert_eq!(infos[0].references.len(), 2);
        assert_eq!(
            infos[0].references.get("[img3]").map(String::as_str),
            Some("https://a.com/chart.png")
        );
    }

    #[test]
    fn info_answers_fall_back_to_tags() {
        let items = parse_info_answer("<info>first[1]</info>\nnoise\n<info> NA </info><info>second</info>");
        assert_eq!(items, vec!["first[1]".to_string(), "second".to_string()]);
        assert!(parse_info_answer("[]").is_empty());
        assert_eq!(parse_info_answer(r#"["plain"]"#), vec!["plain".to_string()]);
    }

    #[tokio::test]
    async fn failed_chunks_are_skipped() {
        let mut out = output();
        out.content_chunks.push("second chunk".into());
        let llm = Scripted::new(|req: &ChatRequest| {
            if req.user.contains("second chunk") {
                Ok(r#"[{"content": "kept"}]"#.to_string())
            } else {
                Err(Error::Llm("HTTP 500".into()))
            }
        });
        let infos = get_info(&llm, &focus(), &out, &PageMeta::default()).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].content, "kept");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn author_and_date_parse_json_and_loose_text() {
        let m = parse_author_and_date(r#"{"source": "Reuters", "publish_date": "2024/3/7"}"#);
        assert_eq!(m.author, "Reuters");
        assert_eq!(m.publish_date, "2024-03-07");

        let m = parse_author_and_date("source: 新华社\npublish_date: 2024年5月20日");
        assert_eq!(m.author, "新华社");
        assert_eq!(m.publish_date, "2024-05-20");

        let m = parse_author_and_date(r#"{"source": "NA", "publish_date": "NA"}"#);
        assert_eq!(m, PageMeta::default());
    }

    #[tokio::test]
    async fn extract_page_reuses_known_metadata() {
        let llm = Scripted::new(|req: &ChatRequest| {
            let system = req.system.as_deref().unwrap_or("");
            if system.contains("page metadata") {
                Ok(r#"{"source": "Wire", "publish_date": "2024-01-02"}"#.to_string())
            } else if system.contains("filtering") {
                Ok("[1]".to_string())
            } else {
                assert!(req.user.contains("Published: 2024-01-02"));
                Ok(r#"[{"content": "rules[1]"}]"#.to_string())
            }
        });
        let known = PageMeta {
            author: "Known Author".into(),
            publish_date: String::new(),
        };
        let got = extract_page(&llm, &focus(), &output(), &known).await;
        assert_eq!(got.meta.author, "Known Author");
        assert_eq!(got.meta.publish_date, "2024-01-02");
        assert_eq!(got.related_urls.len(), 1);
        assert_eq!(got.infos.len(), 1);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn chinese_focus_points_get_chinese_prompts() {
        let llm = Scripted::new(|req: &ChatRequest| {
            assert!(req.system.as_deref().unwrap_or("").contains("关注点"));
            Ok("NA".to_string())
        });
        let fp = FocusPoint {
            id: "z".into(),
            focus: "芯片出口管制".into(),
            explanation: String::new(),
        };
        assert!(get_more_related_urls(&llm, &fp, &output()).await.is_empty());
    }
}
