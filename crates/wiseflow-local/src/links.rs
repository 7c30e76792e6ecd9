//! URL normalization and markdown link-target parsing.
//!
//! Crawled markdown carries links in every shape a page author (or an HTML->markdown
//! converter) can produce: protocol-relative URLs, `www.` hosts without a scheme,
//! `http:/` typos, angle-bracketed destinations with titles. Everything here maps
//! those onto absolute http(s) URLs.

use regex::Regex;
use std::sync::OnceLock;

/// Host suffixes that mark an image source as "just a domain" (usually a logo link).
const COMMON_TLDS: &[&str] = &[
    ".com", ".cn", ".net", ".org", ".edu", ".gov", ".io", ".ai", ".co", ".uk", ".de", ".jp",
    ".fr", ".ru", ".info", ".biz", ".me", ".tv", ".cc", ".xyz", ".top", ".app", ".dev", ".us",
    ".in", ".au", ".ca", ".hk", ".tw", ".kr", ".sg",
];

const COMMON_FILE_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "svg", "webp", "ico", "bmp", "tif", "tiff", "avif", "pdf",
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip", "rar", "7z", "mp3", "mp4", "avi",
    "mov", "wmv", "flv", "txt", "csv", "json", "xml", "js", "css",
];

/// Raster formats that may carry readable text worth sending to a vision model.
const RASTER_EXTS: &[&str] = &["jpg", "jpeg", "png"];

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)"(.*?)""#).expect("static regex"))
}

fn angle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<(.*?)>").expect("static regex"))
}

/// Resolve `raw` into an absolute http(s) URL.
///
/// - `www.x` and `/www.x` become `https://www.x`
/// - `//host/p` becomes `https://host/p`
/// - `http:/x` / `https:/x` are repaired
/// - anything else is joined against `base_url`
///
/// Repeated slashes in the path are collapsed. Returns `None` for non-http(s)
/// results (data URIs, mailto, unparseable input).
pub fn normalize_url(raw: &str, base_url: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lc = raw.to_ascii_lowercase();
    let candidate = if lc.starts_with("www.") {
        format!("https://{raw}")
    } else if lc.starts_with("/www.") {
        format!("https:/{raw}")
    } else if raw.starts_with("//") {
        format!("https:{raw}")
    } else if lc.starts_with("http://") || lc.starts_with("https://") {
        raw.to_string()
    } else if lc.starts_with("http:/") {
        format!("http://{}", &raw[6..])
    } else if lc.starts_with("https:/") {
        format!("https://{}", &raw[7..])
    } else {
        let base = url::Url::parse(base_url).ok()?;
        base.join(raw).ok()?.to_string()
    };

    let mut u = url::Url::parse(&candidate).ok()?;
    if !matches!(u.scheme(), "http" | "https") || u.host_str().is_none() {
        return None;
    }
    if u.path().contains("//") {
        let collapsed = collapse_slashes(u.path());
        u.set_path(&collapsed);
    }
    Some(u.to_string())
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    out
}

/// Destination part of `[text](...)`, split into URL and optional title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub url: String,
    pub title: String,
}

/// Parse a markdown link destination: `url`, `<url>`, `url "title"`, `<url> "title"`.
pub fn parse_link_target(raw: &str) -> LinkTarget {
    let title = quoted_re()
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect::<String>()
        .trim()
        .to_string();
    let url = match angle_re().captures(raw).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => quoted_re().replace_all(raw, "").trim().to_string(),
    };
    LinkTarget { url, title }
}

/// Destinations that never point at another page.
pub fn is_non_navigational(url: &str) -> bool {
    let lc = url.trim().to_ascii_lowercase();
    lc.is_empty()
        || lc.starts_with('#')
        || lc.starts_with("javascript:")
        || lc.starts_with("mailto:")
        || lc.starts_with("tel:")
}

/// Heuristic: is this image a logo/icon/non-raster asset not worth a vision call?
///
/// True when the source is a bare domain, ends with a common TLD, or ends with a
/// known file extension other than jpg/jpeg/png.
pub fn is_icon_like(image_url: &str) -> bool {
    let Ok(u) = url::Url::parse(image_url) else {
        return true;
    };
    let path = u.path().trim_end_matches('/').to_ascii_lowercase();
    if path.is_empty() {
        return true;
    }
    let last = path.rsplit('/').next().unwrap_or("");
    if COMMON_TLDS.iter().any(|tld| last.ends_with(tld)) {
        return true;
    }
    match last.rsplit_once('.') {
        Some((_, ext)) => COMMON_FILE_EXTS.contains(&ext) && !RASTER_EXTS.contains(&ext),
        None => false,
    }
}
