//! Markdown section classifier and link normalizer.
//!
//! Crawled pages arrive as markdown full of navigation menus, footers and inline
//! links. This pass:
//!
//! 1. splits the page on top-level headers and drops a leading navigation block
//!    and a trailing footer (only when the page has more than two sections),
//! 2. rewrites every link, image and bare URL into a numbered marker (`[3]`,
//!    `[img2]`) backed by a flat reference map,
//! 3. classifies each section as link-dense or content by prose characters per
//!    marker,
//! 4. packs each class into chunks small enough for one LLM call.
//!
//! Images that may carry text (short alt, little surrounding prose, raster
//! format) are sent to an optional [`ImageRecognizer`]; results are memoized in
//! the caller's [`RecognizedImages`] map.

use crate::chunk::{pack_chunks, DEFAULT_MAX_CHUNK_CHARS};
use crate::links::{is_icon_like, is_non_navigational, normalize_url, parse_link_target};
use crate::textprep::char_len;
use regex::Regex;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::OnceLock;
use wiseflow_core::{
    ImageRecognizer, PreprocessOutput, PreprocessRequest, RecognizedImages, ReferenceMap,
    SectionKind,
};

/// Ratio reported for sections without any marker.
const NO_MARKER_RATIO: f64 = 999.0;

/// Private-use delimiters around parked spans; stripped from input.
const PARK_OPEN: char = '\u{E000}';
const PARK_CLOSE: char = '\u{E001}';

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Leading section is navigation when links / non-link chars exceeds this.
    pub nav_link_ratio: f64,
    /// Trailing section is a footer when it has fewer non-link chars than this.
    pub footer_min_chars: usize,
    /// Sections with fewer prose chars per marker than this are link-dense.
    pub content_ratio: f64,
    pub max_chunk_chars: usize,
    /// Alt texts up to this length are treated as missing.
    pub short_alt_chars: usize,
    /// A standalone image is "alone" when the rest of its section has at most this many chars.
    pub standalone_text_chars: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            nav_link_ratio: 0.05,
            footer_min_chars: 198,
            content_ratio: 90.0,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            short_alt_chars: 2,
            standalone_text_chars: 5,
        }
    }
}

fn javascript_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<javascript:.*?>").expect("static regex"))
}

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\[\]]*)\]\(([^)\n]*)\)").expect("static regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\[\]]*)\]\(([^)\n]*)\)").expect("static regex"))
}

fn image_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"§([^§]*?)\|\|([^§]*)§").expect("static regex"))
}

fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:https?://|www\.)[-A-Za-z0-9+&@#/%?=~_|!:,.;]*[-A-Za-z0-9+&@#/%=~_|]")
            .expect("static regex")
    })
}

fn parked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x{E000}(\d+)\x{E001}").expect("static regex"))
}

/// Already-rewritten spans, swapped out of the section text so the bare URL
/// pass never sees URLs inside link text or image alt text.
#[derive(Default)]
struct Parked(Vec<String>);

impl Parked {
    fn park(&mut self, span: String) -> String {
        let token = format!("{PARK_OPEN}{}{PARK_CLOSE}", self.0.len());
        self.0.push(span);
        token
    }

    fn restore(&self, text: &str) -> String {
        parked_re()
            .replace_all(text, |c: &regex::Captures| {
                c[1].parse::<usize>()
                    .ok()
                    .and_then(|i| self.0.get(i))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

/// Two-group regex match with owned captures (safe to keep across `.await`).
struct Capture {
    range: Range<usize>,
    first: String,
    second: String,
}

fn captures(re: &Regex, text: &str) -> Vec<Capture> {
    re.captures_iter(text)
        .filter_map(|c| {
            let whole = c.get(0)?;
            Some(Capture {
                range: whole.range(),
                first: c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                second: c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Crawlers emit `<javascript:...>` destinations whose parentheses break link parsing.
fn squash_javascript_urls(markdown: &str) -> String {
    javascript_url_re()
        .replace_all(markdown, "<javascript:>")
        .trim()
        .to_string()
}

/// `![alt](src)` -> `§alt||src§`, so images nested in links survive link parsing.
fn mark_images(markdown: &str) -> String {
    image_re().replace_all(markdown, "§${1}||${2}§").into_owned()
}

/// Split on lines starting with `# `; the header line opens its section.
fn split_sections(markdown: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in markdown.split_inclusive('\n') {
        if line.starts_with("# ") {
            if current.trim().is_empty() {
                current.clear();
            } else {
                out.push(std::mem::take(&mut current));
            }
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

fn non_link_chars(section: &str) -> usize {
    char_len(link_re().replace_all(section, "").trim())
}

fn looks_like_navigation(section: &str, cfg: &PreprocessConfig) -> bool {
    let links = link_re().find_iter(section).count();
    let remain = non_link_chars(section);
    let ratio = if remain == 0 {
        1.0
    } else {
        links as f64 / remain as f64
    };
    ratio > cfg.nav_link_ratio
}

fn looks_like_footer(section: &str, cfg: &PreprocessConfig) -> bool {
    non_link_chars(section) < cfg.footer_min_chars
}

/// Link-dense below the threshold, content at or above it.
pub fn classify(ratio: f64, cfg: &PreprocessConfig) -> SectionKind {
    if ratio < cfg.content_ratio {
        SectionKind::Links
    } else {
        SectionKind::Content
    }
}

/// Link text that is nothing but a URL adds no prose next to its marker.
fn is_only_url(s: &str) -> bool {
    bare_url_re()
        .find(s)
        .is_some_and(|m| m.start() == 0 && m.end() == s.len())
}

#[derive(Debug, Clone)]
struct RewrittenSection {
    text: String,
    ratio: f64,
}

enum LinkRewrite {
    /// Not a navigational link; replaced by its text and not counted.
    Plain(String),
    Marked(String),
}

struct SectionRewriter<'a> {
    base_url: &'a str,
    used_images: &'a BTreeSet<String>,
    existing_urls: &'a BTreeSet<String>,
    cfg: &'a PreprocessConfig,
    recognizer: Option<&'a dyn ImageRecognizer>,
    recognized: &'a mut RecognizedImages,
    references: ReferenceMap,
}

impl SectionRewriter<'_> {
    fn push_reference(&mut self, prefix: &str, url: String) -> String {
        let key = format!("[{prefix}{}]", self.references.len() + 1);
        self.references.insert(key.clone(), url);
        key
    }

    fn is_used_image(&self, raw_src: &str, normalized: &str) -> bool {
        self.used_images.contains(raw_src.trim()) || self.used_images.contains(normalized)
    }

    async fn recognize(&mut self, image_url: &str, alt: &str) -> String {
        let fallback = || alt.trim().to_string();
        if let Some(text) = self.recognized.get(image_url) {
            return if text.trim().is_empty() {
                fallback()
            } else {
                text.clone()
            };
        }
        let Some(recognizer) = self.recognizer else {
            return fallback();
        };
        match recognizer.recognize(image_url).await {
            Ok(text) => {
                let text = text.trim().to_string();
                self.recognized
                    .insert(image_url.to_string(), text.clone());
                if text.is_empty() {
                    fallback()
                } else {
                    text
                }
            }
            Err(e) => {
                tracing::warn!(
                    image = image_url,
                    recognizer = recognizer.name(),
                    error = %e,
                    "image recognition failed; keeping alt text"
                );
                fallback()
            }
        }
    }

    async fn rewrite(&mut self, section: &str) -> RewrittenSection {
        let mut markers = 0usize;
        let mut valid_len = char_len(section.trim()) as i64;

        let mut parked = Parked::default();
        let mut text = String::with_capacity(section.len());
        let mut last = 0usize;
        for m in captures(link_re(), section) {
            text.push_str(&section[last..m.range.start]);
            let whole_chars = char_len(&section[m.range.clone()]);
            last = m.range.end;
            match self.rewrite_link(&m.first, &m.second).await {
                LinkRewrite::Plain(s) => text.push_str(&parked.park(s)),
                LinkRewrite::Marked(s) => {
                    markers += 1;
                    valid_len -= whole_chars as i64;
                    text.push_str(&parked.park(s));
                }
            }
        }
        text.push_str(&section[last..]);

        let text = self.rewrite_images(&text, &mut parked).await;
        let (text, bare, bare_chars) = self.rewrite_bare_urls(&text);
        markers += bare;
        valid_len -= bare_chars as i64;
        let text = parked.restore(&text);

        let ratio = if markers == 0 {
            NO_MARKER_RATIO
        } else {
            valid_len as f64 / markers as f64
        };
        RewrittenSection {
            text: text.trim().to_string(),
            ratio,
        }
    }

    async fn rewrite_link(&mut self, raw_text: &str, raw_target: &str) -> LinkRewrite {
        let target = parse_link_target(raw_target);
        let mut link_text = raw_text.trim().to_string();
        if !target.title.is_empty() && !link_text.contains(&target.title) {
            link_text = if link_text.is_empty() {
                target.title.clone()
            } else {
                format!("{} - {}", target.title, link_text)
            };
        }
        let Some(url) = (!is_non_navigational(&target.url))
            .then(|| normalize_url(&target.url, self.base_url))
            .flatten()
        else {
            let alts_only = image_marker_re().replace_all(&link_text, "${1}");
            return LinkRewrite::Plain(alts_only.trim().to_string());
        };

        let images = captures(image_marker_re(), &link_text);
        let stripped = image_marker_re()
            .replace_all(&link_text, "")
            .trim()
            .to_string();
        let visible = if stripped.is_empty() {
            match images.first() {
                Some(img) => self.link_image_text(&img.first, &img.second, &url).await,
                None => String::new(),
            }
        } else if is_only_url(&stripped) {
            // The target lives in the reference map already.
            String::new()
        } else {
            stripped
        };
        let key = self.push_reference("", url);
        LinkRewrite::Marked(format!("{visible}{key}"))
    }

    /// Visible text for a link whose only content is an image.
    async fn link_image_text(&mut self, alt: &str, raw_src: &str, link_url: &str) -> String {
        let alt = alt.trim();
        let src = parse_link_target(raw_src).url;
        if src.is_empty() || src.starts_with('#') {
            return alt.to_string();
        }
        let Some(image_url) = normalize_url(&src, self.base_url) else {
            return alt.to_string();
        };
        let key = self.push_reference("img", image_url.clone());
        let body = if char_len(alt) > self.cfg.short_alt_chars
            || self.existing_urls.contains(link_url)
            || is_icon_like(&image_url)
        {
            alt.to_string()
        } else {
            self.recognize(&image_url, alt).await
        };
        format!("{body}{key}")
    }

    async fn rewrite_images(&mut self, text: &str, parked: &mut Parked) -> String {
        let images = captures(image_marker_re(), text);
        if images.is_empty() {
            return text.to_string();
        }
        let remained = char_len(
            image_marker_re()
                .replace_all(&parked.restore(text), "")
                .trim(),
        );

        let mut out = String::with_capacity(text.len());
        let mut last = 0usize;
        for m in images {
            out.push_str(&text[last..m.range.start]);
            last = m.range.end;
            let alt = m.first.trim();
            let src = parse_link_target(&m.second).url;
            let normalized = if src.is_empty() || src.starts_with('#') {
                None
            } else {
                normalize_url(&src, self.base_url)
            };
            let replacement = match normalized {
                Some(image_url) if self.is_used_image(&src, &image_url) => {
                    let key = self.push_reference("img", image_url.clone());
                    let body = if remained > self.cfg.standalone_text_chars
                        || char_len(alt) > self.cfg.short_alt_chars
                        || is_icon_like(&image_url)
                    {
                        alt.to_string()
                    } else {
                        self.recognize(&image_url, alt).await
                    };
                    format!("{body}{key}")
                }
                _ => alt.to_string(),
            };
            out.push_str(&parked.park(replacement));
        }
        out.push_str(&text[last..]);
        out
    }

    /// Returns `(text, markers_added, chars_replaced)`.
    fn rewrite_bare_urls(&mut self, text: &str) -> (String, usize, usize) {
        let ranges: Vec<Range<usize>> = bare_url_re().find_iter(text).map(|m| m.range()).collect();
        if ranges.is_empty() {
            return (text.to_string(), 0, 0);
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0usize;
        let mut count = 0usize;
        let mut chars = 0usize;
        for range in ranges {
            out.push_str(&text[last..range.start]);
            let raw = &text[range.clone()];
            last = range.end;
            match normalize_url(raw, self.base_url) {
                Some(url) => {
                    let key = self.push_reference("", url);
                    out.push_str(&key);
                    count += 1;
                    chars += char_len(raw);
                }
                None => out.push_str(raw),
            }
        }
        out.push_str(&text[last..]);
        (out, count, chars)
    }
}

/// Run the full pass over one page.
///
/// `recognized` is read before any recognizer call and updated with every
/// successful recognition. Recognition failures are logged and the image alt
/// text is kept; they never abort the page.
pub async fn preprocess(
    req: &PreprocessRequest,
    cfg: &PreprocessConfig,
    recognizer: Option<&dyn ImageRecognizer>,
    recognized: &mut RecognizedImages,
) -> PreprocessOutput {
    let markdown = req.markdown.replace([PARK_OPEN, PARK_CLOSE], "");
    let marked = mark_images(&squash_javascript_urls(&markdown));
    let mut sections = split_sections(&marked);

    let mut dropped_leading = false;
    let mut dropped_trailing = false;
    if sections.len() > 2 {
        if looks_like_navigation(&sections[0], cfg) {
            sections.remove(0);
            dropped_leading = true;
        }
        if sections.last().is_some_and(|s| looks_like_footer(s, cfg)) {
            sections.pop();
            dropped_trailing = true;
        }
    }
    tracing::debug!(
        base_url = %req.base_url,
        sections = sections.len(),
        dropped_leading,
        dropped_trailing,
        "split markdown"
    );

    let mut rewriter = SectionRewriter {
        base_url: &req.base_url,
        used_images: &req.used_images,
        existing_urls: &req.existing_urls,
        cfg,
        recognizer,
        recognized,
        references: ReferenceMap::new(),
    };

    let mut link_sections = Vec::new();
    let mut content_sections = Vec::new();
    for section in &sections {
        let rewritten = rewriter.rewrite(section).await;
        if rewritten.text.is_empty() {
            continue;
        }
        match classify(rewritten.ratio, cfg) {
            SectionKind::Links => link_sections.push(rewritten.text),
            SectionKind::Content => content_sections.push(rewritten.text),
        }
    }

    PreprocessOutput {
        references: rewriter.references,
        link_chunks: pack_chunks(&link_sections, cfg.max_chunk_chars),
        content_chunks: pack_chunks(&content_sections, cfg.max_chunk_chars),
        dropped_leading,
        dropped_trailing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiseflow_core::{Error, Result};

    const BASE: &str = "https://example.com/news/today.html";

    struct FakeRecognizer {
        answer: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl FakeRecognizer {
        fn answering(answer: &'static str) -> Self {
            Self {
                answer: Some(answer),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                answer: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ImageRecognizer for FakeRecognizer {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn recognize(&self, _image_url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .map(str::to_string)
                .ok_or_else(|| Error::Llm("vision HTTP 500".to_string()))
        }
    }

    fn request(markdown: &str) -> PreprocessRequest {
        PreprocessRequest {
            markdown: markdown.to_string(),
            base_url: BASE.to_string(),
            ..Default::default()
        }
    }

    async fn run(req: &PreprocessRequest) -> PreprocessOutput {
        let mut recognized = RecognizedImages::new();
        preprocess(req, &PreprocessConfig::default(), None, &mut recognized).await
    }

    fn all_text(out: &PreprocessOutput) -> String {
        out.link_chunks
            .iter()
            .chain(out.content_chunks.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn marker_count(text: &str) -> usize {
        Regex::new(r"\[(?:img)?\d+\]")
            .unwrap()
            .find_iter(text)
            .count()
    }

    #[tokio::test]
    async fn text_without_markers_has_no_references_on_repeat_runs() {
        let req = request("# Title\n\nPlain prose with no links at all.\n");
        let first = run(&req).await;
        let second = run(&req).await;
        assert!(first.references.is_empty());
        assert_eq!(first.references, second.references);
        assert_eq!(first.content_chunks, second.content_chunks);
    }

    #[tokio::test]
    async fn single_link_becomes_single_marker() {
        let req = request("Read the [full report](/reports/2024 \"Annual\") today.");
        let out = run(&req).await;
        assert_eq!(out.references.len(), 1);
        assert_eq!(
            out.references.get("[1]").map(String::as_str),
            Some("https://example.com/reports/2024")
        );
        let text = all_text(&out);
        assert_eq!(marker_count(&text), 1);
        assert!(text.contains("Annual - full report[1]"), "got {text:?}");
    }

    #[tokio::test]
    async fn link_dense_and_prose_sections_are_classified_apart() {
        let links = run(&request("[Alpha](/a)\n[Beta](/b)\n[Gamma](/c)\n")).await;
        assert_eq!(links.link_chunks, vec!["Alpha[1]\nBeta[2]\nGamma[3]".to_string()]);
        assert!(links.content_chunks.is_empty());

        let prose = run(&request(
            "The central bank held rates steady on Tuesday, citing slowing inflation.",
        ))
        .await;
        assert!(prose.link_chunks.is_empty());
        assert_eq!(prose.content_chunks.len(), 1);
    }

    #[test]
    fn classification_threshold_is_strict_below() {
        let cfg = PreprocessConfig::default();
        assert_eq!(classify(89.9, &cfg), SectionKind::Links);
        assert_eq!(classify(90.0, &cfg), SectionKind::Content);
        assert_eq!(classify(NO_MARKER_RATIO, &cfg), SectionKind::Content);
    }

    #[tokio::test]
    async fn drops_leading_navigation_and_trailing_footer() {
        let prose = "Lorem ipsum dolor sit amet, consectetur adipiscing. ".repeat(8);
        let md = format!(
            "[Home](/) [News](/news) [About](/about)\n# Big story\n{prose}\n# Footer\nCopyright [Privacy](/privacy)\n"
        );
        let out = run(&request(&md)).await;
        assert!(out.dropped_leading);
        assert!(out.dropped_trailing);
        assert!(out.references.is_empty());
        assert_eq!(out.content_chunks.len(), 1);
        assert!(out.content_chunks[0].starts_with("# Big story"));
        assert!(!all_text(&out).contains("Privacy"));
    }

    #[tokio::test]
    async fn urls_inside_link_text_do_not_add_markers() {
        let cases = [
            ("Visit [www.a.com](http://www.a.com) now.", "Visit [1] now.", "http://www.a.com/"),
            (
                "[Read more at https://x.com/story](https://x.com/story)",
                "Read more at https://x.com/story[1]",
                "https://x.com/story",
            ),
            ("[http://foo.com/a](https://foo.com/a)", "[1]", "https://foo.com/a"),
        ];
        for (md, text, url) in cases {
            let out = run(&request(md)).await;
            assert_eq!(all_text(&out), text, "input {md:?}");
            assert_eq!(out.references.len(), 1, "input {md:?}");
            assert_eq!(out.references.get("[1]").map(String::as_str), Some(url));
        }
    }

    #[tokio::test]
    async fn image_alt_urls_stay_text() {
        let mut req = request("![see https://cdn.example.com/x](/img/a.png) and more words around it");
        req.used_images.insert("/img/a.png".to_string());
        let out = run(&req).await;
        assert_eq!(out.references.len(), 1);
        assert_eq!(
            out.references.get("[img1]").map(String::as_str),
            Some("https://example.com/img/a.png")
        );
    }

    fn three_sections(nav: &str, tail: &str) -> String {
        let prose = "Lorem ipsum dolor sit amet, consectetur adipiscing. ".repeat(8);
        format!("{nav}\n# Story\n{prose}\n# Footer\n{tail}")
    }

    #[tokio::test]
    async fn navigation_ratio_must_exceed_the_threshold() {
        let tail = "y".repeat(300);
        // 1 link / 20 non-link chars == 0.05: kept.
        let at = three_sections(&format!("[Home](/) {}", "x".repeat(20)), &tail);
        assert!(!run(&request(&at)).await.dropped_leading);
        // 1 / 19 > 0.05: dropped.
        let over = three_sections(&format!("[Home](/) {}", "x".repeat(19)), &tail);
        assert!(run(&request(&over)).await.dropped_leading);
    }

    #[tokio::test]
    async fn footer_needs_fewer_than_198_chars() {
        // "# Footer\n" is 9 chars.
        let kept = three_sections("[Home](/) [News](/news)", &"y".repeat(189));
        assert!(!run(&request(&kept)).await.dropped_trailing);
        let dropped = three_sections("[Home](/) [News](/news)", &"y".repeat(188));
        assert!(run(&request(&dropped)).await.dropped_trailing);
    }

    fn link_text_shape() -> impl proptest::strategy::Strategy<Value = String> {
        use proptest::prelude::*;
        let words = "[a-z]{1,10}( [a-z]{1,10}){0,3}";
        let url = "https?://[a-z]{1,10}\\.com(/[a-z]{1,8})?";
        let www = "www\\.[a-z]{1,10}\\.org";
        prop_oneof![
            proptest::string::string_regex(words).unwrap(),
            proptest::string::string_regex(url).unwrap(),
            proptest::string::string_regex(www).unwrap(),
            (
                proptest::string::string_regex(words).unwrap(),
                proptest::string::string_regex(url).unwrap()
            )
                .prop_map(|(w, u)| format!("{w} {u}")),
        ]
    }

    proptest::proptest! {
        #[test]
        fn one_link_one_marker(
            text in link_text_shape(),
            target in "(https://t\\.example\\.com)?/[a-z]{1,8}",
            before in "[a-z ]{0,20}",
            after in "[a-z ]{0,20}",
        ) {
            let req = request(&format!("{before}[{text}]({target}){after}"));
            let out = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(run(&req));
            proptest::prop_assert_eq!(out.references.len(), 1);
            proptest::prop_assert_eq!(marker_count(&all_text(&out)), 1);
        }
    }

    #[tokio::test]
    async fn two_section_pages_keep_everything() {
        let out = run(&request("[Home](/)\n# Short\ntiny\n")).await;
        assert!(!out.dropped_leading);
        assert!(!out.dropped_trailing);
        assert!(all_text(&out).contains("tiny"));
    }

    #[tokio::test]
    async fn non_navigational_links_collapse_to_text() {
        let out = run(&request(
            "[Top](#top) [Mail](mailto:a@b.c) [Click](<javascript:void(0)>) plain words here",
        ))
        .await;
        assert!(out.references.is_empty());
        let text = all_text(&out);
        assert!(text.contains("Top Mail Click plain words here"), "got {text:?}");
    }

    #[tokio::test]
    async fn bare_urls_become_markers() {
        let out = run(&request(
            "See https://example.org/report.pdf for details and www.other.net/page too.",
        ))
        .await;
        assert_eq!(
            out.references.get("[1]").map(String::as_str),
            Some("https://example.org/report.pdf")
        );
        assert_eq!(
            out.references.get("[2]").map(String::as_str),
            Some("https://www.other.net/page")
        );
        assert!(all_text(&out).starts_with("See [1] for details and [2] too."));
    }

    #[tokio::test]
    async fn link_text_equal_to_its_url_is_not_marked_twice() {
        let out = run(&request("Source: [https://a.org/x](https://a.org/x)")).await;
        assert_eq!(out.references.len(), 1);
        assert_eq!(all_text(&out), "Source: [1]");
    }

    #[tokio::test]
    async fn standalone_images_need_to_be_used_by_the_page() {
        let md = "Quarterly revenue grew.\n\n![Revenue chart for Q3](https://cdn.example.com/chart.png)\n";
        let unused = run(&request(md)).await;
        assert!(unused.references.is_empty());
        assert!(all_text(&unused).contains("Revenue chart for Q3"));

        let mut req = request(md);
        req.used_images
            .insert("https://cdn.example.com/chart.png".to_string());
        let used = run(&req).await;
        assert_eq!(
            used.references.get("[img1]").map(String::as_str),
            Some("https://cdn.example.com/chart.png")
        );
        assert!(all_text(&used).contains("Revenue chart for Q3[img1]"));
    }

    #[tokio::test]
    async fn lonely_images_are_recognized_once_and_cached() {
        let mut req = request("![](/img/scan.png)");
        req.used_images.insert("/img/scan.png".to_string());
        let recognizer = FakeRecognizer::answering("Hello from the image");
        let mut recognized = RecognizedImages::new();
        let cfg = PreprocessConfig::default();

        let out = preprocess(&req, &cfg, Some(&recognizer), &mut recognized).await;
        assert_eq!(all_text(&out), "Hello from the image[img1]");
        assert_eq!(
            recognized
                .get("https://example.com/img/scan.png")
                .map(String::as_str),
            Some("Hello from the image")
        );

        let again = preprocess(&req, &cfg, Some(&recognizer), &mut recognized).await;
        assert_eq!(all_text(&again), "Hello from the image[img1]");
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recognition_failures_keep_alt_and_are_not_cached() {
        let mut req = request("![ab](/img/scan.png)");
        req.used_images.insert("/img/scan.png".to_string());
        let recognizer = FakeRecognizer::failing();
        let mut recognized = RecognizedImages::new();
        let out = preprocess(
            &req,
            &PreprocessConfig::default(),
            Some(&recognizer),
            &mut recognized,
        )
        .await;
        assert_eq!(all_text(&out), "ab[img1]");
        assert!(recognized.is_empty());
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn images_inside_links_get_their_own_marker_first() {
        let recognizer = FakeRecognizer::answering("SALE 50%");
        let mut recognized = RecognizedImages::new();
        let req = request("[![](/banner.jpg)](/promo) and [![](/logo.svg)](/home)");
        let out = preprocess(
            &req,
            &PreprocessConfig::default(),
            Some(&recognizer),
            &mut recognized,
        )
        .await;
        assert_eq!(all_text(&out), "SALE 50%[img1][2] and [img3][4]");
        assert_eq!(
            out.references.get("[img1]").map(String::as_str),
            Some("https://example.com/banner.jpg")
        );
        assert_eq!(
            out.references.get("[2]").map(String::as_str),
            Some("https://example.com/promo")
        );
        assert_eq!(
            out.references.get("[img3]").map(String::as_str),
            Some("https://example.com/logo.svg")
        );
        // The svg logo is icon-like and never reaches the recognizer.
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn known_link_targets_skip_recognition() {
        let recognizer = FakeRecognizer::answering("unused");
        let mut recognized = RecognizedImages::new();
        let mut req = request("[![](/thumb.png)](/story/1)");
        req.existing_urls
            .insert("https://example.com/story/1".to_string());
        let out = preprocess(
            &req,
            &PreprocessConfig::default(),
            Some(&recognizer),
            &mut recognized,
        )
        .await;
        assert_eq!(all_text(&out), "[img1][2]");
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn long_content_is_chunked_under_the_ceiling() {
        let line = format!("{}\n", "word ".repeat(10).trim_end());
        let body = line.repeat(1_000);
        let out = run(&request(&body)).await;
        let cfg = PreprocessConfig::default();
        assert!(out.content_chunks.len() >= 2);
        assert!(out
            .content_chunks
            .iter()
            .all(|c| c.chars().count() <= cfg.max_chunk_chars));
        assert_eq!(out.content_chunks.concat(), body.trim());
    }

    #[test]
    fn splits_only_on_top_level_headers() {
        let sections = split_sections("intro\n# One\ntext\n## Sub\nmore\n# Two\nend\n");
        assert_eq!(
            sections,
            vec![
                "intro\n".to_string(),
                "# One\ntext\n## Sub\nmore\n".to_string(),
                "# Two\nend\n".to_string(),
            ]
        );
        assert_eq!(split_sections("\n\n# Only\nx"), vec!["# Only\nx".to_string()]);
    }
}
