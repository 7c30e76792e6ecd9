//! Shared operations behind the CLI subcommands and the MCP tools.
//!
//! Every operation returns a finished JSON envelope (`ok=false` payloads included),
//! so both surfaces print or return exactly the same shape.

use crate::envelope::{
    add_envelope_fields, error_payload, warning_hints_from, ErrorCode,
};
use std::path::PathBuf;
use std::time::Duration;
use wiseflow_core::{
    FocusPoint, ImageRecognizer, PageMeta, PreprocessOutput, PreprocessRequest, RecognizedImages,
};
use wiseflow_local::focus::extract_page;
use wiseflow_local::openai_compat::OpenAiCompatClient;
use wiseflow_local::preprocess::{preprocess, PreprocessConfig};
use wiseflow_local::vision::VisionRecognizer;
use wiseflow_local::{
    default_cache_dir, image_cache_ttl_from_env, CachedRecognizer, FsImageCache,
};

pub(crate) fn has_env(k: &str) -> bool {
    std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
}

/// Clients built once per process from the environment.
pub(crate) struct Runtime {
    llm: Option<OpenAiCompatClient>,
    recognizer: Option<CachedRecognizer<VisionRecognizer>>,
    cache_dir: PathBuf,
}

impl Runtime {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("wiseflow/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let cache_dir = default_cache_dir();

        let llm = match OpenAiCompatClient::from_env(http.clone(), None) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::debug!(error = %e, "primary LLM not configured");
                None
            }
        };
        let recognizer = match llm.as_ref().map(|l| VisionRecognizer::from_env(l, http.clone())) {
            Some(Ok(v)) => {
                let namespace = v.model().to_string();
                let cache = FsImageCache::new(cache_dir.join("images"))
                    .with_ttl(image_cache_ttl_from_env());
                Some(CachedRecognizer::new(v, cache, namespace))
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "vision model not configured");
                None
            }
            None => None,
        };
        Ok(Self {
            llm,
            recognizer,
            cache_dir,
        })
    }

    /// No LLM, no vision: preprocessing only.
    #[cfg(test)]
    pub(crate) fn offline(cache_dir: PathBuf) -> Self {
        Self {
            llm: None,
            recognizer: None,
            cache_dir,
        }
    }

    pub(crate) fn recognizer(&self) -> Option<&dyn ImageRecognizer> {
        self.recognizer.as_ref().map(|r| r as &dyn ImageRecognizer)
    }

    pub(crate) fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    /// Booleans and model names only; never key values.
    pub(crate) fn configured(&self) -> serde_json::Value {
        serde_json::json!({
            "llm": {
                "base_url": has_env("WISEFLOW_LLM_BASE_URL"),
                "api_key": has_env("WISEFLOW_LLM_API_KEY"),
                "primary_model": self.llm.as_ref().map(|l| l.model().to_string()),
            },
            "vision": {
                "vl_model": self.recognizer.as_ref().map(|r| r.inner().model().to_string()),
                "transport": self.recognizer.as_ref().map(|r| r.inner().transport().as_str()),
            },
            "cache_dir": self.cache_dir.to_string_lossy().to_string(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PreprocessParams {
    pub(crate) request: PreprocessRequest,
    pub(crate) use_vision: bool,
    pub(crate) max_chunk_chars: Option<usize>,
}

impl PreprocessParams {
    fn config(&self) -> PreprocessConfig {
        let mut cfg = PreprocessConfig::default();
        if let Some(n) = self.max_chunk_chars {
            cfg.max_chunk_chars = n.clamp(1_000, 200_000);
        }
        cfg
    }

    fn request_json(&self) -> serde_json::Value {
        serde_json::json!({
            "base_url": self.request.base_url,
            "markdown_chars": self.request.markdown.chars().count(),
            "used_images": self.request.used_images.len(),
            "existing_urls": self.request.existing_urls.len(),
            "use_vision": self.use_vision,
            "max_chunk_chars": self.config().max_chunk_chars,
        })
    }
}

fn validate_base_url(base_url: &str) -> Result<(), (ErrorCode, String, &'static str)> {
    if base_url.trim().is_empty() {
        return Err((
            ErrorCode::InvalidParams,
            "base_url must be non-empty".to_string(),
            "Pass the absolute URL the markdown was crawled from, like https://example.com/news/.",
        ));
    }
    match url::Url::parse(base_url.trim()) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => Ok(()),
        Ok(_) => Err((
            ErrorCode::InvalidUrl,
            format!("base_url is not an http(s) URL: {base_url}"),
            "Use an absolute http:// or https:// URL.",
        )),
        Err(e) => Err((
            ErrorCode::InvalidUrl,
            format!("base_url is not a valid URL: {e}"),
            "Use an absolute http:// or https:// URL.",
        )),
    }
}

async fn run_preprocess(
    rt: &Runtime,
    params: &PreprocessParams,
    warnings: &mut Vec<&'static str>,
) -> (PreprocessOutput, RecognizedImages) {
    let recognizer = if params.use_vision {
        let r = rt.recognizer();
        if r.is_none() {
            warnings.push("vision_not_configured");
        }
        r
    } else {
        None
    };
    let mut recognized = RecognizedImages::new();
    let output = preprocess(&params.request, &params.config(), recognizer, &mut recognized).await;
    if params.request.markdown.trim().is_empty() {
        warnings.push("empty_markdown");
    } else if output.is_empty() {
        warnings.push("no_sections_kept");
    }
    (output, recognized)
}

pub(crate) async fn preprocess_payload(rt: &Runtime, params: PreprocessParams) -> serde_json::Value {
    const KIND: &str = "markdown_preprocess";
    let t0 = std::time::Instant::now();
    if let Err((code, message, hint)) = validate_base_url(&params.request.base_url) {
        return error_payload(KIND, code, message, hint, params.request_json(), t0.elapsed().as_millis());
    }

    let mut warnings = Vec::new();
    let (output, recognized) = run_preprocess(rt, &params, &mut warnings).await;
    let mut payload = serde_json::json!({
        "ok": true,
        "references": output.references,
        "link_chunks": output.link_chunks,
        "content_chunks": output.content_chunks,
        "dropped_leading": output.dropped_leading,
        "dropped_trailing": output.dropped_trailing,
        "recognized_images": recognized,
        "warnings": warnings,
        "warning_hints": warning_hints_from(&warnings),
        "request": params.request_json(),
    });
    add_envelope_fields(&mut payload, KIND, t0.elapsed().as_millis());
    payload
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ExtractParams {
    pub(crate) preprocess: PreprocessParams,
    pub(crate) focus: FocusPoint,
    pub(crate) known_meta: PageMeta,
}

pub(crate) async fn extract_payload(rt: &Runtime, params: ExtractParams) -> serde_json::Value {
    const KIND: &str = "focus_extract";
    let t0 = std::time::Instant::now();
    let mut request = params.preprocess.request_json();
    request["focus_id"] = serde_json::json!(params.focus.id);
    request["focus"] = serde_json::json!(params.focus.focus);

    if params.focus.focus.trim().is_empty() {
        return error_payload(
            KIND,
            ErrorCode::InvalidParams,
            "focus must be non-empty",
            "Pass the focus point to extract, e.g. focus=\"semiconductor export controls\".",
            request,
            t0.elapsed().as_millis(),
        );
    }
    if let Err((code, message, hint)) = validate_base_url(&params.preprocess.request.base_url) {
        return error_payload(KIND, code, message, hint, request, t0.elapsed().as_millis());
    }
    let Some(llm) = rt.llm.as_ref() else {
        return error_payload(
            KIND,
            ErrorCode::NotConfigured,
            "no LLM configured",
            "Set WISEFLOW_LLM_BASE_URL and WISEFLOW_PRIMARY_MODEL (and WISEFLOW_LLM_API_KEY if the server needs one).",
            request,
            t0.elapsed().as_millis(),
        );
    };

    let mut warnings = Vec::new();
    let (output, recognized) = run_preprocess(rt, &params.preprocess, &mut warnings).await;
    if output.content_chunks.is_empty() {
        warnings.push("no_content_chunks");
    }
    if output.link_chunks.is_empty() {
        warnings.push("no_link_chunks");
    }
    let extraction = extract_page(llm, &params.focus, &output, &params.known_meta).await;

    let mut payload = serde_json::json!({
        "ok": true,
        "focus_id": extraction.focus_id,
        "related_urls": extraction.related_urls,
        "infos": extraction.infos,
        "author": extraction.meta.author,
        "publish_date": extraction.meta.publish_date,
        "references": output.references,
        "recognized_images": recognized,
        "stats": {
            "link_chunks": output.link_chunks.len(),
            "content_chunks": output.content_chunks.len(),
        },
        "warnings": warnings,
        "warning_hints": warning_hints_from(&warnings),
        "request": request,
    });
    add_envelope_fields(&mut payload, KIND, t0.elapsed().as_millis());
    payload
}

pub(crate) fn meta_payload(rt: &Runtime, tools: &[&str]) -> serde_json::Value {
    let t0 = std::time::Instant::now();
    let mut payload = serde_json::json!({
        "ok": true,
        "name": "wiseflow",
        "version": env!("CARGO_PKG_VERSION"),
        "configured": rt.configured(),
        "tools": tools,
        "defaults": {
            "max_chunk_chars": PreprocessConfig::default().max_chunk_chars,
            "content_ratio": PreprocessConfig::default().content_ratio,
        },
    });
    add_envelope_fields(&mut payload, "wiseflow_meta", t0.elapsed().as_millis());
    payload
}
