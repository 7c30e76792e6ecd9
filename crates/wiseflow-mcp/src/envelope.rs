use serde::Serialize;

pub(crate) const SCHEMA_VERSION: u64 = 1;

pub(crate) fn warning_hint(code: &'static str) -> Option<&'static str> {
    match code {
        "empty_markdown" => Some(
            "The markdown was empty or whitespace-only, so nothing was classified. Pass the page body as markdown.",
        ),
        "no_sections_kept" => Some(
            "Every section was dropped or empty after link rewriting. The page may be navigation-only; check the source markdown.",
        ),
        "vision_not_configured" => Some(
            "Image recognition was requested but no vision model is configured. Set WISEFLOW_VL_MODEL (and WISEFLOW_LLM_BASE_URL); images keep their alt text meanwhile.",
        ),
        "no_content_chunks" => Some(
            "The page has no content sections, so get_info had nothing to read. Only related links were extracted.",
        ),
        "no_link_chunks" => Some(
            "The page has no link-dense sections, so no related URLs were proposed.",
        ),
        _ => None,
    }
}

pub(crate) fn warning_hints_from(codes: &[&'static str]) -> serde_json::Value {
    let mut m = serde_json::Map::new();
    for c in codes {
        if let Some(h) = warning_hint(c) {
            m.insert((*c).to_string(), serde_json::json!(h));
        }
    }
    serde_json::Value::Object(m)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    InvalidParams,
    InvalidUrl,
    NotConfigured,
    NotSupported,
    LlmFailed,
    FetchFailed,
    CacheError,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::InvalidUrl => "invalid_url",
            Self::NotConfigured => "not_configured",
            Self::NotSupported => "not_supported",
            Self::LlmFailed => "llm_failed",
            Self::FetchFailed => "fetch_failed",
            Self::CacheError => "cache_error",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::LlmFailed | Self::FetchFailed | Self::CacheError => true,
            // Configuration + invalid input are not retryable without changing something.
            Self::NotConfigured
            | Self::NotSupported
            | Self::InvalidParams
            | Self::InvalidUrl
            | Self::UnexpectedError => false,
        }
    }

    pub(crate) fn from_error(e: &wiseflow_core::Error) -> Self {
        use wiseflow_core::Error;
        match e {
            Error::InvalidUrl(_) => Self::InvalidUrl,
            Error::Fetch(_) => Self::FetchFailed,
            Error::Cache(_) => Self::CacheError,
            Error::Llm(_) => Self::LlmFailed,
            Error::Parse(_) => Self::UnexpectedError,
            Error::NotConfigured(_) => Self::NotConfigured,
            Error::NotSupported(_) => Self::NotSupported,
        }
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

/// `ok=false` payload for `kind`, with the error object filled in.
pub(crate) fn error_payload(
    kind: &str,
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
    request: serde_json::Value,
    elapsed_ms: u128,
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "ok": false,
        "error": error_obj(code, message, hint),
        "request": request,
    });
    add_envelope_fields(&mut payload, kind, elapsed_ms);
    payload
}
