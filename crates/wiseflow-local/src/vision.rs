//! Vision-language image recognizer (image URL -> visible text).
//!
//! Two transports:
//! - `url`: hand the image URL to the model and let the provider fetch it.
//! - `inline`: download the image ourselves (bounded, retried) and send a base64
//!   `data:` URL. Needed when the provider cannot reach the image host.
//!
//! The model is told to answer `NA` for logos, icons and images without useful
//! text; that answer maps to an empty string.

use crate::env;
use crate::openai_compat::{Message, OpenAiCompatClient};
use crate::retry::RetryPolicy;
use base64::Engine;
use futures_util::StreamExt;
use std::time::Duration;
use wiseflow_core::{Error, ImageRecognizer, Result};

const DEFAULT_MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

pub const VL_PROMPT: &str = "Extract all text visible in this image, keeping its original language and reading order. \
If the image is a logo, an icon, a decorative picture, or contains no meaningful text, answer exactly NA. \
Output only the extracted text, with no explanation.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisionTransport {
    #[default]
    Url,
    Inline,
}

impl VisionTransport {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" => Some(Self::Url),
            "inline" | "base64" => Some(Self::Inline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Inline => "inline",
        }
    }
}

pub fn vl_model_from_env() -> Option<String> {
    env("WISEFLOW_VL_MODEL")
}

pub fn transport_from_env() -> VisionTransport {
    env("WISEFLOW_VL_TRANSPORT")
        .and_then(|s| VisionTransport::parse(&s))
        .unwrap_or_default()
}

/// Magic-byte sniffing for the raster formats vision models accept.
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn is_na(answer: &str) -> bool {
    let a = answer.trim().trim_end_matches('.').trim();
    a.eq_ignore_ascii_case("na") || a.eq_ignore_ascii_case("n/a")
}

#[derive(Debug, Clone)]
pub struct VisionRecognizer {
    llm: OpenAiCompatClient,
    http: reqwest::Client,
    transport: VisionTransport,
    max_image_bytes: usize,
    download_retry: RetryPolicy,
}

impl VisionRecognizer {
    pub fn new(llm: OpenAiCompatClient, http: reqwest::Client, transport: VisionTransport) -> Self {
        let download_retry = llm.retry().clone();
        Self {
            llm,
            http,
            transport,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            download_retry,
        }
    }

    /// Vision client sharing `llm`'s endpoint and request semaphore, using
    /// `WISEFLOW_VL_MODEL` and `WISEFLOW_VL_TRANSPORT`.
    pub fn from_env(llm: &OpenAiCompatClient, http: reqwest::Client) -> Result<Self> {
        let model = vl_model_from_env()
            .ok_or_else(|| Error::NotConfigured("missing WISEFLOW_VL_MODEL".to_string()))?;
        Ok(Self::new(llm.with_model(model), http, transport_from_env()))
    }

    pub fn with_max_image_bytes(mut self, max: usize) -> Self {
        self.max_image_bytes = max.max(1);
        self
    }

    pub fn with_download_retry(mut self, retry: RetryPolicy) -> Self {
        self.download_retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    pub fn transport(&self) -> VisionTransport {
        self.transport
    }

    async fn download_once(&self, image_url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let resp = self
            .http
            .get(image_url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("image download HTTP {status}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > self.max_image_bytes {
                return Err(Error::NotSupported(format!(
                    "image larger than {} bytes",
                    self.max_image_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok((bytes, content_type))
    }

    async fn data_url(&self, image_url: &str) -> Result<String> {
        let (bytes, content_type) = self
            .download_retry
            .run("image download", || self.download_once(image_url))
            .await?;
        let mime = content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .filter(|ct| ct.starts_with("image/") && *ct != "image/svg+xml")
            .map(str::to_string)
            .or_else(|| sniff_image_mime(&bytes).map(str::to_string))
            .ok_or_else(|| Error::NotSupported(format!("not a raster image: {image_url}")))?;
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{mime};base64,{data}"))
    }
}

#[async_trait::async_trait]
impl ImageRecognizer for VisionRecognizer {
    fn name(&self) -> &'static str {
        "openai_compat_vision"
    }

    async fn recognize(&self, image_url: &str) -> Result<String> {
        let image_ref = match self.transport {
            VisionTransport::Url => image_url.to_string(),
            VisionTransport::Inline => self.data_url(image_url).await?,
        };
        let answer = self
            .llm
            .complete(
                vec![Message::user_with_image(VL_PROMPT, image_ref)],
                None,
                Some(0.1),
                Some(1024),
            )
            .await?;
        if is_na(&answer) {
            return Ok(String::new());
        }
        Ok(answer.trim().to_string())
    }
}
