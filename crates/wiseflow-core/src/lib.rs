use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Whether repeating the same call could plausibly succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Llm(_) | Self::Cache(_))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Marker token (`[3]`, `[img2]`) -> absolute URL.
pub type ReferenceMap = BTreeMap<String, String>;

/// Image URL -> text recognized in that image.
pub type RecognizedImages = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Navigation-like sections dominated by links.
    Links,
    /// Prose sections worth sending to information extraction.
    Content,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessRequest {
    pub markdown: String,
    /// Base URL used to resolve relative links and image sources.
    pub base_url: String,
    /// Images known to belong to the page body. Standalone images outside this
    /// set collapse to their alt text.
    #[serde(default)]
    pub used_images: BTreeSet<String>,
    /// Page URLs already known to the caller.
    #[serde(default)]
    pub existing_urls: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessOutput {
    pub references: ReferenceMap,
    pub link_chunks: Vec<String>,
    pub content_chunks: Vec<String>,
    /// True when the leading section was dropped as navigation.
    pub dropped_leading: bool,
    /// True when the trailing section was dropped as a footer.
    pub dropped_trailing: bool,
}

impl PreprocessOutput {
    pub fn is_empty(&self) -> bool {
        self.link_chunks.is_empty() && self.content_chunks.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub user: String,
    /// Optional per-call model override.
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            user: user.into(),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn chat(&self, req: &ChatRequest) -> Result<String>;
}

/// Turns an image URL into the text visible in that image.
///
/// An empty string means "nothing worth keeping" (logo, icon, decorative image).
#[async_trait::async_trait]
pub trait ImageRecognizer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn recognize(&self, image_url: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusPoint {
    pub id: String,
    pub focus: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InfoItem {
    pub focus_id: String,
    pub content: String,
    /// Markers cited by `content`, resolved through the page's reference map.
    pub references: ReferenceMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageMeta {
    pub author: String,
    pub publish_date: String,
}
