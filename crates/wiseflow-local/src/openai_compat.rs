//! OpenAI-compatible `chat/completions` client.
//!
//! Works against any server speaking the OpenAI wire format (SiliconFlow, vLLM,
//! Ollama's `/v1`, ...). Requests are bounded by a shared semaphore and wrapped
//! in [`RetryPolicy`].

use crate::env;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use wiseflow_core::{ChatBackend, ChatRequest, Error, Result};

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

fn base_url_from_env() -> Option<String> {
    env("WISEFLOW_LLM_BASE_URL")
}

fn api_key_from_env() -> Option<String> {
    env("WISEFLOW_LLM_API_KEY")
}

fn primary_model_from_env() -> Option<String> {
    env("WISEFLOW_PRIMARY_MODEL")
}

pub fn concurrency_from_env() -> usize {
    env("WISEFLOW_LLM_CONCURRENCY")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_CONCURRENCY)
        .clamp(1, 64)
}

pub fn timeout_ms_from_env() -> u64 {
    env("WISEFLOW_LLM_TIMEOUT_MS")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(500, 600_000)
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        }
    }

    /// Build from `WISEFLOW_LLM_*` env vars. `model_override` wins over
    /// `WISEFLOW_PRIMARY_MODEL`.
    pub fn from_env(client: reqwest::Client, model_override: Option<String>) -> Result<Self> {
        let base_url = base_url_from_env()
            .ok_or_else(|| Error::NotConfigured("missing WISEFLOW_LLM_BASE_URL".to_string()))?;
        let model = model_override.or_else(primary_model_from_env).ok_or_else(|| {
            Error::NotConfigured("missing model (set WISEFLOW_PRIMARY_MODEL)".to_string())
        })?;
        Ok(Self::new(client, base_url, api_key_from_env(), model)
            .with_timeout(Duration::from_millis(timeout_ms_from_env()))
            .with_concurrency(concurrency_from_env())
            .with_retry(RetryPolicy::from_env()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the request semaphore; clones made afterwards share it.
    pub fn with_concurrency(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    /// Same server and semaphore, different model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    fn endpoint_chat_completions(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    /// Send `messages` and return the first choice's text.
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        model: Option<&str>,
        temperature: Option<f64>,
        max_tokens: Option<u64>,
    ) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: model.unwrap_or(&self.model).to_string(),
            messages,
            max_tokens,
            temperature,
            stream: Some(false),
        };
        let (this, req) = (self, &req);
        // One permit per attempt; backoff sleeps do not hold a slot.
        self.retry
            .run("chat.completions", || async move {
                let _permit = this
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| Error::Llm(e.to_string()))?;
                this.send_once(req).await
            })
            .await
    }

    async fn send_once(&self, req: &ChatCompletionsRequest) -> Result<String> {
        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let t0 = std::time::Instant::now();
        let resp = rb
            .json(req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("chat.completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        tracing::debug!(
            model = %req.model,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "chat.completions ok"
        );
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = req.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(&req.user));
        self.complete(messages, req.model.as_deref(), req.temperature, req.max_tokens)
            .await
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    /// User turn carrying a prompt and one image (`https://...` or `data:` URL).
    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.into(),
                    },
                },
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
