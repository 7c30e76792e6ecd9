use crate::pipeline::{
    extract_payload, meta_payload, preprocess_payload, ExtractParams, PreprocessParams, Runtime,
};
use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use wiseflow_core::{FocusPoint, PageMeta, PreprocessRequest};

pub(crate) const TOOL_NAMES: &[&str] = &["wiseflow_meta", "markdown_preprocess", "focus_extract"];

fn tool_result(payload: serde_json::Value) -> CallToolResult {
    // Structured content for machine consumers, plus a text fallback for clients
    // that only read `content[0].text`.
    let mut r = CallToolResult::structured(payload.clone());
    r.content = vec![Content::text(payload.to_string())];
    r
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct WiseflowMetaArgs {}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct MarkdownPreprocessArgs {
    /// Page body as markdown (required).
    #[serde(default)]
    markdown: Option<String>,
    /// Absolute URL the markdown was crawled from; relative links resolve against it (required).
    #[serde(default)]
    base_url: Option<String>,
    /// Image URLs known to belong to the page body. Other standalone images collapse to alt text.
    #[serde(default)]
    used_images: Option<Vec<String>>,
    /// Page URLs already known to the caller (image-only links to them skip recognition).
    #[serde(default)]
    existing_urls: Option<Vec<String>>,
    /// Send text-bearing images to the configured vision model (default: true).
    #[serde(default)]
    use_vision: Option<bool>,
    /// Chunk ceiling in characters (default: 29000).
    #[serde(default)]
    max_chunk_chars: Option<usize>,
}

impl MarkdownPreprocessArgs {
    fn into_params(self) -> PreprocessParams {
        PreprocessParams {
            request: PreprocessRequest {
                markdown: self.markdown.unwrap_or_default(),
                base_url: self.base_url.unwrap_or_default(),
                used_images: self.used_images.unwrap_or_default().into_iter().collect(),
                existing_urls: self
                    .existing_urls
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
            },
            use_vision: self.use_vision.unwrap_or(true),
            max_chunk_chars: self.max_chunk_chars,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct FocusExtractArgs {
    /// Focus point to extract information about (required).
    #[serde(default)]
    focus: Option<String>,
    /// Optional clarification of the focus point.
    #[serde(default)]
    explanation: Option<String>,
    /// Id copied into every returned info item (default: "focus").
    #[serde(default)]
    focus_id: Option<String>,
    /// Author/source if already known (skips asking the LLM).
    #[serde(default)]
    author: Option<String>,
    /// Publish date if already known, YYYY-MM-DD.
    #[serde(default)]
    publish_date: Option<String>,
    #[serde(flatten)]
    page: MarkdownPreprocessArgs,
}

#[derive(Clone)]
pub(crate) struct WiseflowMcp {
    tool_router: RmcpToolRouter<Self>,
    rt: Arc<Runtime>,
}

#[tool_router]
impl WiseflowMcp {
    pub(crate) fn new(rt: Runtime) -> Self {
        Self {
            tool_router: Self::tool_router(),
            rt: Arc::new(rt),
        }
    }

    #[tool(description = "Report wiseflow configuration + version (no secrets)")]
    async fn wiseflow_meta(
        &self,
        _params: Parameters<Option<WiseflowMetaArgs>>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(meta_payload(&self.rt, TOOL_NAMES)))
    }

    #[tool(
        description = "Split crawled markdown into link-dense and content chunks; links, images and bare URLs become numbered markers resolved by a reference map"
    )]
    async fn markdown_preprocess(
        &self,
        params: Parameters<Option<MarkdownPreprocessArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        tracing::debug!(base_url = ?args.base_url, "markdown_preprocess");
        Ok(tool_result(
            preprocess_payload(&self.rt, args.into_params()).await,
        ))
    }

    #[tool(
        description = "Preprocess a page, then ask the LLM for focus-related info items, related URLs, author and publish date"
    )]
    async fn focus_extract(
        &self,
        params: Parameters<Option<FocusExtractArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let extract = ExtractParams {
            focus: FocusPoint {
                id: args.focus_id.unwrap_or_else(|| "focus".to_string()),
                focus: args.focus.unwrap_or_default(),
                explanation: args.explanation.unwrap_or_default(),
            },
            known_meta: PageMeta {
                author: args.author.unwrap_or_default(),
                publish_date: args.publish_date.unwrap_or_default(),
            },
            preprocess: args.page.into_params(),
        };
        Ok(tool_result(extract_payload(&self.rt, extract).await))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for WiseflowMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "WiseFlow page preprocessing and focus extraction. Outputs are JSON and schema-versioned; LLM-backed tools need WISEFLOW_LLM_* env vars."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub(crate) async fn serve_stdio() -> Result<(), McpError> {
    let rt = Runtime::from_env().map_err(|e| McpError::internal_error(e.to_string(), None))?;
    let svc = WiseflowMcp::new(rt);
    let running = svc
        .serve(stdio())
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    // Keep the stdio server alive until the client closes.
    running
        .waiting()
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p<T>(v: T) -> Parameters<Option<T>> {
        Parameters(Some(v))
    }

    fn payload(r: &CallToolResult) -> serde_json::Value {
        if let Some(v) = r.structured_content.clone() {
            return v;
        }
        let s = r
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default();
        serde_json::from_str(&s).unwrap_or_else(|_| serde_json::json!({}))
    }

    fn server() -> (WiseflowMcp, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        (WiseflowMcp::new(Runtime::offline(tmp.path().to_path_buf())), tmp)
    }

    #[tokio::test]
    async fn meta_lists_the_tool_surface() {
        let (svc, _tmp) = server();
        let r = svc.wiseflow_meta(Parameters(None)).await.expect("call");
        let v = payload(&r);
        assert_eq!(v["ok"].as_bool(), Some(true));
        let tools: Vec<&str> = v["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t.as_str())
            .collect();
        assert_eq!(tools, TOOL_NAMES);
    }

    #[tokio::test]
    async fn markdown_preprocess_rewrites_links() {
        let (svc, _tmp) = server();
        let r = svc
            .markdown_preprocess(p(MarkdownPreprocessArgs {
                markdown: Some("Breaking: see https://example.org/a and [more](/b).".to_string()),
                base_url: Some("https://news.example.com/".to_string()),
                use_vision: Some(false),
                ..Default::default()
            }))
            .await
            .expect("call");
        let v = payload(&r);
        assert_eq!(v["ok"].as_bool(), Some(true));
        assert_eq!(v["references"]["[1]"].as_str(), Some("https://news.example.com/b"));
        assert_eq!(v["references"]["[2]"].as_str(), Some("https://example.org/a"));
    }

    #[tokio::test]
    async fn missing_params_are_invalid() {
        let (svc, _tmp) = server();
        let r = svc.markdown_preprocess(Parameters(None)).await.expect("call");
        let v = payload(&r);
        assert_eq!(v["ok"].as_bool(), Some(false));
        assert_eq!(v["error"]["code"].as_str(), Some("invalid_params"));

        let r = svc.focus_extract(Parameters(None)).await.expect("call");
        let v = payload(&r);
        assert_eq!(v["kind"].as_str(), Some("focus_extract"));
        assert_eq!(v["error"]["code"].as_str(), Some("invalid_params"));
    }

    #[test]
    fn focus_extract_args_flatten_page_fields() {
        let args: FocusExtractArgs = serde_json::from_value(serde_json::json!({
            "focus": "chips",
            "markdown": "# T\nbody",
            "base_url": "https://a.com/",
            "used_images": ["https://a.com/i.png"],
        }))
        .unwrap();
        let params = args.page.into_params();
        assert_eq!(params.request.base_url, "https://a.com/");
        assert!(params.request.used_images.contains("https://a.com/i.png"));
        assert!(params.use_vision);
    }
}
