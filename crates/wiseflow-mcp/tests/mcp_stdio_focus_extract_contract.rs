use std::net::SocketAddr;

const PAGE: &str = "# Chip export rules tightened\n\
Officials announced new export rules for advanced chips on Monday, covering several categories of equipment and software. \
The rules take effect next month and apply to all shipments leaving the country. Read the [full notice](https://gov.example.org/notice).\n\
# More\n[Chip rules explained](/chips)\n[Sports](/sports)\n";

/// Fake OpenAI-compatible server that answers by prompt type.
async fn fake_llm() -> SocketAddr {
    use axum::{routing::post, Json, Router};

    let app = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<serde_json::Value>| async move {
            let system = body["messages"][0]["content"].as_str().unwrap_or("");
            let answer = if system.contains("page metadata") {
                r#"{"source": "Ministry of Commerce", "publish_date": "2026-03-02"}"#
            } else if system.contains("filtering") {
                "[2]"
            } else {
                r#"```json
[{"content": "New export rules for advanced chips take effect next month[1]"}]
```"#
            };
            Json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": answer}}]
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("axum serve");
    });
    addr
}

#[test]
fn wiseflow_mcp_stdio_focus_extract_contract() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async {
        use rmcp::{
            model::CallToolRequestParam,
            service::ServiceExt,
            transport::{ConfigureCommandExt, TokioChildProcess},
        };

        let addr = fake_llm().await;
        let tmp = tempfile::tempdir()?;
        let bin = assert_cmd::cargo::cargo_bin!("wiseflow");
        let service = ()
            .serve(TokioChildProcess::new(
                tokio::process::Command::new(bin).configure(|cmd| {
                    cmd.args(["mcp-stdio"]);
                    cmd.env("WISEFLOW_CACHE_DIR", tmp.path());
                    cmd.env("WISEFLOW_LLM_BASE_URL", format!("http://{addr}"));
                    cmd.env("WISEFLOW_PRIMARY_MODEL", "fake-chat");
                    cmd.env_remove("WISEFLOW_ENV_FILE");
                    cmd.env_remove("WISEFLOW_LLM_API_KEY");
                    cmd.env_remove("WISEFLOW_VL_MODEL");
                }),
            )?)
            .await?;

        let r = service
            .call_tool(CallToolRequestParam {
                name: "focus_extract".into(),
                arguments: Some(
                    serde_json::json!({
                        "focus": "chip export controls",
                        "focus_id": "fp-1",
                        "markdown": PAGE,
                        "base_url": "https://news.example.com/",
                        "use_vision": false
                    })
                    .as_object()
                    .cloned()
                    .unwrap(),
                ),
            })
            .await?;
        let s = r
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default();
        let v: serde_json::Value = serde_json::from_str(&s)?;

        assert_eq!(v["kind"].as_str(), Some("focus_extract"));
        assert_eq!(v["ok"].as_bool(), Some(true), "payload: {v}");
        assert_eq!(v["focus_id"].as_str(), Some("fp-1"));
        assert_eq!(v["author"].as_str(), Some("Ministry of Commerce"));
        assert_eq!(v["publish_date"].as_str(), Some("2026-03-02"));
        assert_eq!(
            v["related_urls"],
            serde_json::json!(["https://news.example.com/chips"])
        );

        let infos = v["infos"].as_array().expect("infos");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0]["focus_id"].as_str(), Some("fp-1"));
        assert_eq!(
            infos[0]["references"]["[1]"].as_str(),
            Some("https://gov.example.org/notice")
        );
        assert_eq!(v["stats"]["link_chunks"].as_u64(), Some(1));
        assert_eq!(v["stats"]["content_chunks"].as_u64(), Some(1));

        service.cancel().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
    .expect("mcp stdio focus_extract contract");
}
