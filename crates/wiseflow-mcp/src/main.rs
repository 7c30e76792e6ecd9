use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Read;
use wiseflow_core::{FocusPoint, PageMeta, PreprocessRequest};

mod envelope;
#[cfg(feature = "stdio")]
mod mcp;
mod pipeline;

use pipeline::{ExtractParams, PreprocessParams, Runtime};

#[derive(Parser, Debug)]
#[command(name = "wiseflow")]
#[command(about = "WiseFlow page preprocessing + focus extraction (CLI + MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for Cursor / MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Classify a markdown page into link/content chunks with a reference map (json).
    Preprocess(PreprocessCmd),
    /// Preprocess a page and extract focus-related info with the configured LLM (json).
    Extract(ExtractCmd),
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct PageArgs {
    /// URL the markdown was crawled from; relative links resolve against it.
    #[arg(long)]
    base_url: String,
    /// Markdown file to read (`-` or omitted: stdin).
    #[arg(long)]
    input: Option<String>,
    /// Image URL known to belong to the page body (repeatable).
    #[arg(long = "used-image")]
    used_images: Vec<String>,
    /// Page URL already known to the caller (repeatable).
    #[arg(long = "existing-url")]
    existing_urls: Vec<String>,
    /// Never call the vision model, even when configured.
    #[arg(long)]
    no_vision: bool,
    /// Chunk ceiling in characters.
    #[arg(long, env = "WISEFLOW_MAX_CHUNK_CHARS")]
    max_chunk_chars: Option<usize>,
}

impl PageArgs {
    fn into_params(self) -> Result<PreprocessParams> {
        let markdown = read_markdown(self.input.as_deref())?;
        Ok(PreprocessParams {
            request: PreprocessRequest {
                markdown,
                base_url: self.base_url,
                used_images: self.used_images.into_iter().collect(),
                existing_urls: self.existing_urls.into_iter().collect(),
            },
            use_vision: !self.no_vision,
            max_chunk_chars: self.max_chunk_chars,
        })
    }
}

#[derive(clap::Args, Debug)]
struct PreprocessCmd {
    #[command(flatten)]
    page: PageArgs,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct ExtractCmd {
    #[command(flatten)]
    page: PageArgs,
    /// Focus point to extract information about.
    #[arg(long)]
    focus: String,
    /// Optional clarification of the focus point.
    #[arg(long, default_value = "")]
    explanation: String,
    /// Id copied into every info item.
    #[arg(long, default_value = "focus")]
    focus_id: String,
    /// Author/source if already known.
    #[arg(long, default_value = "")]
    author: String,
    /// Publish date if already known (YYYY-MM-DD).
    #[arg(long, default_value = "")]
    publish_date: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Attempt a local stdio MCP handshake (list_tools) to prove an MCP client can start the server.
    ///
    /// This spawns a child `wiseflow mcp-stdio` process and calls `list_tools`. It never
    /// calls the LLM, and it does not print any secret values.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    check_stdio: bool,
    /// Timeout for the stdio handshake (ms).
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn read_markdown(input: Option<&str>) -> Result<String> {
    match input.map(str::trim) {
        None | Some("-") => {
            let mut s = String::new();
            std::io::stdin().read_to_string(&mut s)?;
            Ok(s)
        }
        Some(path) => Ok(std::fs::read_to_string(path)?),
    }
}

/// Optional env-file loader (opt-in via `WISEFLOW_ENV_FILE`).
///
/// Sets vars only when not already present in the process environment; never logs values.
fn load_env_file() {
    let Ok(p) = std::env::var("WISEFLOW_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        // Don't override explicit process env.
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable (JSON / MCP JSON-RPC).
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("WISEFLOW_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Print an envelope; `ok=false` exits non-zero after printing.
fn emit(payload: &serde_json::Value) {
    println!("{payload}");
    if !payload["ok"].as_bool().unwrap_or(false) {
        std::process::exit(1);
    }
}

fn print_preprocess_text(payload: &serde_json::Value) {
    if !payload["ok"].as_bool().unwrap_or(false) {
        println!(
            "error: {} ({})",
            payload["error"]["message"].as_str().unwrap_or(""),
            payload["error"]["code"].as_str().unwrap_or("")
        );
        std::process::exit(1);
    }
    for (label, key) in [("links", "link_chunks"), ("content", "content_chunks")] {
        if let Some(chunks) = payload[key].as_array() {
            for (i, c) in chunks.iter().enumerate() {
                println!("=== {label} chunk {} ===", i + 1);
                println!("{}", c.as_str().unwrap_or(""));
            }
        }
    }
    println!("=== references ===");
    if let Some(refs) = payload["references"].as_object() {
        for (k, v) in refs {
            println!("{k} {}", v.as_str().unwrap_or(""));
        }
    }
}

async fn doctor(args: DoctorCmd) -> Result<()> {
    let t0 = std::time::Instant::now();
    let rt = Runtime::from_env()?;
    let cache_dir = rt.cache_dir().to_path_buf();

    let mut checks: Vec<serde_json::Value> = Vec::new();

    // Check: cache dir is creatable + writable.
    let cache_ok = (|| -> anyhow::Result<()> {
        std::fs::create_dir_all(&cache_dir)?;
        let probe = cache_dir.join(format!(
            "wiseflow-doctor-{}.probe",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        ));
        std::fs::write(&probe, b"ok")?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    })()
    .is_ok();
    checks.push(serde_json::json!({
        "name": "cache_dir_writable",
        "ok": cache_ok,
        "message": if cache_ok { "cache dir is writable" } else { "cache dir is not writable" },
        "hint": if cache_ok { "" } else { "Set WISEFLOW_CACHE_DIR to a writable directory." },
    }));

    let llm_ok = pipeline::has_env("WISEFLOW_LLM_BASE_URL") && pipeline::has_env("WISEFLOW_PRIMARY_MODEL");
    checks.push(serde_json::json!({
        "name": "llm_configured",
        "ok": true,
        "configured": llm_ok,
        "message": if llm_ok { "LLM endpoint and primary model are set" } else { "LLM not configured; only preprocessing is available" },
        "hint": if llm_ok { "" } else { "Set WISEFLOW_LLM_BASE_URL and WISEFLOW_PRIMARY_MODEL to enable focus extraction." },
    }));

    let mut stdio_ok: Option<bool> = None;
    let mut stdio_tool_count: Option<usize> = None;
    let mut stdio_error: Option<serde_json::Value> = None;
    let mut stdio_elapsed_ms: Option<u128> = None;

    #[cfg(feature = "stdio")]
    if args.check_stdio {
        use rmcp::service::ServiceExt;
        use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
        use tokio::process::Command;

        let exe = std::env::current_exe().unwrap_or_else(|_| std::path::PathBuf::from("wiseflow"));
        let child = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
            cmd.args(["mcp-stdio"]);
            cmd.env("WISEFLOW_CACHE_DIR", &cache_dir);
            // The probe never needs the LLM.
            cmd.env_remove("WISEFLOW_LLM_API_KEY");
            cmd.env("WISEFLOW_LOG", "error");
        }))?;

        let service = ().serve(child).await?;
        let check_t0 = std::time::Instant::now();
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(args.timeout_ms),
            service.list_tools(Default::default()),
        )
        .await;
        stdio_elapsed_ms = Some(check_t0.elapsed().as_millis());

        match res {
            Ok(Ok(tools)) => {
                stdio_ok = Some(true);
                stdio_tool_count = Some(tools.tools.len());
            }
            Ok(Err(e)) => {
                stdio_ok = Some(false);
                stdio_error = Some(serde_json::json!({
                    "code": "handshake_failed",
                    "message": e.to_string(),
                    "hint": "The child closed the stdio transport or failed to list tools. Check that nothing prints to stdout in mcp-stdio mode and that the client runs `wiseflow mcp-stdio`."
                }));
            }
            Err(_elapsed) => {
                stdio_ok = Some(false);
                stdio_error = Some(serde_json::json!({
                    "code": "timeout",
                    "message": format!("stdio handshake timed out after {}ms", args.timeout_ms),
                    "hint": "The child did not respond to list_tools in time. Also verify WISEFLOW_CACHE_DIR is writable."
                }));
            }
        }

        let _ = service.cancel().await;
    }

    #[cfg(not(feature = "stdio"))]
    if args.check_stdio {
        stdio_ok = Some(false);
    }

    checks.push(serde_json::json!({
        "name": "mcp_stdio_handshake",
        "ok": if args.check_stdio { stdio_ok.unwrap_or(false) } else { true },
        "skipped": !args.check_stdio,
        "message": if !args.check_stdio {
            "stdio MCP handshake skipped"
        } else if stdio_ok.unwrap_or(false) {
            "stdio MCP handshake succeeded"
        } else {
            "stdio MCP handshake failed"
        },
        "hint": if !args.check_stdio || stdio_ok.unwrap_or(false) {
            ""
        } else if cfg!(feature = "stdio") {
            "Check that the MCP client points at the correct `wiseflow` binary and that WISEFLOW_CACHE_DIR is writable."
        } else {
            "`mcp-stdio` requires building with feature `stdio`."
        },
        "tool_count": stdio_tool_count,
        "elapsed_ms": stdio_elapsed_ms,
        "error": stdio_error,
    }));

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let payload = serde_json::json!({
        "schema_version": envelope::SCHEMA_VERSION,
        "kind": "doctor",
        "ok": ok,
        "name": "wiseflow",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "features": {
            "stdio": cfg!(feature = "stdio"),
        },
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": rt.configured(),
        "checks": checks,
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("wiseflow {} (ok={})", env!("CARGO_PKG_VERSION"), ok);
            println!(
                "cache_dir: {}",
                payload["configured"]["cache_dir"].as_str().unwrap_or("")
            );
            println!(
                "llm: base_url={} primary_model={} vl_model={}",
                payload["configured"]["llm"]["base_url"]
                    .as_bool()
                    .unwrap_or(false),
                payload["configured"]["llm"]["primary_model"]
                    .as_str()
                    .unwrap_or("-"),
                payload["configured"]["vision"]["vl_model"]
                    .as_str()
                    .unwrap_or("-"),
            );
            println!("checks:");
            if let Some(arr) = payload["checks"].as_array() {
                for c in arr {
                    let name = c["name"].as_str().unwrap_or("?");
                    let ok = c["ok"].as_bool().unwrap_or(false);
                    let skipped = c["skipped"].as_bool().unwrap_or(false);
                    if skipped {
                        println!("- {}: skipped", name);
                    } else {
                        println!("- {}: {}", name, if ok { "ok" } else { "fail" });
                    }
                }
            }
        }
        _ => println!("{payload}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Preprocess(args) => {
            let rt = Runtime::from_env()?;
            let params = args.page.into_params()?;
            let payload = pipeline::preprocess_payload(&rt, params).await;
            match args.output.to_ascii_lowercase().as_str() {
                "text" => print_preprocess_text(&payload),
                _ => emit(&payload),
            }
        }
        Commands::Extract(args) => {
            let rt = Runtime::from_env()?;
            let params = ExtractParams {
                preprocess: args.page.into_params()?,
                focus: FocusPoint {
                    id: args.focus_id,
                    focus: args.focus,
                    explanation: args.explanation,
                },
                known_meta: PageMeta {
                    author: args.author,
                    publish_date: args.publish_date,
                },
            };
            emit(&pipeline::extract_payload(&rt, params).await);
        }
        Commands::Doctor(args) => doctor(args).await?,
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": envelope::SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "wiseflow",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("wiseflow {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }

    Ok(())
}
