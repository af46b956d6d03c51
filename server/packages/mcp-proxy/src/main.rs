use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use jetvision_mcp_proxy::app::ApiDoc;
use jetvision_mcp_proxy::catalog::ServerType;
use jetvision_mcp_proxy::{run_server, ServerConfig};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

#[derive(Debug, Parser)]
#[command(name = "jetvision-mcp-proxy")]
#[command(about = "SSE bridge and JSON-RPC forwarder for upstream MCP servers", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy HTTP server.
    Serve(ServeArgs),
    /// Print the OpenAPI document for the proxy route.
    Openapi,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, short = 'H')]
    host: Option<String>,

    #[arg(long, short = 'p')]
    port: Option<u16>,

    #[arg(long)]
    apollo_url: Option<String>,

    #[arg(long)]
    avinode_url: Option<String>,

    #[arg(long)]
    hackernews_url: Option<String>,

    /// Expiry for durable session entries; unset keeps them indefinitely.
    #[arg(long)]
    session_ttl_secs: Option<u64>,

    #[arg(long)]
    rpc_timeout_ms: Option<u64>,

    /// Largest accepted POST body in bytes.
    #[arg(long)]
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("server failed: {0}")]
    Server(String),
    #[error("failed to render openapi document: {0}")]
    Openapi(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "jetvision-mcp-proxy failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = server_config(args);
            run_server(config)
                .await
                .map_err(|err| CliError::Server(err.to_string()))
        }
        Command::Openapi => {
            let doc = serde_json::to_string_pretty(&ApiDoc::openapi())?;
            println!("{doc}");
            Ok(())
        }
    }
}

fn server_config(args: ServeArgs) -> ServerConfig {
    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    for (server_type, url) in [
        (ServerType::ApolloIo, args.apollo_url),
        (ServerType::Avinode, args.avinode_url),
        (ServerType::Hackernews, args.hackernews_url),
    ] {
        if let Some(url) = url {
            config.catalog.set_url(server_type, url);
        }
    }
    if let Some(secs) = args.session_ttl_secs {
        config.session_ttl = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(ms) = args.rpc_timeout_ms {
        config.rpc_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
    if let Some(limit) = args.max_body_bytes.filter(|limit| *limit > 0) {
        config.max_body_bytes = limit;
    }
    config
}
