use std::sync::Arc;

use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scribe::config::{Config, LogFormat, LoggingConfig, Transport};
use scribe::mcp::{mcp_router, ScribeMcpServer};
use scribe::ocr::TesseractFactory;
use scribe::state::AppState;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "OCR server exposing Tesseract recognition as MCP tools")]
struct Args {
    /// Transport to serve MCP over: stdio or http
    #[arg(long)]
    transport: Option<Transport>,

    /// Bind address for the http transport
    #[arg(long)]
    host: Option<String>,

    /// Port for the http transport
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();

    let mut config = Config::from_env();
    if let Some(transport) = args.transport {
        config.server.transport = transport;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);
    config.validate()?;

    tracing::info!(
        "Initializing OCR engine pool: {} engine(s), language {}...",
        config.ocr.engine_pool_size,
        config.ocr.language
    );
    let state = AppState::new(config.clone(), Arc::new(TesseractFactory))?;

    let cancel_token = CancellationToken::new();
    let served = match config.server.transport {
        Transport::Stdio => serve_stdio(state.clone(), cancel_token.clone()).await,
        Transport::Http => serve_http(state.clone(), &config, cancel_token.clone()).await,
    };

    tracing::info!("Shutting down recognition service...");
    cancel_token.cancel();
    state.recognition.shutdown().await;

    served
}

/// Logs go to stderr; stdout belongs to the stdio transport.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("scribe={},tower_http=info", logging.level.to_lowercase()).into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Console => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn serve_stdio(state: AppState, cancel_token: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("Scribe serving MCP over stdio");

    let service = ScribeMcpServer::new(state).serve(stdio()).await?;
    tokio::select! {
        quit = service.waiting() => {
            let reason = quit?;
            tracing::info!(?reason, "MCP client disconnected");
        }
        _ = shutdown_signal(cancel_token) => {}
    }

    Ok(())
}

async fn serve_http(
    state: AppState,
    config: &Config,
    cancel_token: CancellationToken,
) -> anyhow::Result<()> {
    let app = mcp_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Scribe starting on http://{}", addr);
    tracing::info!("  Health check: http://{}/health", addr);
    tracing::info!("  MCP endpoint: http://{}{}", addr, config.server.mcp_path);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await?;

    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel_token.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, stopping...");
    cancel_token.cancel();
}
