//! `cinemail`: serves the movie summary workflow over HTTP.

use cinemail::config::{Config, Credentials, DeliveryMode};
use cinemail::providers::{OmdbClient, OpenAiSummarizer, ResendClient};
use cinemail::server::{build_router, AppState};
use cinemail::{
    DefaultClassifier, DeliveryStatusSource, DeliveryTracker, EventDispatcher, InMemoryOutcomeLog,
    JsonLinesOutcomeLog, OutcomeLog, PushedDeliveryStatus, StepMemo, StepRunner, WorkflowEngine,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cinemail", version, about = "Emails a movie summary when a movie is watched")]
struct Args {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, short, env = "CINEMAIL_CONFIG", default_value = "cinemail.toml")]
    config: PathBuf,

    /// Address to listen on, overriding `[server] bind`
    #[arg(long, env = "CINEMAIL_BIND")]
    bind: Option<SocketAddr>,

    /// Write logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    cinemail::telemetry::init_tracing(args.json_logs)?;

    let config = Config::load(&args.config).await?;
    let credentials = Credentials::from_env()?;

    let resend = Arc::new(
        ResendClient::new(credentials.resend_api_key, config.email.from.clone())?,
    );
    let pushed = match config.delivery.mode {
        DeliveryMode::Webhook => Some(Arc::new(PushedDeliveryStatus::new())),
        DeliveryMode::Poll => None,
    };
    let status_source: Arc<dyn DeliveryStatusSource> = match &pushed {
        Some(pushed) => pushed.clone(),
        None => resend.clone(),
    };

    let runner = StepRunner::new(
        Arc::new(StepMemo::new()),
        Arc::new(DefaultClassifier::new()),
        config.retry.policy()?,
    )
    .with_step_timeout(config.retry.step_timeout());

    let engine = WorkflowEngine::builder()
        .runner(runner)
        .movies(Arc::new(OmdbClient::new(credentials.omdb_api_key)?))
        .summarizer(Arc::new(OpenAiSummarizer::new(credentials.openai_api_key)?))
        .sender(resend)
        .tracker(DeliveryTracker::with_schedule(
            status_source,
            config.delivery.schedule(),
        ))
        .delivery_timeout(config.delivery.timeout())
        .build()?;

    let outcomes: Arc<dyn OutcomeLog> = match &config.outcome_log {
        Some(path) => Arc::new(JsonLinesOutcomeLog::open(path).await?),
        None => Arc::new(InMemoryOutcomeLog::new()),
    };

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::new(engine),
        outcomes,
        config.dispatch.dispatch_config(),
    ));
    let router = build_router(AppState {
        dispatcher: dispatcher.clone(),
        pushed,
    });

    let addr = args.bind.unwrap_or(config.server.bind);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, mode = ?config.delivery.mode, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    info!("stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
