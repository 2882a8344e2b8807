use anyhow::Context;
use axum::http::Request;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use nexus_webhook_responder::event_log::EventLog;
use nexus_webhook_responder::ingest::WebhookIngestor;
use nexus_webhook_responder::pipeline::ReplyPipeline;
use nexus_webhook_responder::providers::{GeminiGenerator, GraphApiSender, ResponseGenerator};
use nexus_webhook_responder::sentiment::LexiconClassifier;
use nexus_webhook_responder::{router, AppState, Broadcaster, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = std::env::var("DOTENV_PATH").unwrap_or_else(|_| ".env".into());
    let dotenv_loaded = Path::new(&dotenv).exists();
    if dotenv_loaded {
        dotenvy::from_path(&dotenv).with_context(|| format!("failed to load {dotenv}"))?;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    if dotenv_loaded {
        info!(path = %dotenv, "loaded environment file");
    }

    let config = Config::parse();
    config.validate().context("invalid configuration")?;

    let system_prompt = match std::fs::read_to_string(&config.system_prompt) {
        Ok(text) => text,
        Err(e) => {
            warn!(
                path = %config.system_prompt.display(),
                error = %e,
                "system prompt not readable; using an empty preamble"
            );
            String::new()
        }
    };

    let generator: Option<Arc<dyn ResponseGenerator>> = match &config.gemini_api_key {
        Some(key) if !key.trim().is_empty() => Some(Arc::new(GeminiGenerator::new(
            &config.gemini_api_base,
            &config.gemini_model,
            key,
        ))),
        _ => {
            warn!("GEMINI_API_KEY not set; replies will use canned text");
            None
        }
    };
    let pipeline = ReplyPipeline::new(
        Arc::new(LexiconClassifier),
        generator,
        Arc::new(GraphApiSender::new(&config.graph_api_base, &config.access_token)),
        system_prompt,
    );

    let ingestor = Arc::new(WebhookIngestor::new(config.ingest_config(), Arc::new(pipeline)));
    let broadcaster = Broadcaster::new(
        EventLog::restore(&config.events_file, config.log_capacity),
        config.subscriber_backlog,
    );
    let persist_task =
        broadcaster.spawn_persist_loop(config.events_file.clone(), config.persist_interval());

    let state = AppState::new(
        config.app_secret.as_bytes(),
        config.verify_token.clone(),
        config.keepalive(),
        Arc::clone(&ingestor),
        broadcaster.clone(),
    );

    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, account = %config.account_id, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;

    info!("shutting down");
    ingestor.shutdown();
    persist_task.abort();
    if let Err(e) = broadcaster.persist(&config.events_file).await {
        warn!(error = %e, "final persist failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
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
                warn!(error = %e, "failed to listen for SIGTERM");
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
