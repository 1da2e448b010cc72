use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use slack_ai_bot::channels::SlackClient;
use slack_ai_bot::config::BotConfig;
use slack_ai_bot::llm::create_backends;
use slack_ai_bot::pipeline::{Orchestrator, OrchestratorDeps};
use slack_ai_bot::server::{AppState, slack_routes};
use slack_ai_bot::store::{IdempotencyCache, LibSqlIdempotencyCache, MemoryIdempotencyCache};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing();

    let config = BotConfig::from_env().context("Failed to load configuration")?;

    eprintln!("🤖 Slack AI bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Text model: {}", config.llm.openai.model);
    match config.llm.gemini {
        Some(ref gemini) => eprintln!(
            "   Images: {} (fallback {}), video: {}",
            gemini.image_model, config.llm.openai.image_model, gemini.video_model
        ),
        None => eprintln!("   Images: {}, video: disabled", config.llm.openai.image_model),
    }

    // ── Backends ────────────────────────────────────────────────────
    let backends = create_backends(&config.llm).context("Failed to create AI backends")?;

    // ── Slack ───────────────────────────────────────────────────────
    let slack = Arc::new(
        SlackClient::new(config.slack_bot_token.clone()).with_context_budget(config.max_context_chars),
    );

    // ── Dedup cache ─────────────────────────────────────────────────
    let cache: Arc<dyn IdempotencyCache> = match config.idempotency_db_path {
        Some(ref path) => {
            let cache = LibSqlIdempotencyCache::new_local(path, config.idempotency_ttl)
                .await
                .with_context(|| format!("Failed to open dedup database at {}", path.display()))?;
            eprintln!("   Dedup cache: {}", path.display());
            let cache = Arc::new(cache);
            let _purge_handle = spawn_purge_task(Arc::clone(&cache));
            cache as Arc<dyn IdempotencyCache>
        }
        None => {
            eprintln!("   Dedup cache: in-memory");
            Arc::new(MemoryIdempotencyCache::new(config.idempotency_ttl))
        }
    };

    // ── Orchestrator ────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(OrchestratorDeps {
        backends,
        sink: slack.clone(),
        context_loader: slack.clone(),
        fetcher: slack,
        stream: config.stream.clone(),
        executor: config.executor.clone(),
    }));

    // ── HTTP ────────────────────────────────────────────────────────
    let app = slack_routes(AppState {
        handler: orchestrator,
        cache,
        signing_secret: Some(config.slack_signing_secret.clone()),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    eprintln!("   Events: http://0.0.0.0:{}/slack/events\n", config.port);
    tracing::info!(port = config.port, "Slack event server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shut down");
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG` (default `info`). Setting
/// `LOG_DIR` also writes daily-rotated files there.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "slack-ai-bot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// Drop expired dedup rows every ten minutes.
fn spawn_purge_task(cache: Arc<LibSqlIdempotencyCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            match cache.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "Purged expired dedup tokens"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge dedup tokens"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
