use anyhow::{Context, Result};
use axum::Router;
use calendar_session_gateway::clock::{Clock, SystemClock};
use calendar_session_gateway::config::{AppConfig, SessionBackend};
use calendar_session_gateway::handlers::build_router;
use calendar_session_gateway::session::storage::{
    spawn_sweeper, FileSessionStore, InMemorySessionStore, SessionStore,
};
use calendar_session_gateway::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Present in the environment of every AWS Lambda invocation.
const LAMBDA_MARKER: &str = "AWS_LAMBDA_FUNCTION_NAME";

#[tokio::main]
async fn main() -> Result<()> {
    let in_lambda = std::env::var_os(LAMBDA_MARKER).is_some();

    // Config loading (SSM hydration included) logs before `log.level` is known.
    let config = {
        let _bootstrap = tracing::subscriber::set_default(subscriber("info", !in_lambda));
        AppConfig::load().await.context("failed to load configuration")?
    };
    init_tracing(&config.log.level, !in_lambda);

    let store = build_store(&config).await?;
    let port = config.server.port;
    let mode = config.mode();
    let state = Arc::new(AppState::new(config, store)?);
    let router = build_router(state);

    if in_lambda {
        return run_lambda(router).await;
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, mode = ?mode, "starting server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    let sweep_every = Duration::from_secs(config.session.sweep_interval_secs.max(1));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn SessionStore> = match config.session.backend {
        SessionBackend::Memory => Arc::new(InMemorySessionStore::new()),
        SessionBackend::File => Arc::new(
            FileSessionStore::new(&config.session.file_path)
                .context("failed to open session file")?,
        ),
        SessionBackend::Dynamodb => return dynamodb_store(config).await,
    };

    tracing::info!(backend = ?config.session.backend, every = ?sweep_every, "session sweeper started");
    spawn_sweeper(store.clone(), clock, sweep_every);
    Ok(store)
}

#[cfg(feature = "aws")]
async fn dynamodb_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    use calendar_session_gateway::session::dynamodb::DynamoSessionStore;

    let store = DynamoSessionStore::from_config(&config.dynamodb).await;
    store
        .ensure_table()
        .await
        .context("failed to prepare the session table")?;
    tracing::info!(table = %config.dynamodb.table, region = %config.dynamodb.region, "dynamodb session store ready");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "aws"))]
async fn dynamodb_store(_config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    anyhow::bail!("session.backend = dynamodb requires a build with the `aws` feature")
}

#[cfg(feature = "lambda")]
async fn run_lambda(router: Router) -> Result<()> {
    tracing::info!("serving through the lambda runtime");
    lambda_http::run(router)
        .await
        .map_err(|err| anyhow::anyhow!("lambda runtime failed: {err}"))
}

#[cfg(not(feature = "lambda"))]
async fn run_lambda(_router: Router) -> Result<()> {
    anyhow::bail!("{LAMBDA_MARKER} is set but the binary was built without the `lambda` feature")
}

/// `RUST_LOG` wins over `level`.
fn subscriber(level: &str, ansi: bool) -> impl tracing::Subscriber + Send + Sync + 'static {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .finish()
}

fn init_tracing(level: &str, ansi: bool) {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = tracing::subscriber::set_global_default(subscriber(level, ansi));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
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

    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_subscriber_sees_config_warnings() {
        assert!(!tracing::dispatcher::has_been_set());
        let _bootstrap = tracing::subscriber::set_default(subscriber("info", false));
        assert!(tracing::enabled!(tracing::Level::WARN));
    }
}
