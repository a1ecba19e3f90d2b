use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use tgbridge_core::{Config, HttpConnector, MongoStore, StreamingService};
use tgbridge_server::web;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tgbridge=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        base_url = %config.base_url,
        identities = config.identity_tokens().len(),
        chunk_size = config.chunk_size,
        "starting tgbridge"
    );

    let store = match &config.database_url {
        Some(uri) => Some(
            MongoStore::new(uri, &config.database_name)
                .await
                .context("connecting to the document store")?,
        ),
        None => {
            tracing::warn!("DATABASE_URL not set; bandwidth persistence and user count disabled");
            None
        }
    };

    let connector = Arc::new(HttpConnector::new(config.api_base.clone()));
    let service = StreamingService::new(config.clone(), connector, store)
        .await
        .context("initializing streaming service")?;
    let _background = service.spawn_background_tasks();

    let app = web::router(service);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM so in-flight streams can finish draining.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, stopping server");
}
