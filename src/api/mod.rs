//! HTTP API surface for the Detector process. JSON in, JSON
//! out, mounted behind `tower-http`'s tracing and permissive-CORS layers.

mod handlers;

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::workers::{DetectorWorker, ParserWorker};

/// Shared state behind every handler: the two workers, so the API can both
/// read model/queue state and trigger manual queue drains.
pub struct AppState {
    pub parser: Arc<ParserWorker>,
    pub detector: Arc<DetectorWorker>,
    pub model_dir: std::path::PathBuf,
    pub backups_dir: std::path::PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    handlers::routes()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Bind and serve the Detector HTTP API until the process is signaled to
/// stop (the graceful-shutdown contract is handled by the caller,
/// which drops this future on SIGINT/SIGTERM).
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(%host, port, "detector API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
