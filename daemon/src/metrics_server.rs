//! Prometheus scrape endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tally_reconciler::ReconcilerMetrics;
use tokio::sync::broadcast;
use tracing::info;

/// Serve `GET /metrics` on `port` until `shutdown` fires.
pub async fn serve(
    metrics: Arc<ReconcilerMetrics>,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("metrics server shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Returns reconciler metrics in Prometheus text exposition format.
async fn metrics_handler(State(metrics): State<Arc<ReconcilerMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.encode(),
    )
}
