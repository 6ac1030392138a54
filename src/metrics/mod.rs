//! Prometheus exporter for the processed-alert counter.
//!
//! Every scrape asks the store for a fresh count; nothing is cached.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::shutdown::wait_for_shutdown;
use crate::store::RecordCounter;

const TARGET_METRICS: &str = "metrics";

/// Prometheus text exposition format
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Point-in-time view of the exported metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub alert_count_total: u64,
}

impl MetricsSnapshot {
    pub fn render(&self) -> String {
        format!(
            "# HELP alert_count Total count of processed security alerts\n\
             # TYPE alert_count counter\n\
             alert_count_total {}\n",
            self.alert_count_total
        )
    }
}

pub fn router(counter: Arc<dyn RecordCounter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .with_state(counter)
}

async fn metrics(State(counter): State<Arc<dyn RecordCounter>>) -> Response {
    let counted = tokio::task::spawn_blocking(move || counter.count()).await;

    match counted {
        Ok(Ok(alert_count_total)) => {
            let snapshot = MetricsSnapshot { alert_count_total };
            (
                [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
                snapshot.render(),
            )
                .into_response()
        }
        Ok(Err(err)) => {
            error!(target: TARGET_METRICS, error = %err, "Failed to count stored records");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(err) => {
            error!(target: TARGET_METRICS, error = %err, "Count task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Bind `addr` and serve until `shutdown` flips.
pub async fn serve(
    addr: SocketAddr,
    counter: Arc<dyn RecordCounter>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, counter, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    counter: Arc<dyn RecordCounter>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(target: TARGET_METRICS, %local_addr, "Metrics exporter listening");

    axum::serve(listener, router(counter))
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await?;

    info!(target: TARGET_METRICS, "Metrics exporter stopped");
    Ok(())
}
