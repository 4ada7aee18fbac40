use anyhow::{Context, Result};
use axum::{Router, http::header, response::IntoResponse, routing::get};
use prometheus::{Encoder, IntCounterVec, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::relay::{Side, Termination};

lazy_static::lazy_static! {
    static ref RELAY_BYTES: IntCounterVec = prometheus::register_int_counter_vec!(
        "relay_bytes",
        "Number of bytes forwarded by relay sessions.",
        &["direction", "path"]
    )
    .unwrap();
    static ref RELAY_SESSIONS: IntCounterVec = prometheus::register_int_counter_vec!(
        "relay_sessions",
        "Number of finished relay sessions by termination reason.",
        &["reason"]
    )
    .unwrap();
}

pub(crate) fn record_bytes(from: Side, len: usize, spliced: bool) {
    let path = if spliced { "splice" } else { "copy" };
    RELAY_BYTES
        .with_label_values(&[from.direction(), path])
        .inc_by(len as u64);
}

pub(crate) fn record_session(termination: &Termination) {
    RELAY_SESSIONS
        .with_label_values(&[termination.reason()])
        .inc();
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buf)
        .context("encode metrics")?;
    String::from_utf8(buf).context("metrics are not utf8")
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MetricsServer {
    pub bind: SocketAddr,
}

impl MetricsServer {
    pub async fn listen(&self, shutdown: CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("bind metrics on {}", self.bind))?;
        let local = listener.local_addr().context("local_addr")?;
        let app = Router::new().route("/metrics", get(metrics_handler));
        info!("metrics listening on {}", local);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!("metrics server error: {}", e);
            }
        });
        Ok(local)
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", e),
        )
            .into_response(),
    }
}
