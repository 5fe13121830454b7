//! Prometheus metrics endpoint

use axum::{
    Router,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::{HTTP_REQUESTS_TOTAL, REGISTRY};

/// Render the registry in Prometheus text format.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

async fn metrics_handler() -> Response {
    match render_metrics() {
        Ok(text) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["GET", "/metrics", "200"])
                .inc();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
                text,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Exposes `/metrics`. Mounted outside the stateful router.
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(metrics_handler))
}
