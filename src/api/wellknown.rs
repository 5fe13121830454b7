//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{JRD_JSON, parse_acct_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    WithRejection(Query(query), _): WithRejection<Query<WebFingerQuery>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let (username, domain) = parse_acct_resource(&query.resource)?;

    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let actor = state.identity.require().await?;
    if actor.username() != username {
        return Err(AppError::NotFound);
    }

    Ok((
        [(header::CONTENT_TYPE, JRD_JSON)],
        Json(actor.discovery_document()),
    ))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}
