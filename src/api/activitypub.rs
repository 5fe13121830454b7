//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Followers collection

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use axum_extra::extract::WithRejection;
use std::sync::Arc;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, ACTIVITYSTREAMS_CONTEXT, InboundRequest, LocalActor,
};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /u/:username - Actor profile
/// - POST /u/:username/inbox - Personal inbox
/// - GET /u/:username/followers - Followers collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/u/:username", get(actor))
        .route("/u/:username/inbox", post(inbox))
        .route("/u/:username/followers", get(followers))
}

/// The provisioned actor, if `username` names it
async fn local_actor(state: &AppState, username: &str) -> Result<Arc<LocalActor>, AppError> {
    let actor = state.identity.require().await?;
    if actor.username() != username {
        return Err(AppError::NotFound);
    }
    Ok(actor)
}

/// GET /u/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let actor = local_actor(&state, &username).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/u/:username", "200"])
        .inc();

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        Json(actor.profile_document()),
    ))
}

/// POST /u/:username/inbox
///
/// Receives incoming ActivityPub activities. 202 once the activity is
/// admitted, even when its type is ignored.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    WithRejection(body, _): WithRejection<Bytes, AppError>,
) -> Result<StatusCode, AppError> {
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    local_actor(&state, &username).await?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = InboundRequest {
        method: method.as_str(),
        path,
        headers: &headers,
        body: &body,
    };

    match state.inbox.process(request).await {
        Ok(outcome) => {
            tracing::info!(
                activity = ?outcome.activity_id,
                activity_type = %outcome.activity_type,
                duplicate = outcome.duplicate,
                "Activity admitted"
            );
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "accepted"])
                .inc();
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["POST", "/u/:username/inbox", "202"])
                .inc();
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", e.code()])
                .inc();
            Err(e)
        }
    }
}

/// GET /u/:username/followers
///
/// Returns the follower actor ids as an OrderedCollection.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let actor = local_actor(&state, &username).await?;
    let items: Vec<String> = state
        .followers
        .list()
        .await?
        .into_iter()
        .map(|f| f.actor_id)
        .collect();

    let collection = serde_json::json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": actor.followers(),
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    });

    Ok(([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(collection)))
}
