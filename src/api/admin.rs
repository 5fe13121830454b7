//! Admin API endpoints
//!
//! Operator-only endpoints, guarded by `Authorization: Bearer
//! <admin.provision_token>`. Without a configured token every route
//! answers 403.

use axum::{
    Router, async_trait,
    extract::{FromRef, FromRequestParts, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    extract::WithRejection,
    headers::{Authorization, authorization::Bearer},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::federation::{ActorDocument, DeliveryOutcome, HostIdentity, build_create_note_activity};

/// Create admin router
///
/// Routes:
/// - POST /admin/actor - Provision the local actor
/// - GET /admin/actor/key - Export the private key for backup
/// - POST /admin/actor/notes - Publish a note to every follower
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/actor", post(provision_actor))
        .route("/actor/key", get(export_private_key))
        .route("/actor/notes", post(publish_note))
}

/// Proof that the request carries the operator token
#[derive(Debug, Clone, Copy)]
pub struct Operator;

fn tokens_match(expected: &str, provided: &str) -> bool {
    expected.len() == provided.len()
        && expected
            .bytes()
            .zip(provided.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[async_trait]
impl<S> FromRequestParts<S> for Operator
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let expected = state
            .config
            .admin
            .provision_token
            .as_deref()
            .ok_or(AppError::Forbidden)?;

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, &state)
                .await
                .map_err(|_| AppError::Unauthorized)?;

        if !tokens_match(expected, bearer.token()) {
            return Err(AppError::Unauthorized);
        }
        Ok(Operator)
    }
}

/// POST /admin/actor
///
/// Generates the local actor's keypair. A second call answers 409 and
/// keeps the existing key.
async fn provision_actor(
    State(state): State<AppState>,
    _operator: Operator,
) -> Result<impl IntoResponse, AppError> {
    let host = HostIdentity::from_config(&state.config.server);
    let actor = state.identity.provision(host).await?;
    let document: ActorDocument = actor.profile_document();

    Ok((StatusCode::CREATED, Json(document)))
}

/// Private key export
#[derive(Debug, Serialize)]
struct KeyExportResponse {
    key_id: String,
    private_key_pem: String,
}

/// GET /admin/actor/key
///
/// Returns the PKCS#8 private key for operator backup tooling.
async fn export_private_key(
    State(state): State<AppState>,
    _operator: Operator,
) -> Result<Json<KeyExportResponse>, AppError> {
    let actor = state.identity.require().await?;
    tracing::warn!(key_id = %actor.key_id(), "Private key exported by operator");

    Ok(Json(KeyExportResponse {
        key_id: actor.key_id().to_string(),
        private_key_pem: actor.export_private_key_for_audit()?,
    }))
}

#[derive(Debug, Deserialize)]
struct PublishNoteRequest {
    content: String,
}

/// Per-inbox delivery report
#[derive(Debug, Serialize)]
struct InboxReport {
    inbox: String,
    outcome: &'static str,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

#[derive(Debug, Serialize)]
struct PublishNoteResponse {
    activity_id: Option<String>,
    delivered: usize,
    failed: usize,
    inboxes: Vec<InboxReport>,
}

/// POST /admin/actor/notes
///
/// Wraps the text in a Create{Note} addressed to the followers collection
/// and delivers it to every follower inbox. Shared inboxes are posted once.
async fn publish_note(
    State(state): State<AppState>,
    _operator: Operator,
    WithRejection(Json(request), _): WithRejection<Json<PublishNoteRequest>, AppError>,
) -> Result<Json<PublishNoteResponse>, AppError> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("content must not be empty".to_string()));
    }

    let actor = state.identity.require().await?;
    let activity = build_create_note_activity(&actor, content, actor.followers());
    let inboxes = state
        .followers
        .list()
        .await?
        .into_iter()
        .map(|follower| follower.inbox)
        .collect();

    let results = state
        .delivery
        .deliver_to_many(&activity, inboxes, actor.clone())
        .await;

    let delivered = results
        .iter()
        .filter(|r| r.outcome == DeliveryOutcome::Accepted)
        .count();
    Ok(Json(PublishNoteResponse {
        activity_id: activity.id().map(str::to_string),
        delivered,
        failed: results.len() - delivered,
        inboxes: results
            .into_iter()
            .map(|r| InboxReport {
                inbox: r.inbox_uri,
                outcome: r.outcome.as_str(),
                attempts: r.attempts,
                status: r.status_code,
            })
            .collect(),
    }))
}
