//! Inbox processing
//!
//! Every inbound activity moves through
//! `Received -> Parsed -> Authenticated -> Dispatched -> Completed`.
//! A parse or authentication failure ends in `Rejected` and nothing the
//! activity asks for is applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;

use super::activity::{
    Activity, Create, Follow, Note, build_accept_activity, build_create_note_activity,
};
use super::delivery::ActivityDelivery;
use super::identity::{IdentityManager, LocalActor};
use super::resolver::{RemoteActorRecord, RemoteActorResolver};
use super::signature::{InboundRequest, key_id_matches_actor, signature_from_headers, verify};
use crate::config::FederationConfig;
use crate::data::{ContentStore, FollowerStore, ReceivedContent};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// Inbox processing states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxState {
    Received,
    Parsed,
    Authenticated,
    Dispatched,
    Completed,
    Rejected,
}

/// Result of an admitted activity
#[derive(Debug, Clone)]
pub struct InboxOutcome {
    pub state: InboxState,
    pub activity_id: Option<String>,
    pub activity_type: String,
    /// The id was already processed; nothing was dispatched
    pub duplicate: bool,
    /// A handler acted on the activity (false for unknown types)
    pub handled: bool,
}

/// Inbox state machine
pub struct InboxProcessor {
    identity: Arc<IdentityManager>,
    resolver: Arc<RemoteActorResolver>,
    delivery: ActivityDelivery,
    followers: Arc<dyn FollowerStore>,
    content: Arc<dyn ContentStore>,
    /// `(actor, id)` pairs already admitted
    seen: Cache<(String, String), ()>,
    clock_skew: chrono::Duration,
    welcome_note: Option<String>,
}

impl InboxProcessor {
    pub fn new(
        identity: Arc<IdentityManager>,
        resolver: Arc<RemoteActorResolver>,
        delivery: ActivityDelivery,
        followers: Arc<dyn FollowerStore>,
        content: Arc<dyn ContentStore>,
        config: &FederationConfig,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(config.dedupe_capacity)
            .time_to_live(Duration::from_secs(config.dedupe_ttl_seconds))
            .build();

        Self {
            identity,
            resolver,
            delivery,
            followers,
            content,
            seen,
            clock_skew: config.clock_skew(),
            welcome_note: config.welcome_note.clone(),
        }
    }

    /// Process one inbound request
    ///
    /// # Errors
    /// - `NotFound` before the local actor is provisioned
    /// - `MalformedActivity` if the body is not a usable activity, or its id
    ///   is minted on a host other than the signing actor's
    /// - `UnauthenticatedActivity` if the signature cannot be attributed to
    ///   the claimed actor
    pub async fn process(&self, request: InboundRequest<'_>) -> Result<InboxOutcome, AppError> {
        let local = self.identity.require().await?;

        let activity = match Activity::parse(request.body) {
            Ok(activity) => activity,
            Err(e) => {
                ACTIVITIES_RECEIVED
                    .with_label_values(&["invalid", "rejected"])
                    .inc();
                return Err(e);
            }
        };
        let label = activity.metric_label();
        tracing::debug!(state = ?InboxState::Parsed, activity_type = %activity.kind(), "Inbox");

        let actor_id = match activity.actor_id() {
            Some(actor) if !actor.is_empty() => actor.to_string(),
            _ => {
                ACTIVITIES_RECEIVED.with_label_values(&[label, "rejected"]).inc();
                return Err(AppError::MalformedActivity("Missing actor".to_string()));
            }
        };

        let sender = match self.authenticate(&request, &actor_id).await {
            Ok(record) => record,
            Err(e) => {
                ACTIVITIES_RECEIVED.with_label_values(&[label, "rejected"]).inc();
                tracing::warn!(
                    state = ?InboxState::Rejected,
                    actor = %actor_id,
                    error = %e,
                    "Rejected unauthenticated activity"
                );
                return Err(AppError::unauthenticated(e));
            }
        };
        tracing::debug!(state = ?InboxState::Authenticated, actor = %actor_id, "Inbox");

        let activity_id = activity.id().map(str::to_string);
        if let Some(id) = &activity_id {
            if !same_host(id, &actor_id) {
                ACTIVITIES_RECEIVED.with_label_values(&[label, "rejected"]).inc();
                tracing::warn!(
                    state = ?InboxState::Rejected,
                    actor = %actor_id,
                    activity = %id,
                    "Rejected activity with an id outside the actor's host"
                );
                return Err(AppError::MalformedActivity(
                    "Activity id does not belong to the actor's host".to_string(),
                ));
            }

            let entry = self
                .seen
                .entry((actor_id.clone(), id.clone()))
                .or_insert(())
                .await;
            if !entry.is_fresh() {
                ACTIVITIES_RECEIVED.with_label_values(&[label, "duplicate"]).inc();
                tracing::info!(activity = %id, "Ignoring already processed activity");
                return Ok(InboxOutcome {
                    state: InboxState::Completed,
                    activity_id,
                    activity_type: activity.kind().to_string(),
                    duplicate: true,
                    handled: false,
                });
            }
        }

        let activity_type = activity.kind().to_string();
        let handled = self.dispatch(&local, activity, &sender).await;
        tracing::debug!(state = ?InboxState::Dispatched, activity_type = %activity_type, handled, "Inbox");

        ACTIVITIES_RECEIVED.with_label_values(&[label, "completed"]).inc();
        Ok(InboxOutcome {
            state: InboxState::Completed,
            activity_id,
            activity_type,
            duplicate: false,
            handled,
        })
    }

    /// Attribute the request to `actor_id`.
    ///
    /// A failed check is retried once against a freshly fetched actor, which
    /// covers a remote key rotation.
    async fn authenticate(
        &self,
        request: &InboundRequest<'_>,
        actor_id: &str,
    ) -> Result<Arc<RemoteActorRecord>, AppError> {
        let signature = signature_from_headers(request.headers)?;
        if !key_id_matches_actor(&signature.key_id, actor_id) {
            return Err(AppError::InvalidSignature(format!(
                "keyId {} does not belong to {}",
                signature.key_id, actor_id
            )));
        }

        let record = self.resolver.resolve(actor_id).await?;
        if self.signature_matches(request, &record, &signature.key_id)? {
            return Ok(record);
        }

        tracing::debug!(actor = %actor_id, "Signature mismatch, refetching actor");
        let record = self.resolver.refresh(actor_id).await?;
        if self.signature_matches(request, &record, &signature.key_id)? {
            return Ok(record);
        }

        Err(AppError::InvalidSignature(
            "Signature verification failed".to_string(),
        ))
    }

    fn signature_matches(
        &self,
        request: &InboundRequest<'_>,
        record: &RemoteActorRecord,
        key_id: &str,
    ) -> Result<bool, AppError> {
        if record.public_key_id != key_id {
            return Ok(false);
        }
        verify(request, &record.public_key, self.clock_skew, Utc::now())
    }

    async fn dispatch(
        &self,
        local: &Arc<LocalActor>,
        activity: Activity,
        sender: &RemoteActorRecord,
    ) -> bool {
        match activity {
            Activity::Follow(follow) => self.handle_follow(local, follow, sender).await,
            Activity::Create(create) => {
                self.handle_create(create).await;
                true
            }
            Activity::Note(note) => {
                self.handle_note(note).await;
                true
            }
            Activity::Accept(accept) => {
                tracing::info!(
                    actor = %accept.actor,
                    object = ?accept.object.id(),
                    "Received Accept"
                );
                true
            }
            Activity::Unknown(unknown) => {
                tracing::debug!(activity_type = %unknown.kind, "Ignoring unsupported activity type");
                false
            }
        }
    }

    async fn handle_follow(
        &self,
        local: &Arc<LocalActor>,
        follow: Follow,
        sender: &RemoteActorRecord,
    ) -> bool {
        if follow.object.id() != Some(local.id()) {
            tracing::info!(
                actor = %follow.actor,
                target = ?follow.object.id(),
                "Ignoring Follow for a non-local actor"
            );
            return false;
        }

        match self.followers.add(&follow.actor, &sender.inbox).await {
            Ok(true) => tracing::info!(follower = %follow.actor, "New follower"),
            Ok(false) => tracing::debug!(follower = %follow.actor, "Follower already recorded"),
            Err(e) => tracing::error!(follower = %follow.actor, error = %e, "Failed to record follower"),
        }

        let accept = build_accept_activity(local, &follow);
        let welcome = self
            .welcome_note
            .as_deref()
            .map(|text| build_create_note_activity(local, text, &follow.actor));
        let delivery = self.delivery.clone();
        let local = local.clone();
        let inbox = sender.inbox.clone();

        // Replies run detached. The inbound request is answered without
        // waiting on the remote inbox or the retry schedule.
        tokio::spawn(async move {
            let accepted = delivery.deliver_reported(&accept, &inbox, &local).await;
            tracing::info!(
                inbox = %accepted.inbox_uri,
                outcome = accepted.outcome.as_str(),
                attempts = accepted.attempts,
                "Accept delivery finished"
            );
            if let Some(note) = welcome {
                let welcomed = delivery.deliver_reported(&note, &inbox, &local).await;
                tracing::info!(
                    inbox = %welcomed.inbox_uri,
                    outcome = welcomed.outcome.as_str(),
                    attempts = welcomed.attempts,
                    "Welcome note delivery finished"
                );
            }
        });

        true
    }

    async fn handle_create(&self, create: Create) {
        let content = ReceivedContent {
            activity_id: create.id,
            actor: create.actor,
            object: create.object,
            received_at: Utc::now(),
        };
        if let Err(e) = self.content.store(content).await {
            tracing::error!(error = %e, "Failed to store received content");
        }
    }

    async fn handle_note(&self, note: Note) {
        let activity_id = note.id.clone();
        let actor = note.attributed_to.clone();
        let object = match serde_json::to_value(Activity::Note(note)) {
            Ok(object) => object,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode received Note");
                return;
            }
        };

        let content = ReceivedContent {
            activity_id,
            actor,
            object,
            received_at: Utc::now(),
        };
        if let Err(e) = self.content.store(content).await {
            tracing::error!(error = %e, "Failed to store received content");
        }
    }
}

/// Whether `activity_id` is minted on the same host as `actor_id`
fn same_host(activity_id: &str, actor_id: &str) -> bool {
    match (url::Url::parse(activity_id), url::Url::parse(actor_id)) {
        (Ok(activity), Ok(actor)) => {
            activity.host_str().is_some()
                && activity.host_str() == actor.host_str()
                && activity.port_or_known_default() == actor.port_or_known_default()
        }
        _ => false,
    }
}
