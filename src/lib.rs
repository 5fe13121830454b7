//! Courier - a single-actor ActivityPub federation engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - WebFinger / actor profile                                │
//! │  - Inbox                                                    │
//! │  - Admin (provisioning)                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Engine                        │
//! │  - Identity & keys      - HTTP signatures                   │
//! │  - Actor resolver       - Delivery pipeline                 │
//! │  - Inbox state machine                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Follower store                                           │
//! │  - Received content store                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Storage collaborators
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::{
    ActivityDelivery, HostIdentity, HttpTransport, IdentityManager, InboxProcessor, LocalActor,
    RemoteActorResolver, ReqwestTransport,
};

/// Process exit code when the actor keypair cannot be generated at startup
pub const KEY_GENERATION_EXIT_CODE: i32 = 3;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Holder of the local actor and its keys
    pub identity: Arc<IdentityManager>,

    /// Remote actor cache
    pub resolver: Arc<RemoteActorResolver>,

    /// Outbound delivery
    pub delivery: ActivityDelivery,

    /// Inbox state machine
    pub inbox: Arc<InboxProcessor>,

    pub followers: Arc<dyn data::FollowerStore>,

    pub content: Arc<dyn data::ContentStore>,
}

impl AppState {
    /// Initialize application state with the reqwest transport
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let transport = ReqwestTransport::new(
            &config.federation.user_agent,
            config.federation.request_timeout(),
            config.federation.allow_private_hosts,
        )?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Initialize application state over any transport
    pub fn with_transport(config: config::AppConfig, transport: Arc<dyn HttpTransport>) -> Self {
        tracing::info!("Initializing application state...");

        let identity = Arc::new(IdentityManager::new(
            config.actor.username.clone(),
            config.actor.key_bits,
        ));
        let resolver = Arc::new(RemoteActorResolver::new(
            transport.clone(),
            &config.federation,
        ));
        let delivery = ActivityDelivery::new(transport, &config.federation);
        let followers: Arc<dyn data::FollowerStore> = Arc::new(data::InMemoryFollowerStore::new());
        let content: Arc<dyn data::ContentStore> =
            Arc::new(data::InMemoryContentStore::new(config.content.max_items));

        let inbox = Arc::new(InboxProcessor::new(
            identity.clone(),
            resolver.clone(),
            delivery.clone(),
            followers.clone(),
            content.clone(),
            &config.federation,
        ));

        Self {
            config: Arc::new(config),
            identity,
            resolver,
            delivery,
            inbox,
            followers,
            content,
        }
    }
}

/// Install the local actor at startup, if configured.
///
/// `actor.private_key_path` restores a backed-up key and wins over
/// `actor.provision_on_startup`.
///
/// # Errors
/// `KeyGeneration` when the key file is unreadable or invalid, or when a
/// fresh keypair cannot be generated.
pub async fn initialize_identity(state: &AppState) -> Result<(), error::AppError> {
    let host = HostIdentity::from_config(&state.config.server);

    if let Some(path) = &state.config.actor.private_key_path {
        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            error::AppError::KeyGeneration(format!("cannot read key file {}: {}", path, e))
        })?;
        let actor = LocalActor::from_private_key_pem(&host, &state.config.actor.username, &pem)?;
        state.identity.restore(actor).await?;
    } else if state.config.actor.provision_on_startup {
        state.identity.provision(host).await?;
    }

    Ok(())
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, extract::DefaultBodyLimit};
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .nest("/admin", api::admin_router())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
