//! Error types for Courier
//!
//! Every failure in the engine is an `AppError`. The variant decides both the
//! HTTP status returned to remote servers and the stable error code placed in
//! the JSON body, so clients never see internal error strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request body over the accepted size (413)
    #[error("Request body too large")]
    PayloadTooLarge,

    /// Entropy or key-source failure while generating the actor keypair (500)
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// A local actor already exists (409)
    #[error("Actor is already provisioned")]
    AlreadyProvisioned,

    /// The local private key could not produce a signature (500)
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Signature header absent or unparsable (401)
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Signature does not match the claimed key or actor (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Date header outside the accepted clock-skew window (401)
    #[error("Signature date outside the accepted window: {0}")]
    StaleSignature(String),

    /// Transport failure while fetching a remote actor (502)
    #[error("Remote actor unreachable: {0}")]
    RemoteActorUnreachable(String),

    /// Remote actor document lacks required fields (502)
    #[error("Remote actor document malformed: {0}")]
    RemoteActorMalformed(String),

    /// Inbound body is not a usable activity (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// Inbound activity could not be attributed to its claimed actor (401)
    #[error("Activity could not be authenticated")]
    UnauthenticatedActivity(#[source] Box<AppError>),

    /// Outbound delivery exhausted its retry budget (502)
    #[error("Delivery to {inbox} failed after {attempts} attempts: {reason}")]
    DeliveryFailed {
        inbox: String,
        attempts: u32,
        reason: String,
    },

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<axum::extract::rejection::QueryRejection> for AppError {
    fn from(rejection: axum::extract::rejection::QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<axum::extract::rejection::BytesRejection> for AppError {
    fn from(rejection: axum::extract::rejection::BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::Validation(rejection.body_text())
        }
    }
}

impl From<axum::extract::rejection::JsonRejection> for AppError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::Validation(rejection.body_text())
        }
    }
}

impl AppError {
    /// Wrap an authentication-phase failure for the inbox.
    pub fn unauthenticated(cause: AppError) -> Self {
        match cause {
            already @ AppError::UnauthenticatedActivity(_) => already,
            other => AppError::UnauthenticatedActivity(Box::new(other)),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::KeyGeneration(_) => "key_generation",
            AppError::AlreadyProvisioned => "already_provisioned",
            AppError::Signing(_) => "signing",
            AppError::MalformedSignature(_) => "malformed_signature",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::StaleSignature(_) => "stale_signature",
            AppError::RemoteActorUnreachable(_) => "remote_actor_unreachable",
            AppError::RemoteActorMalformed(_) => "remote_actor_malformed",
            AppError::MalformedActivity(_) => "malformed_activity",
            AppError::UnauthenticatedActivity(_) => "unauthenticated_activity",
            AppError::DeliveryFailed { .. } => "delivery_failed",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Only transport-level failures qualify; cryptographic and parsing
    /// failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::RemoteActorUnreachable(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized
            | AppError::MalformedSignature(_)
            | AppError::InvalidSignature(_)
            | AppError::StaleSignature(_)
            | AppError::UnauthenticatedActivity(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::MalformedActivity(_) => StatusCode::BAD_REQUEST,
            AppError::AlreadyProvisioned => StatusCode::CONFLICT,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RemoteActorUnreachable(_)
            | AppError::RemoteActorMalformed(_)
            | AppError::DeliveryFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::KeyGeneration(_)
            | AppError::Signing(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a remote client.
    fn public_message(&self) -> String {
        match self {
            AppError::KeyGeneration(_) => "Key generation failed".to_string(),
            AppError::Signing(_) => "Signing failed".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::UnauthenticatedActivity(cause) => {
                format!("Activity could not be authenticated ({})", cause.code())
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to its status code and a JSON body of the
    /// form `{"error": ..., "code": ...}`.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.code()]).inc();

        let body = Json(serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
