//! WebFinger protocol implementation
//!
//! Maps `acct:user@domain` to the local actor's profile URL.

use serde::{Deserialize, Serialize};

use super::identity::ACTIVITY_JSON;
use crate::error::AppError;

/// Media type of WebFinger responses
pub const JRD_JSON: &str = "application/jrd+json";

/// WebFinger JRD response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

impl WebFingerResponse {
    /// The `self` link pointing at the ActivityPub actor
    pub fn self_link(&self) -> Option<&WebFingerLink> {
        self.links
            .iter()
            .find(|link| link.rel == "self" && link.link_type.as_deref() == Some(ACTIVITY_JSON))
    }
}

/// WebFinger link
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Generate WebFinger response for the local actor.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - Actor profile URL
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url.to_string()),
        }],
    }
}

/// Split a WebFinger `resource` into `(username, domain)`.
///
/// Accepts `acct:user@domain` and the bare `user@domain` form.
pub fn parse_acct_resource(resource: &str) -> Result<(&str, &str), AppError> {
    let acct = resource.strip_prefix("acct:").unwrap_or(resource);
    let (username, domain) = acct
        .split_once('@')
        .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

    if username.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(AppError::Validation("Invalid acct format".to_string()));
    }

    Ok((username, domain))
}
