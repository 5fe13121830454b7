//! Local actor identity
//!
//! Generates and holds the single local actor's RSA keypair and derives its
//! public documents (actor profile, WebFinger).

use std::fmt;
use std::sync::Arc;

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::signature::{RequestSigner, signer_for};
use super::webfinger::{WebFingerResponse, generate_webfinger_response};
use crate::config::ServerConfig;
use crate::error::AppError;

/// Media type of ActivityStreams documents
pub const ACTIVITY_JSON: &str = "application/activity+json";
/// ActivityStreams JSON-LD context
pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
/// Security vocabulary context (publicKey)
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Where the local actor is hosted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Public domain, optionally with port (e.g. "example.social")
    pub domain: String,
    /// "https" in production, "http" for local development
    pub protocol: String,
}

impl HostIdentity {
    pub fn new(domain: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            protocol: protocol.into(),
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(server.domain.clone(), server.protocol.clone())
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// The local actor
///
/// Owns the private key exclusively. Only the public parts are reachable
/// through serialization.
pub struct LocalActor {
    id: String,
    username: String,
    domain: String,
    inbox: String,
    followers: String,
    key_id: String,
    public_key_pem: String,
    private_key: RsaPrivateKey,
    signer: RequestSigner,
}

impl LocalActor {
    /// Generate a fresh keypair for `username` on `host`.
    ///
    /// # Errors
    /// `KeyGeneration` if the RNG or key encoder fails.
    pub fn generate(host: &HostIdentity, username: &str, bits: usize) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::KeyGeneration(e.to_string()))?;
        Self::from_private_key(host, username, private_key)
    }

    /// Rebuild the actor from a PKCS#8 PEM backup.
    pub fn from_private_key_pem(
        host: &HostIdentity,
        username: &str,
        private_key_pem: &str,
    ) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| AppError::KeyGeneration(format!("Invalid private key: {}", e)))?;
        Self::from_private_key(host, username, private_key)
    }

    fn from_private_key(
        host: &HostIdentity,
        username: &str,
        private_key: RsaPrivateKey,
    ) -> Result<Self, AppError> {
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::KeyGeneration(e.to_string()))?;

        let id = format!("{}/u/{}", host.base_url(), username);

        Ok(Self {
            inbox: format!("{}/inbox", id),
            followers: format!("{}/followers", id),
            key_id: format!("{}#main-key", id),
            id,
            username: username.to_string(),
            domain: host.domain.clone(),
            public_key_pem,
            signer: signer_for(&private_key),
            private_key,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub fn followers(&self) -> &str {
        &self.followers
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signer for outbound requests, built once with the actor
    pub(crate) fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    /// `user@domain`
    pub fn acct(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    /// SPKI PEM of the public key
    pub fn export_public_key(&self) -> &str {
        &self.public_key_pem
    }

    /// PKCS#8 PEM of the private key, for operator backup tooling only.
    ///
    /// Never log the returned value.
    pub fn export_private_key_for_audit(&self) -> Result<String, AppError> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("private key encoding: {}", e)))
    }

    /// Actor profile document served at the actor id
    pub fn profile_document(&self) -> ActorDocument {
        ActorDocument {
            context: vec![
                ACTIVITYSTREAMS_CONTEXT.to_string(),
                SECURITY_CONTEXT.to_string(),
            ],
            id: self.id.clone(),
            kind: "Person".to_string(),
            preferred_username: self.username.clone(),
            inbox: self.inbox.clone(),
            followers: self.followers.clone(),
            public_key: PublicKeyDocument {
                id: self.key_id.clone(),
                owner: self.id.clone(),
                public_key_pem: self.public_key_pem.clone(),
            },
        }
    }

    /// WebFinger document for `acct:username@domain`
    pub fn discovery_document(&self) -> WebFingerResponse {
        generate_webfinger_response(&self.username, &self.domain, &self.id)
    }
}

impl fmt::Debug for LocalActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalActor")
            .field("id", &self.id)
            .field("key_id", &self.key_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// ActivityPub Person document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub preferred_username: String,
    pub inbox: String,
    pub followers: String,
    pub public_key: PublicKeyDocument,
}

/// Public key advertised on the actor for HTTP signatures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyDocument {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

/// Process-wide holder of the local actor
///
/// Readers take an `Arc` snapshot, so a signature is always produced with one
/// consistent key. Provisioning is serialized and installs the actor with a
/// single write.
pub struct IdentityManager {
    actor: RwLock<Option<Arc<LocalActor>>>,
    provision_lock: Mutex<()>,
    username: String,
    key_bits: usize,
}

impl IdentityManager {
    pub fn new(username: impl Into<String>, key_bits: usize) -> Self {
        Self {
            actor: RwLock::new(None),
            provision_lock: Mutex::new(()),
            username: username.into(),
            key_bits,
        }
    }

    /// Create the local actor.
    ///
    /// A second call is rejected with `AlreadyProvisioned`; the existing key
    /// stays in place.
    pub async fn provision(&self, host: HostIdentity) -> Result<Arc<LocalActor>, AppError> {
        let _guard = self.provision_lock.lock().await;

        if self.actor.read().await.is_some() {
            return Err(AppError::AlreadyProvisioned);
        }

        tracing::info!(
            username = %self.username,
            domain = %host.domain,
            bits = self.key_bits,
            "Generating actor keypair..."
        );

        let username = self.username.clone();
        let bits = self.key_bits;
        let actor = tokio::task::spawn_blocking(move || LocalActor::generate(&host, &username, bits))
            .await
            .map_err(|e| AppError::KeyGeneration(format!("key generation task failed: {}", e)))??;

        let actor = Arc::new(actor);
        *self.actor.write().await = Some(actor.clone());

        tracing::info!(actor = %actor.id(), key_id = %actor.key_id(), "Actor provisioned");
        Ok(actor)
    }

    /// Install an actor restored from backup.
    ///
    /// Same policy as `provision`: refused once an actor exists.
    pub async fn restore(&self, actor: LocalActor) -> Result<Arc<LocalActor>, AppError> {
        let _guard = self.provision_lock.lock().await;
        let mut slot = self.actor.write().await;
        if slot.is_some() {
            return Err(AppError::AlreadyProvisioned);
        }

        let actor = Arc::new(actor);
        *slot = Some(actor.clone());
        tracing::info!(actor = %actor.id(), "Actor restored");
        Ok(actor)
    }

    /// Snapshot of the current actor, if provisioned
    pub async fn current(&self) -> Option<Arc<LocalActor>> {
        self.actor.read().await.clone()
    }

    /// Snapshot of the current actor, or `NotFound`
    pub async fn require(&self) -> Result<Arc<LocalActor>, AppError> {
        self.current().await.ok_or(AppError::NotFound)
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}
