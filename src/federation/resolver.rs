//! Remote actor resolution
//!
//! Fetches remote actor documents to learn their inbox and public key, and
//! caches the result. Concurrent misses for one actor share a single fetch.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use moka::future::Cache;
use rsa::RsaPublicKey;
use serde::Deserialize;

use super::identity::ACTIVITY_JSON;
use super::signature::decode_public_key_pem;
use super::transport::{HttpTransport, OutboundRequest, send_with_timeout, validate_remote_url};
use crate::config::FederationConfig;
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

const CACHE_NAME: &str = "remote_actor";

/// Cached projection of a remote actor
#[derive(Debug, Clone)]
pub struct RemoteActorRecord {
    pub id: String,
    pub inbox: String,
    pub public_key_id: String,
    pub public_key_pem: String,
    pub public_key: RsaPublicKey,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteActorDocument {
    id: Option<String>,
    inbox: Option<String>,
    public_key: Option<RemotePublicKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePublicKey {
    id: Option<String>,
    public_key_pem: Option<String>,
}

/// Strip the fragment, so `actor#main-key` and `actor` share a cache entry.
pub fn normalize_actor_id(id: &str) -> &str {
    id.split('#').next().unwrap_or(id)
}

/// Parse a fetched actor document.
///
/// # Errors
/// `RemoteActorMalformed` when the body is not JSON, the `id` differs from
/// `requested_id`, or `inbox`/`publicKey.id`/`publicKey.publicKeyPem` is
/// missing or unusable.
pub fn parse_actor_document(requested_id: &str, body: &[u8]) -> Result<RemoteActorRecord, AppError> {
    let malformed = |reason: &str| AppError::RemoteActorMalformed(format!("{}: {}", requested_id, reason));

    let document: RemoteActorDocument =
        serde_json::from_slice(body).map_err(|e| malformed(&format!("invalid JSON ({})", e)))?;

    let id = document
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing id"))?;
    if normalize_actor_id(&id) != normalize_actor_id(requested_id) {
        return Err(malformed(&format!("document id {} does not match", id)));
    }

    let inbox = document
        .inbox
        .filter(|inbox| !inbox.is_empty())
        .ok_or_else(|| malformed("missing inbox"))?;

    let public_key = document.public_key.ok_or_else(|| malformed("missing publicKey"))?;
    let public_key_id = public_key
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing publicKey.id"))?;
    let public_key_pem = public_key
        .public_key_pem
        .filter(|pem| !pem.is_empty())
        .ok_or_else(|| malformed("missing publicKey.publicKeyPem"))?;
    let decoded =
        decode_public_key_pem(&public_key_pem).ok_or_else(|| malformed("unparsable public key"))?;

    Ok(RemoteActorRecord {
        id,
        inbox,
        public_key_id,
        public_key_pem,
        public_key: decoded,
    })
}

/// Remote actor resolver
///
/// Resolution never retries; callers decide whether a failure is worth
/// another attempt.
pub struct RemoteActorResolver {
    transport: Arc<dyn HttpTransport>,
    cache: Cache<String, Arc<RemoteActorRecord>>,
    timeout: Duration,
    allow_private_hosts: bool,
}

impl RemoteActorResolver {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &FederationConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.actor_cache_capacity)
            .time_to_live(Duration::from_secs(config.actor_cache_ttl_seconds))
            .build();

        Self {
            transport,
            cache,
            timeout: config.request_timeout(),
            allow_private_hosts: config.allow_private_hosts,
        }
    }

    /// Resolve a remote actor by id (a key id with a fragment also works).
    ///
    /// # Errors
    /// - `RemoteActorUnreachable` on transport failure or a non-2xx response
    /// - `RemoteActorMalformed` on an unusable document or a refused URL
    pub async fn resolve(&self, actor_id: &str) -> Result<Arc<RemoteActorRecord>, AppError> {
        let key = normalize_actor_id(actor_id).to_string();

        if let Some(record) = self.cache.get(&key).await {
            CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
            tracing::debug!(actor = %key, "Remote actor cache hit");
            return Ok(record);
        }
        CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();

        self.cache
            .try_get_with(key.clone(), async {
                self.fetch(&key).await.map(Arc::new)
            })
            .await
            .map_err(|shared| rehydrate(&shared))
    }

    /// Drop the cached record and fetch it again.
    pub async fn refresh(&self, actor_id: &str) -> Result<Arc<RemoteActorRecord>, AppError> {
        self.invalidate(actor_id).await;
        self.resolve(actor_id).await
    }

    pub async fn invalidate(&self, actor_id: &str) {
        self.cache.invalidate(normalize_actor_id(actor_id)).await;
        tracing::debug!(actor = %actor_id, "Invalidated remote actor cache entry");
    }

    async fn fetch(&self, actor_id: &str) -> Result<RemoteActorRecord, AppError> {
        let url = validate_remote_url(actor_id, self.allow_private_hosts).map_err(|e| {
            AppError::RemoteActorMalformed(format!("{}: refused URL ({})", actor_id, e))
        })?;

        tracing::debug!(actor = %actor_id, "Fetching remote actor");
        let mut request = OutboundRequest::get(url.as_str());
        request
            .headers
            .insert(http::header::ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));

        let response = send_with_timeout(self.transport.as_ref(), request, self.timeout, "outbound")
            .await
            .map_err(|e| AppError::RemoteActorUnreachable(format!("{}: {}", actor_id, e)))?;

        if !response.is_success() {
            return Err(AppError::RemoteActorUnreachable(format!(
                "{}: HTTP {}",
                actor_id, response.status
            )));
        }

        let record = parse_actor_document(actor_id, &response.body)?;
        tracing::info!(actor = %record.id, inbox = %record.inbox, "Resolved remote actor");
        Ok(record)
    }
}

/// Errors from a coalesced fetch are shared; give each caller its own copy.
fn rehydrate(shared: &AppError) -> AppError {
    match shared {
        AppError::RemoteActorUnreachable(reason) => AppError::RemoteActorUnreachable(reason.clone()),
        AppError::RemoteActorMalformed(reason) => AppError::RemoteActorMalformed(reason.clone()),
        other => AppError::Internal(anyhow::anyhow!(other.to_string())),
    }
}
