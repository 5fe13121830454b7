//! Shared fixtures for federation unit tests.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use axum::async_trait;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::identity::{HostIdentity, LocalActor};
use super::transport::{HttpTransport, OutboundRequest, TransportError, TransportResponse};

/// One 1024-bit key shared by every test; generation is slow.
pub(crate) fn test_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).expect("test key")
    })
}

/// A second, unrelated key for mismatch cases.
pub(crate) fn other_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).expect("test key")
    })
}

/// `https://example.social/u/test` backed by [`test_private_key`].
pub(crate) fn test_local_actor() -> LocalActor {
    let pem = test_private_key()
        .to_pkcs8_pem(LineEnding::LF)
        .expect("pkcs8");
    LocalActor::from_private_key_pem(
        &HostIdentity::new("example.social", "https"),
        "test",
        &pem,
    )
    .expect("actor")
}

pub(crate) fn public_key_pem(key: &RsaPrivateKey) -> String {
    RsaPublicKey::from(key)
        .to_public_key_pem(LineEnding::LF)
        .expect("pem")
}

/// Remote actor document whose key is `key`.
pub(crate) fn remote_actor_json(actor_id: &str, key: &RsaPrivateKey) -> serde_json::Value {
    serde_json::json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor_id,
        "type": "Person",
        "inbox": format!("{}/inbox", actor_id),
        "publicKey": {
            "id": format!("{}#main-key", actor_id),
            "owner": actor_id,
            "publicKeyPem": public_key_pem(key),
        }
    })
}

/// Scripted transport
///
/// GETs are answered from `documents`, POSTs get `post_status` and are
/// recorded. Unknown GET URLs yield 404.
#[derive(Default)]
pub(crate) struct FakeTransport {
    documents: Mutex<HashMap<String, serde_json::Value>>,
    post_failures: Mutex<u32>,
    post_status: Mutex<u16>,
    gets: Mutex<Vec<String>>,
    posts: Mutex<Vec<OutboundRequest>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            post_status: Mutex::new(202),
            ..Default::default()
        }
    }

    pub(crate) fn serve(&self, url: &str, document: serde_json::Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), document);
    }

    /// Fail the next `n` POSTs with a connection error.
    pub(crate) fn fail_posts(&self, n: u32) {
        *self.post_failures.lock().unwrap() = n;
    }

    pub(crate) fn respond_to_posts_with(&self, status: u16) {
        *self.post_status.lock().unwrap() = status;
    }

    pub(crate) fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub(crate) fn posts(&self) -> Vec<OutboundRequest> {
        self.posts.lock().unwrap().clone()
    }

    /// Wait until at least `count` POSTs are recorded, then let any
    /// straggler land before returning them.
    pub(crate) async fn settled_posts(&self, count: usize) -> Vec<OutboundRequest> {
        for _ in 0..200 {
            if self.posts.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.posts()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(
        &self,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        if request.method == http::Method::GET {
            self.gets.lock().unwrap().push(request.url.clone());
            return Ok(match self.documents.lock().unwrap().get(&request.url) {
                Some(doc) => TransportResponse {
                    status: 200,
                    body: serde_json::to_vec(doc).expect("json"),
                },
                None => TransportResponse {
                    status: 404,
                    body: Vec::new(),
                },
            });
        }

        self.posts.lock().unwrap().push(request);
        {
            let mut failures = self.post_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Connect("connection refused".to_string()));
            }
        }
        Ok(TransportResponse {
            status: *self.post_status.lock().unwrap(),
            body: Vec::new(),
        })
    }
}
