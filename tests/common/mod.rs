//! Common test utilities for E2E tests
//!
//! Spins up the full router on an ephemeral port with a scripted federation
//! transport standing in for the remote servers.

#![allow(dead_code)]

pub mod schema_validator;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, Utc};
use courier::config::{
    ActorConfig, AdminConfig, AppConfig, ContentConfig, FederationConfig, LoggingConfig,
    ServerConfig,
};
use courier::federation::{
    HttpTransport, OutboundRequest, TransportError, TransportResponse, sign_request, signer_for,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use serde_json::{Value, json};

pub const OPERATOR_TOKEN: &str = "operator-token";
pub const TEST_DOMAIN: &str = "localhost";
pub const LOCAL_ACTOR_ID: &str = "http://localhost/u/test";
pub const ALICE_ID: &str = "https://remote.example/u/alice";
pub const ALICE_INBOX: &str = "https://remote.example/u/alice/inbox";
pub const ALICE_KEY_ID: &str = "https://remote.example/u/alice#main-key";

/// Alice's signing key, generated once per test binary
pub fn alice_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate alice key")
    })
}

pub fn actor_document(actor_id: &str, key: &RsaPrivateKey) -> Value {
    let pem = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .expect("encode public key");
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor_id,
        "type": "Person",
        "preferredUsername": "alice",
        "inbox": format!("{}/inbox", actor_id),
        "publicKey": {
            "id": format!("{}#main-key", actor_id),
            "owner": actor_id,
            "publicKeyPem": pem,
        }
    })
}

/// Stand-in for every remote server
///
/// GETs are answered from the registered documents (404 otherwise), POSTs
/// are recorded and answered with 202.
#[derive(Default)]
pub struct RemoteNetwork {
    documents: Mutex<HashMap<String, Value>>,
    gets: Mutex<Vec<String>>,
    posts: Mutex<Vec<OutboundRequest>>,
}

impl RemoteNetwork {
    pub fn serve(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), document);
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn posts(&self) -> Vec<OutboundRequest> {
        self.posts.lock().unwrap().clone()
    }

    /// Bodies of the POSTs sent to `inbox`, decoded as JSON
    pub fn posted_to(&self, inbox: &str) -> Vec<Value> {
        self.posts()
            .into_iter()
            .filter(|request| request.url == inbox)
            .filter_map(|request| request.body)
            .map(|body| serde_json::from_slice(&body).expect("posted body is JSON"))
            .collect()
    }

    /// Wait for at least `count` POSTs to reach `inbox`
    ///
    /// Follow replies are sent after the inbox has already answered, so
    /// tests poll for them.
    pub async fn wait_for_posts(&self, inbox: &str, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let posted = self.posted_to(inbox);
            if posted.len() >= count {
                return posted;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.posted_to(inbox)
    }

    /// Like `wait_for_posts`, then give stragglers a moment to show up
    pub async fn settled_posts(&self, inbox: &str, count: usize) -> Vec<Value> {
        self.wait_for_posts(inbox, count).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.posted_to(inbox)
    }
}

#[async_trait]
impl HttpTransport for RemoteNetwork {
    async fn execute(
        &self,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        if request.method == http::Method::GET {
            self.gets.lock().unwrap().push(request.url.clone());
            let document = self.documents.lock().unwrap().get(&request.url).cloned();
            return Ok(match document {
                Some(doc) => TransportResponse {
                    status: 200,
                    body: serde_json::to_vec(&doc).expect("serialize document"),
                },
                None => TransportResponse {
                    status: 404,
                    body: Vec::new(),
                },
            });
        }

        self.posts.lock().unwrap().push(request);
        Ok(TransportResponse {
            status: 202,
            body: Vec::new(),
        })
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: TEST_DOMAIN.to_string(),
            protocol: "http".to_string(),
        },
        actor: ActorConfig {
            username: "test".to_string(),
            key_bits: 1024,
            provision_on_startup: false,
            private_key_path: None,
        },
        federation: FederationConfig {
            delivery_backoff_base_ms: 1,
            ..FederationConfig::default()
        },
        admin: AdminConfig {
            provision_token: Some(OPERATOR_TOKEN.to_string()),
        },
        content: ContentConfig { max_items: 100 },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server wrapper
pub struct TestServer {
    pub addr: String,
    pub client: reqwest::Client,
    pub state: courier::AppState,
    pub network: Arc<RemoteNetwork>,
}

impl TestServer {
    /// Create a new test server with alice reachable on the fake network
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let network = Arc::new(RemoteNetwork::default());
        network.serve(ALICE_ID, actor_document(ALICE_ID, alice_key()));

        let state = courier::AppState::with_transport(config, network.clone());
        let app = courier::build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = format!("http://{}", listener.local_addr().expect("local addr"));

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            addr,
            client: reqwest::Client::new(),
            state,
            network,
        }
    }

    /// Get the full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST /admin/actor with the operator token
    pub async fn provision(&self) -> reqwest::Response {
        self.client
            .post(self.url("/admin/actor"))
            .bearer_auth(OPERATOR_TOKEN)
            .send()
            .await
            .expect("provision request")
    }

    /// POST an activity to the local inbox signed as alice
    pub async fn post_signed(&self, activity: &Value) -> reqwest::Response {
        self.post_signed_at(activity, alice_key(), ALICE_KEY_ID, Utc::now())
            .await
    }

    pub async fn post_signed_at(
        &self,
        activity: &Value,
        key: &RsaPrivateKey,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> reqwest::Response {
        let url = self.url("/u/test/inbox");
        let signed = sign_request("post", &url, &signer_for(key), key_id, now)
            .expect("sign inbound request");

        self.client
            .post(&url)
            .header("content-type", "application/activity+json")
            .header("date", signed.date)
            .header("signature", signed.signature)
            .body(serde_json::to_vec(activity).expect("serialize activity"))
            .send()
            .await
            .expect("inbox request")
    }
}

pub fn follow_from_alice(id: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Follow",
        "actor": ALICE_ID,
        "object": LOCAL_ACTOR_ID,
    })
}
