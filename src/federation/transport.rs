//! Outbound HTTP transport
//!
//! The resolver and the delivery pipeline talk to remote servers only through
//! [`HttpTransport`], so tests can swap the network for an in-process fake.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use axum::async_trait;
use http::{HeaderMap, Method};
use thiserror::Error;

use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }
}

/// Status and body of a completed exchange
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure before a response status was received
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Sends requests to remote servers
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: OutboundRequest)
    -> Result<TransportResponse, TransportError>;
}

const MAX_REDIRECTS: usize = 3;

/// Redirect policy that re-checks every hop with [`validate_remote_url`].
///
/// A refused hop stops the chain and hands back the 3xx response, which
/// callers treat as a non-2xx answer.
fn redirect_policy(allow_private_hosts: bool) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match validate_remote_url(attempt.url().as_str(), allow_private_hosts) {
            Ok(_) => attempt.follow(),
            Err(e) => {
                tracing::warn!(target_url = %attempt.url(), error = %e, "Refusing redirect");
                attempt.stop()
            }
        }
    })
}

/// reqwest-backed transport used in production
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        allow_private_hosts: bool,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(redirect_policy(allow_private_hosts))
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(Duration::ZERO)
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?
            .to_vec();

        Ok(TransportResponse { status, body })
    }
}

/// Run one request with an upper time bound and record federation metrics.
pub async fn send_with_timeout(
    transport: &dyn HttpTransport,
    request: OutboundRequest,
    timeout: Duration,
    direction: &str,
) -> Result<TransportResponse, TransportError> {
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, transport.execute(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    };

    FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&[direction])
        .observe(started.elapsed().as_secs_f64());
    let status = match &result {
        Ok(response) => response.status.to_string(),
        Err(TransportError::Timeout(_)) => "timeout".to_string(),
        Err(_) => "error".to_string(),
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&[direction, &status])
        .inc();

    result
}

fn is_blocked_ip_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_unspecified()
                || v6.is_multicast()
        }
    }
}

/// Check a remote URL before the engine contacts it.
///
/// # Errors
/// - `Validation` for non-http(s) schemes, user info or a missing host
/// - `Forbidden` for loopback and private hosts unless `allow_private_hosts`
pub fn validate_remote_url(raw: &str, allow_private_hosts: bool) -> Result<url::Url, AppError> {
    let url = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid remote URL {}: {}", raw, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::Validation(
            "Remote URL must use http or https".to_string(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(AppError::Validation(
            "Remote URL must not include user info".to_string(),
        ));
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Remote URL must include a host".to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if !allow_private_hosts {
        if host == "localhost" || host.ends_with(".localhost") {
            return Err(AppError::Forbidden);
        }
        if host.parse::<IpAddr>().is_ok_and(is_blocked_ip_address) {
            return Err(AppError::Forbidden);
        }
    }

    Ok(url)
}
