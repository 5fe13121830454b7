//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes. Transport failures are
//! retried with exponential backoff; an HTTP response of any status ends the
//! attempt loop and is reported to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::HeaderValue;
use rand::Rng;

use super::activity::Activity;
use super::identity::{ACTIVITY_JSON, LocalActor};
use super::signature::sign_request;
use super::transport::{HttpTransport, OutboundRequest, send_with_timeout, validate_remote_url};
use crate::config::FederationConfig;
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, DELIVERY_ATTEMPTS_TOTAL};

const MAX_CONCURRENT: usize = 10;
const MAX_RECORDED_BODY: usize = 1024;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            max_attempts: config.delivery_max_attempts.max(1),
            base_delay: config.backoff_base(),
        }
    }

    /// Wait after failed attempt `attempt` (1-based): base doubled per
    /// attempt plus up to 25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exponent);
        let max_jitter = delay.as_millis() as u64 / 4;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        delay + Duration::from_millis(jitter)
    }
}

/// How a delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Remote answered 2xx
    Accepted,
    /// Remote answered with a non-2xx status
    Rejected,
    /// No response after every attempt
    Unreachable,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Accepted => "accepted",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::Unreachable => "unreachable",
        }
    }
}

/// Delivery result for one inbox
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_uri: String,
    pub activity_id: Option<String>,
    pub outcome: DeliveryOutcome,
    pub status_code: Option<u16>,
    pub response_body: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl DeliveryResult {
    fn unreachable(inbox_uri: &str, activity: &Activity, attempts: u32, error: String) -> Self {
        Self {
            inbox_uri: inbox_uri.to_string(),
            activity_id: activity.id().map(str::to_string),
            outcome: DeliveryOutcome::Unreachable,
            status_code: None,
            response_body: String::new(),
            attempts,
            error: Some(error),
        }
    }
}

/// Activity delivery service
#[derive(Clone)]
pub struct ActivityDelivery {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    timeout: Duration,
    allow_private_hosts: bool,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox| seen.insert(inbox.clone()))
        .collect()
}

impl ActivityDelivery {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &FederationConfig) -> Self {
        Self {
            transport,
            retry: RetryPolicy::from_config(config),
            timeout: config.request_timeout(),
            allow_private_hosts: config.allow_private_hosts,
        }
    }

    /// Deliver activity to a single inbox
    ///
    /// Each attempt is signed with a fresh `Date`. A remote 4xx/5xx is
    /// returned as `Rejected`, not as an error.
    ///
    /// # Errors
    /// - `DeliveryFailed` when every attempt failed at the transport level,
    ///   or the inbox URL is refused before any attempt
    /// - `Signing` if the local key cannot sign
    pub async fn deliver(
        &self,
        activity: &Activity,
        inbox_uri: &str,
        local: &LocalActor,
    ) -> Result<DeliveryResult, AppError> {
        let label = activity.metric_label();

        if let Err(e) = validate_remote_url(inbox_uri, self.allow_private_hosts) {
            ACTIVITIES_SENT.with_label_values(&[label, "refused"]).inc();
            return Err(AppError::DeliveryFailed {
                inbox: inbox_uri.to_string(),
                attempts: 0,
                reason: e.to_string(),
            });
        }

        let body = activity.to_bytes()?;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            let request = self.signed_request(inbox_uri, &body, local)?;

            match send_with_timeout(self.transport.as_ref(), request, self.timeout, "outbound").await {
                Ok(response) => {
                    let outcome = if response.is_success() {
                        DeliveryOutcome::Accepted
                    } else {
                        DeliveryOutcome::Rejected
                    };
                    DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&[outcome.as_str()])
                        .inc();
                    ACTIVITIES_SENT
                        .with_label_values(&[label, outcome.as_str()])
                        .inc();

                    let mut response_body = String::from_utf8_lossy(&response.body).into_owned();
                    if response_body.len() > MAX_RECORDED_BODY {
                        let mut cut = MAX_RECORDED_BODY;
                        while !response_body.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        response_body.truncate(cut);
                    }

                    match outcome {
                        DeliveryOutcome::Accepted => tracing::info!(
                            inbox = %inbox_uri,
                            activity_type = %activity.kind(),
                            status = response.status,
                            attempt,
                            "Delivered activity"
                        ),
                        _ => tracing::warn!(
                            inbox = %inbox_uri,
                            activity_type = %activity.kind(),
                            status = response.status,
                            "Remote inbox rejected activity"
                        ),
                    }

                    return Ok(DeliveryResult {
                        inbox_uri: inbox_uri.to_string(),
                        activity_id: activity.id().map(str::to_string),
                        outcome,
                        status_code: Some(response.status),
                        response_body,
                        attempts: attempt,
                        error: None,
                    });
                }
                Err(e) => {
                    DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&["transport_error"])
                        .inc();
                    tracing::warn!(
                        inbox = %inbox_uri,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Delivery attempt failed"
                    );
                    last_error = e.to_string();

                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        ACTIVITIES_SENT.with_label_values(&[label, "failed"]).inc();
        Err(AppError::DeliveryFailed {
            inbox: inbox_uri.to_string(),
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }

    /// Like [`deliver`](Self::deliver), but failures become an
    /// `Unreachable` result. For reply paths where nobody awaits an error.
    pub async fn deliver_reported(
        &self,
        activity: &Activity,
        inbox_uri: &str,
        local: &LocalActor,
    ) -> DeliveryResult {
        match self.deliver(activity, inbox_uri, local).await {
            Ok(result) => result,
            Err(AppError::DeliveryFailed {
                attempts, reason, ..
            }) => {
                tracing::error!(inbox = %inbox_uri, attempts, reason = %reason, "Delivery failed");
                DeliveryResult::unreachable(inbox_uri, activity, attempts, reason)
            }
            Err(e) => {
                tracing::error!(inbox = %inbox_uri, error = %e, "Delivery failed");
                DeliveryResult::unreachable(inbox_uri, activity, 0, e.to_string())
            }
        }
    }

    /// Deliver one activity to many inboxes
    ///
    /// Identical inbox URIs are delivered once. At most `MAX_CONCURRENT`
    /// deliveries run at a time.
    pub async fn deliver_to_many(
        &self,
        activity: &Activity,
        inbox_uris: Vec<String>,
        local: Arc<LocalActor>,
    ) -> Vec<DeliveryResult> {
        use tokio::sync::Semaphore;

        let total_targets = inbox_uris.len();
        let targets = unique_inbox_targets(inbox_uris);
        tracing::info!(
            "Delivering to {} unique inboxes (deduplicated from {} total)",
            targets.len(),
            total_targets
        );

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT));
        let activity = Arc::new(activity.clone());

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|inbox_uri| {
                let semaphore = semaphore.clone();
                let activity = activity.clone();
                let local = local.clone();
                let delivery = self.clone();

                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.ok();
                    delivery
                        .deliver_reported(&activity, &inbox_uri, &local)
                        .await
                })
            })
            .collect();

        let results: Vec<DeliveryResult> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::error!("Delivery task panicked: {}", e);
                    None
                }
            })
            .collect();

        let succeeded = results
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Accepted)
            .count();
        tracing::info!(
            "Delivery complete: {}/{} successful",
            succeeded,
            results.len()
        );

        results
    }

    fn signed_request(
        &self,
        inbox_uri: &str,
        body: &[u8],
        local: &LocalActor,
    ) -> Result<OutboundRequest, AppError> {
        let ctx = sign_request("POST", inbox_uri, local.signer(), local.key_id(), Utc::now())?;

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| AppError::Signing(format!("invalid header value: {}", e)))
        };

        let mut request = OutboundRequest::post(inbox_uri, body.to_vec());
        request.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(ACTIVITY_JSON),
        );
        request.headers.insert(http::header::HOST, header(&ctx.host)?);
        request.headers.insert(http::header::DATE, header(&ctx.date)?);
        request.headers.insert("signature", header(&ctx.signature)?);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::activity::{Follow, ObjectRef, build_accept_activity};
    use crate::federation::signature::{InboundRequest, decode_public_key_pem, verify};
    use crate::federation::testing::{FakeTransport, test_local_actor};

    const INBOX: &str = "https://remote.example/u/alice/inbox";

    fn config() -> FederationConfig {
        FederationConfig {
            delivery_backoff_base_ms: 1,
            ..FederationConfig::default()
        }
    }

    fn accept(local: &LocalActor) -> Activity {
        build_accept_activity(
            local,
            &Follow {
                context: None,
                id: "https://remote.example/follows/1".to_string(),
                actor: "https://remote.example/u/alice".to_string(),
                object: ObjectRef::Id(local.id().to_string()),
            },
        )
    }

    #[tokio::test]
    async fn delivers_signed_post_with_required_headers() {
        let transport = Arc::new(FakeTransport::new());
        let delivery = ActivityDelivery::new(transport.clone(), &config());
        let local = test_local_actor();

        let result = delivery
            .deliver(&accept(&local), INBOX, &local)
            .await
            .expect("delivered");
        assert_eq!(result.outcome, DeliveryOutcome::Accepted);
        assert_eq!(result.status_code, Some(202));
        assert_eq!(result.attempts, 1);

        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.headers["content-type"], ACTIVITY_JSON);
        assert_eq!(post.headers["host"], "remote.example");
        assert!(post.headers["date"].to_str().unwrap().ends_with(" GMT"));

        let public_key = decode_public_key_pem(local.export_public_key()).expect("public key");
        let inbound = InboundRequest {
            method: "POST",
            path: "/u/alice/inbox",
            headers: &post.headers,
            body: post.body.as_deref().unwrap_or_default(),
        };
        assert!(matches!(
            verify(&inbound, &public_key, chrono::Duration::minutes(30), Utc::now()),
            Ok(true)
        ));
    }

    #[tokio::test]
    async fn remote_rejection_is_reported_not_retried() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_to_posts_with(403);
        let delivery = ActivityDelivery::new(transport.clone(), &config());
        let local = test_local_actor();

        let result = delivery.deliver(&accept(&local), INBOX, &local).await.expect("reported");
        assert_eq!(result.outcome, DeliveryOutcome::Rejected);
        assert_eq!(result.status_code, Some(403));
        assert_eq!(transport.posts().len(), 1);
    }

    #[tokio::test]
    async fn transport_failures_are_retried() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_posts(2);
        let delivery = ActivityDelivery::new(transport.clone(), &config());
        let local = test_local_actor();

        let result = delivery.deliver(&accept(&local), INBOX, &local).await.expect("third try");
        assert_eq!(result.outcome, DeliveryOutcome::Accepted);
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.posts().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_delivery_failed() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_posts(10);
        let delivery = ActivityDelivery::new(transport.clone(), &config());
        let local = test_local_actor();

        match delivery.deliver(&accept(&local), INBOX, &local).await {
            Err(AppError::DeliveryFailed { attempts, inbox, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(inbox, INBOX);
            }
            other => panic!("expected delivery failure, got {other:?}"),
        }
        assert_eq!(transport.posts().len(), 3);

        let reported = delivery.deliver_reported(&accept(&local), INBOX, &local).await;
        assert_eq!(reported.outcome, DeliveryOutcome::Unreachable);
        assert!(reported.error.is_some());
    }

    #[tokio::test]
    async fn private_inbox_is_refused_without_network() {
        let transport = Arc::new(FakeTransport::new());
        let delivery = ActivityDelivery::new(transport.clone(), &config());
        let local = test_local_actor();

        let err = delivery
            .deliver(&accept(&local), "http://127.0.0.1:9/inbox", &local)
            .await
            .expect_err("refused");
        assert!(matches!(err, AppError::DeliveryFailed { attempts: 0, .. }));
        assert!(transport.posts().is_empty());
    }

    #[tokio::test]
    async fn deliver_to_many_dedupes_inboxes() {
        let transport = Arc::new(FakeTransport::new());
        let delivery = ActivityDelivery::new(transport.clone(), &config());
        let local = Arc::new(test_local_actor());

        let results = delivery
            .deliver_to_many(
                &accept(&local),
                vec![
                    INBOX.to_string(),
                    "https://remote.example/u/bob/inbox".to_string(),
                    INBOX.to_string(),
                ],
                local.clone(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(transport.posts().len(), 2);
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        };
        for (attempt, base) in [(1, 1000), (2, 2000), (3, 4000)] {
            let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 4, "attempt {attempt}: {delay}");
        }
    }
}
