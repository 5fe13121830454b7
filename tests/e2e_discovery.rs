//! E2E tests for discovery endpoints: WebFinger, actor profile, health and
//! metrics

mod common;

use common::schema_validator::{load_test_schema, validate_against_schema};
use common::*;
use serde_json::Value;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_webfinger_after_provisioning() {
    let server = TestServer::new().await;
    server.provision().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:test@localhost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/jrd+json"
    );

    let jrd: Value = response.json().await.unwrap();
    validate_against_schema(&jrd, &load_test_schema("webfinger")).unwrap();
    assert_eq!(jrd["subject"], "acct:test@localhost");

    let self_link = jrd["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"] == "self")
        .expect("self link");
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], LOCAL_ACTOR_ID);
}

#[tokio::test]
async fn test_webfinger_before_provisioning_is_not_found() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:test@localhost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_rejects_other_accounts() {
    let server = TestServer::new().await;
    server.provision().await;

    let other_user = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:bob@localhost"))
        .send()
        .await
        .unwrap();
    assert_eq!(other_user.status(), 404);

    let other_domain = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:test@elsewhere.example"))
        .send()
        .await
        .unwrap();
    assert_eq!(other_domain.status(), 404);

    let garbage = server
        .client
        .get(server.url("/.well-known/webfinger?resource=not-an-account"))
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 400);
}

#[tokio::test]
async fn test_actor_profile_matches_schema() {
    let server = TestServer::new().await;
    server.provision().await;

    let response = server.client.get(server.url("/u/test")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/activity+json"
    );

    let actor: Value = response.json().await.unwrap();
    validate_against_schema(&actor, &load_test_schema("actor")).unwrap();
    assert_eq!(actor["id"], LOCAL_ACTOR_ID);
}

#[tokio::test]
async fn test_unknown_actor_is_not_found() {
    let server = TestServer::new().await;
    server.provision().await;

    let response = server.client.get(server.url("/u/bob")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;
    courier::metrics::init_metrics();

    // Series appear once they carry a sample; the first scrape records one.
    server.client.get(server.url("/metrics")).send().await.unwrap();
    let response = server.client.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    assert!(text.contains("courier_http_requests_total"));
}
