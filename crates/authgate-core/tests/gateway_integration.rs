//! HTTP-level tests for the gateway against a mock backend.

use std::sync::Arc;
use std::time::Duration;

use authgate_core::{
    ApiError, ApiRequest, Credential, Gateway, GatewayConfig, MemoryStorage, SessionState,
    StorageBackend,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DATA_PATH: &str = "/practice/sessions";

fn config_for(server: &MockServer) -> GatewayConfig {
    GatewayConfig {
        base_url: server.uri(),
        retry_delay_ms: 10,
        storage: StorageBackend::Memory,
        ..GatewayConfig::default()
    }
}

/// Mount the login endpoint and sign in as A1/R1.
async fn signed_in_gateway(server: &MockServer, config: GatewayConfig) -> Gateway {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({ "username": "ada", "password": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "A1",
            "refreshToken": "R1",
            "user": { "id": 42 }
        })))
        .expect(1)
        .mount(server)
        .await;

    let gateway = Gateway::new(config, Arc::new(MemoryStorage::new())).expect("gateway builds");
    let outcome = gateway.login("ada", "hunter2").await.expect("login succeeds");
    assert_eq!(outcome.profile["user"]["id"], 42);
    gateway
}

async fn mount_data(server: &MockServer, token: &str, status: u16, expected_hits: u64) {
    let mut response = ResponseTemplate::new(status);
    if status == 200 {
        response = response.set_body_json(json!({ "sessions": [] }));
    }
    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(response)
        .expect(expected_hits)
        .mount(server)
        .await;
}

async fn mount_refresh(server: &MockServer, response: ResponseTemplate, expected_hits: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refreshToken": "R1" })))
        .respond_with(response)
        .expect(expected_hits)
        .mount(server)
        .await;
}

async fn stored(gateway: &Gateway) -> Option<Credential> {
    gateway.credential_store().get().await.expect("store readable")
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_expired_requests_share_one_refresh() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;

    mount_data(&server, "A1", 401, 3).await;
    mount_data(&server, "A2", 200, 3).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "accessToken": "A2" }))
            .set_delay(Duration::from_millis(200)),
        1,
    )
    .await;

    let (first, second, third) = tokio::join!(
        gateway.get_json::<Value>(DATA_PATH),
        gateway.get_json::<Value>(DATA_PATH),
        gateway.get_json::<Value>(DATA_PATH),
    );

    for result in [first, second, third] {
        assert_eq!(result.expect("request recovers")["sessions"], json!([]));
    }
    assert_eq!(stored(&gateway).await, Some(Credential::new("A2", "R1")));
    assert_eq!(gateway.session_state().await, SessionState::Authenticated);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_is_attempted_only_once() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;

    mount_data(&server, "A1", 401, 1).await;
    mount_data(&server, "A2", 401, 1).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "A2" })),
        1,
    )
    .await;

    let result = gateway.send(ApiRequest::get(DATA_PATH)).await;

    assert!(matches!(result, Err(ApiError::AuthorizationExpired)));
    // The refresh itself succeeded, so the session is kept
    assert_eq!(stored(&gateway).await, Some(Credential::new("A2", "R1")));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_refresh_signs_out_once() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;
    let mut signed_out = gateway.subscribe_signed_out();

    mount_data(&server, "A1", 401, 3).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(400)
            .set_body_json(json!({ "error": "invalid_grant" }))
            .set_delay(Duration::from_millis(200)),
        1,
    )
    .await;

    let (first, second, third) = tokio::join!(
        gateway.send(ApiRequest::get(DATA_PATH)),
        gateway.send(ApiRequest::get(DATA_PATH)),
        gateway.send(ApiRequest::get(DATA_PATH)),
    );

    for result in [first, second, third] {
        assert!(matches!(result, Err(ApiError::AuthorizationExpired)));
    }
    assert_eq!(stored(&gateway).await, None);
    assert_eq!(gateway.session_state().await, SessionState::Anonymous);
    assert!(signed_out.try_recv().is_ok());
    assert!(signed_out.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_request_with_invalid_refresh_credential() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;
    let mut signed_out = gateway.subscribe_signed_out();

    mount_data(&server, "A1", 401, 1).await;
    mount_refresh(&server, ResponseTemplate::new(400), 1).await;

    let result = gateway.send(ApiRequest::get(DATA_PATH)).await;

    assert!(matches!(result, Err(ApiError::AuthorizationExpired)));
    assert_eq!(stored(&gateway).await, None);
    assert!(signed_out.try_recv().is_ok());
    assert!(signed_out.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_after_refresh_use_new_credential() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;

    mount_data(&server, "A1", 401, 1).await;
    mount_data(&server, "A2", 200, 2).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "A2" })),
        1,
    )
    .await;

    gateway
        .send(ApiRequest::get(DATA_PATH))
        .await
        .expect("first request recovers");
    gateway
        .send(ApiRequest::get(DATA_PATH))
        .await
        .expect("second request uses A2 directly");
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_is_idempotent_and_ignores_remote_failure() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;
    let mut signed_out = gateway.subscribe_signed_out();

    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .and(header("authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    gateway.logout().await.expect("first logout");
    assert_eq!(stored(&gateway).await, None);
    gateway.logout().await.expect("second logout");
    assert_eq!(stored(&gateway).await, None);

    assert!(signed_out.try_recv().is_ok());
    assert!(signed_out.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried_without_refresh() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;

    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_data(&server, "A1", 200, 1).await;
    mount_refresh(&server, ResponseTemplate::new(200), 0).await;

    let body: Value = gateway.get_json(DATA_PATH).await.expect("third attempt succeeds");
    assert_eq!(body["sessions"], json!([]));
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_transient_failure_surfaces_without_refresh() {
    let server = MockServer::start().await;
    let gateway = signed_in_gateway(&server, config_for(&server)).await;

    Mock::given(method("GET"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;
    mount_refresh(&server, ResponseTemplate::new(200), 0).await;

    let result = gateway.send(ApiRequest::get(DATA_PATH)).await;

    assert!(matches!(result, Err(ApiError::RateLimited)));
    assert_eq!(stored(&gateway).await, Some(Credential::new("A1", "R1")));
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_refresh_is_a_refresh_failure() {
    let server = MockServer::start().await;
    let config = GatewayConfig {
        request_timeout_secs: 1,
        max_attempts: 1,
        ..config_for(&server)
    };
    let gateway = signed_in_gateway(&server, config).await;
    let mut signed_out = gateway.subscribe_signed_out();

    mount_data(&server, "A1", 401, 1).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "accessToken": "A2" }))
            .set_delay(Duration::from_secs(3)),
        1,
    )
    .await;

    let result = gateway.send(ApiRequest::get(DATA_PATH)).await;

    assert!(matches!(result, Err(ApiError::AuthorizationExpired)));
    assert_eq!(stored(&gateway).await, None);
    assert!(signed_out.try_recv().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_during_refresh_fails_waiting_requests() {
    let server = MockServer::start().await;
    let gateway = Arc::new(signed_in_gateway(&server, config_for(&server)).await);

    mount_data(&server, "A1", 401, 1).await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "accessToken": "A2" }))
            .set_delay(Duration::from_secs(2)),
        1,
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let pending = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.send(ApiRequest::get(DATA_PATH)).await })
    };

    while gateway.session_state().await != SessionState::RefreshInProgress {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    gateway.logout().await.expect("logout");

    let result = pending.await.expect("task joins");
    assert!(matches!(result, Err(ApiError::AuthorizationExpired)));
    assert_eq!(stored(&gateway).await, None);

    // The cancelled refresh never writes its credential back
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stored(&gateway).await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn login_with_bad_password_is_access_denied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let gateway = Gateway::new(config_for(&server), Arc::new(MemoryStorage::new())).unwrap();
    let result = gateway.login("ada", "wrong").await;

    assert!(matches!(result, Err(ApiError::AccessDenied(_))));
    assert_eq!(gateway.session_state().await, SessionState::Anonymous);
}
