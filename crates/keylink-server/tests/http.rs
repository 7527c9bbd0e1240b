use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use keylink_auth::{
    ApiKeyStore, CredentialGenerator, DeviceAuthSettings, DeviceAuthorizer, FixedWindowLimiter,
    JsonStore, KeyHasher, ManualClock, OsRandom,
};
use keylink_core::RateLimitPolicy;
use keylink_server::{create_router, AppState, HeaderSessionResolver};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SESSION_HEADER: &str = "x-keylink-user";

struct TestServer {
    router: Router,
    store: Arc<JsonStore>,
    clock: Arc<ManualClock>,
    credentials: CredentialGenerator,
}

fn server_with(settings: DeviceAuthSettings) -> TestServer {
    let store = Arc::new(JsonStore::in_memory());
    let clock = Arc::new(ManualClock::default());
    let credentials = CredentialGenerator::new(
        Arc::new(OsRandom),
        KeyHasher::new(b"integration-secret").unwrap(),
        "kl",
    );
    let authorizer = Arc::new(DeviceAuthorizer::new(
        store.clone(),
        store.clone(),
        Arc::new(FixedWindowLimiter::new(clock.clone())),
        credentials.clone(),
        clock.clone(),
        settings,
    ));
    let sessions = Arc::new(HeaderSessionResolver::new(SESSION_HEADER).unwrap());
    let state = Arc::new(AppState::new(authorizer, sessions, true));

    TestServer {
        router: create_router(state),
        store,
        clock,
        credentials,
    }
}

fn server() -> TestServer {
    server_with(DeviceAuthSettings {
        initiate_limit: RateLimitPolicy::new(100, 60),
        poll_limit: RateLimitPolicy::new(100, 60),
        approve_limit: RateLimitPolicy::new(100, 60),
        ..DeviceAuthSettings::default()
    })
}

impl TestServer {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, retry_after, body)
    }

    async fn device_auth(&self, body: Value, user: Option<&str>) -> (StatusCode, Option<String>, Value) {
        self.device_auth_raw(body.to_string(), user).await
    }

    async fn device_auth_raw(
        &self,
        body: String,
        user: Option<&str>,
    ) -> (StatusCode, Option<String>, Value) {
        let mut builder = Request::post("/api/auth/device")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "198.51.100.4");
        if let Some(user) = user {
            builder = builder.header(SESSION_HEADER, user);
        }
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    async fn initiate(&self) -> (String, String) {
        let (status, _, body) = self.device_auth(json!({ "action": "initiate" }), None).await;
        assert_eq!(status, StatusCode::OK);
        (
            body["userCode"].as_str().unwrap().to_string(),
            body["deviceCode"].as_str().unwrap().to_string(),
        )
    }
}

#[tokio::test]
async fn initiate_returns_codes() {
    let server = server();
    let (status, _, body) = server.device_auth(json!({ "action": "initiate" }), None).await;

    assert_eq!(status, StatusCode::OK);
    let user_code = body["userCode"].as_str().unwrap();
    assert_eq!(user_code.len(), 9);
    assert_eq!(&user_code[4..5], "-");
    assert_eq!(body["deviceCode"].as_str().unwrap().len(), 64);
    assert_eq!(body["expiresIn"], 900);
}

#[tokio::test]
async fn end_to_end_pairing() {
    let server = server();
    let (user_code, device_code) = server.initiate().await;

    let (status, _, body) = server
        .device_auth(json!({ "action": "poll", "deviceCode": device_code }), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "approved": false }));

    let (status, _, body) = server
        .device_auth(json!({ "action": "approve", "userCode": user_code }), Some("u1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (status, _, body) = server
        .device_auth(json!({ "action": "poll", "deviceCode": device_code }), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], true);
    let api_key = body["apiKey"].as_str().unwrap().to_string();

    let stored = server
        .store
        .find_by_hash(&server.credentials.hash(&api_key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.user_id, "u1");
    assert_eq!(server.store.list_for_user("u1").await.unwrap().len(), 1);

    let (status, _, body) = server
        .device_auth(json!({ "action": "poll", "deviceCode": device_code }), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    // The issued key identifies its owner
    let request = Request::get("/api/auth/whoami")
        .header(header::AUTHORIZATION, format!("Bearer {}", api_key))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userId"], "u1");
    assert!(api_key.starts_with(body["keyPrefix"].as_str().unwrap()));
}

#[tokio::test]
async fn approve_without_session_is_unauthorized() {
    let server = server();
    let (user_code, _) = server.initiate().await;

    let (status, _, body) = server
        .device_auth(json!({ "action": "approve", "userCode": user_code }), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn approve_status_codes() {
    let server = server();
    let (user_code, _) = server.initiate().await;

    let (status, _, _) = server
        .device_auth(json!({ "action": "approve" }), Some("u1"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = if user_code == "ZZZZ-ZZZZ" { "YYYY-YYYY" } else { "ZZZZ-ZZZZ" };
    let (status, _, _) = server
        .device_auth(json!({ "action": "approve", "userCode": unknown }), Some("u1"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = server
        .device_auth(json!({ "action": "approve", "userCode": user_code }), Some("u1"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = server
        .device_auth(json!({ "action": "approve", "userCode": user_code }), Some("u2"))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_APPROVED");
}

#[tokio::test]
async fn expired_codes_return_gone() {
    let server = server();
    let (user_code, device_code) = server.initiate().await;

    server.clock.advance(chrono::Duration::minutes(16));

    let (status, _, body) = server
        .device_auth(json!({ "action": "approve", "userCode": user_code }), Some("u1"))
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "EXPIRED");

    let (status, _, _) = server
        .device_auth(json!({ "action": "poll", "deviceCode": device_code }), None)
        .await;
    assert_eq!(status, StatusCode::GONE);

    let (status, _, _) = server
        .device_auth(json!({ "action": "poll", "deviceCode": device_code }), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let server = server();

    let (status, _, _) = server.device_auth_raw("{not json".into(), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = server.device_auth(json!({ "action": "deny" }), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = server.device_auth(json!({ "action": "poll" }), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn initiate_is_throttled_per_client() {
    let server = server_with(DeviceAuthSettings::default());

    for _ in 0..5 {
        server.initiate().await;
    }
    let (status, retry_after, body) = server.device_auth(json!({ "action": "initiate" }), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
    let retry_after: u64 = retry_after.unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    server.clock.advance(chrono::Duration::seconds(61));
    server.initiate().await;
}

#[tokio::test]
async fn key_listing_requires_session() {
    let server = server();
    let (user_code, device_code) = server.initiate().await;
    server
        .device_auth(json!({ "action": "approve", "userCode": user_code }), Some("u1"))
        .await;
    server
        .device_auth(json!({ "action": "poll", "deviceCode": device_code }), None)
        .await;

    let request = Request::get("/api/auth/keys").body(Body::empty()).unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get("/api/auth/keys")
        .header(SESSION_HEADER, "u1")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let keys = body.as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0]["keyPrefix"].as_str().unwrap().starts_with("kl_"));
    assert!(keys[0].get("keyHash").is_none());
}

#[tokio::test]
async fn whoami_rejects_unknown_keys() {
    let server = server();

    let request = Request::get("/api/auth/whoami").body(Body::empty()).unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get("/api/auth/whoami")
        .header(header::AUTHORIZATION, "Bearer kl_not-a-real-key")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_reports_ok() {
    let server = server();
    let request = Request::get("/api/health").body(Body::empty()).unwrap();
    let (status, _, body) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
