use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bmb_node::api::rate_limiter::{RateLimitConfig, RateLimiter};
use bmb_node::api::{create_router, AppState, PaymentInfo};
use bmb_node::config::ServerConfig;
use bmb_node::events::EventManager;
use bmb_node::payment::FormatOnlyVerifier;
use bmb_node::policy::SessionValidator;
use bmb_node::storage::{MarketStore, MemoryObjectStore, MemoryStorage};
use bmb_node::MarketService;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    sessions: Arc<SessionValidator>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_rate_limit(RateLimitConfig::default())
    }

    fn with_rate_limit(rate_limit: RateLimitConfig) -> Self {
        let store = Arc::new(MarketStore::new(Arc::new(MemoryStorage::new())));
        let events = Arc::new(EventManager::new(64));
        let objects = Arc::new(MemoryObjectStore::new("http://localhost:3000"));
        let verifier = Arc::new(FormatOnlyVerifier);
        let service = Arc::new(MarketService::new(
            store,
            events.clone(),
            verifier.clone(),
            objects.clone(),
        ));
        let sessions = Arc::new(SessionValidator::new(SECRET, "authenticated", 3600));
        let state = AppState {
            service,
            sessions: sessions.clone(),
            events,
            rate_limiter: Arc::new(RateLimiter::new(rate_limit)),
            objects,
            verifier,
            payment: PaymentInfo::default(),
            max_upload_bytes: 1024,
        };
        Self {
            router: create_router(state, &ServerConfig::default()),
            sessions,
        }
    }

    fn token(&self, user: Uuid) -> String {
        self.sessions.issue(user, None).unwrap()
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }
}

#[tokio::test]
async fn root_and_health_respond() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("BMB Server is running".into()));

    let (status, body) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["verifies_payments_on_chain"], false);
}

#[tokio::test]
async fn protected_routes_need_a_valid_token() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/api/profile", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = app
        .call(Method::GET, "/api/profile", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let foreign = SessionValidator::new("other-secret", "authenticated", 3600)
        .issue(Uuid::new_v4(), None)
        .unwrap();
    let (status, _) = app
        .call(Method::GET, "/api/profile", Some(&foreign), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn profile_is_created_on_first_save() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4());

    let (status, _) = app.call(Method::GET, "/api/profile", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .call(
            Method::PUT,
            "/api/profile",
            Some(&token),
            Some(json!({"display_name": "Ann", "role": "performer"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["display_name"], "Ann");
    assert_eq!(body["referral_code"].as_str().map(str::len), Some(8));

    let (status, body) = app
        .call(
            Method::PUT,
            "/api/profile",
            Some(&token),
            Some(json!({"wallet": "nope"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["details"]["field"], "wallet");
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4());
    let (status, body) = app
        .call(
            Method::POST,
            "/api/scenarios",
            Some(&token),
            Some(json!({"title": "missing fields"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn scenario_catalog_flow() {
    let app = TestApp::new();
    let creator = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let creator_token = app.token(creator);
    let buyer_token = app.token(buyer);
    app.call(
        Method::PUT,
        "/api/profile",
        Some(&creator_token),
        Some(json!({"display_name": "Ann"})),
    )
    .await;

    let (status, scenario) = app
        .call(
            Method::POST,
            "/api/scenarios",
            Some(&creator_token),
            Some(json!({"title": "Dance", "description": "In the rain", "price": "0"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = scenario["id"].as_u64().unwrap();

    let (status, catalog) = app.call(Method::GET, "/api/scenarios", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(catalog[0]["creator_name"], "Ann");

    let (status, _) = app
        .call(Method::DELETE, &format!("/api/scenarios/{id}"), Some(&buyer_token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, order) = app
        .call(
            Method::POST,
            &format!("/api/scenarios/{id}/accept"),
            Some(&buyer_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "pending");
    let order_id = order["id"].as_u64().unwrap();

    let (status, incoming) = app
        .call(Method::POST, "/rpc/get_incoming_requests", Some(&creator_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(incoming[0]["order_id"].as_u64(), Some(order_id));

    // the customer cannot accept on the performer's behalf
    let (status, _) = app
        .call(
            Method::POST,
            &format!("/api/orders/{order_id}/transitions"),
            Some(&buyer_token),
            Some(json!({"action": "accept"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, accepted) = app
        .call(
            Method::POST,
            &format!("/api/orders/{order_id}/transitions"),
            Some(&creator_token),
            Some(json!({"action": "accept", "expected_version": order["version"]})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["status"], "in_progress");

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/orders/{order_id}/transitions"),
            Some(&creator_token),
            Some(json!({"action": "accept"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"]["from"], "in_progress");
}

#[tokio::test]
async fn paid_order_without_hash_is_payment_required() {
    let app = TestApp::new();
    let performer = Uuid::new_v4();
    let performer_token = app.token(performer);
    app.call(
        Method::PUT,
        "/api/profile",
        Some(&performer_token),
        Some(json!({"display_name": "Bob"})),
    )
    .await;

    let customer_token = app.token(Uuid::new_v4());
    let order = json!({
        "performer_id": performer,
        "title": "Sing",
        "description": "Loud",
        "price": "10",
        "execution_time": (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        "location": {"lat": 10.0, "lng": 20.0}
    });
    let (status, _) = app
        .call(Method::POST, "/api/orders", Some(&customer_token), Some(order.clone()))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let mut paid = order;
    paid["transaction_hash"] = json!(format!("0x{}", "ab".repeat(32)));
    let (status, view) = app
        .call(Method::POST, "/api/orders", Some(&customer_token), Some(paid))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(view["order"]["status"], "paid_pending_execution");
    assert_eq!(view["performer"]["display_name"], "Bob");
}

#[tokio::test]
async fn rpc_dispatch() {
    let app = TestApp::new();
    let (status, body) = app
        .call(Method::GET, "/rpc/get_all_scenarios_with_creator", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = app.call(Method::POST, "/rpc/get_my_orders", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = app.token(Uuid::new_v4());
    let (status, body) = app
        .call(Method::GET, "/rpc/get_my_orders?tab=active", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = app.call(Method::GET, "/rpc/drop_tables", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_objects_are_not_found() {
    let app = TestApp::new();
    let (status, _) = app
        .call(Method::GET, "/storage/avatars/nobody/none.png", None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn clients_are_throttled() {
    let app = TestApp::with_rate_limit(RateLimitConfig {
        per_client_per_second: 2,
        burst_allowance: 0,
        ..RateLimitConfig::default()
    });
    for _ in 0..2 {
        let (status, _) = app.call(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["details"]["limit"], 2);
}

#[tokio::test]
async fn rotating_junk_tokens_share_one_limit() {
    let app = TestApp::with_rate_limit(RateLimitConfig {
        per_client_per_second: 2,
        burst_allowance: 0,
        ..RateLimitConfig::default()
    });
    let mut statuses = Vec::new();
    for n in 0..3 {
        let junk = format!("junk-{n}");
        let (status, _) = app.call(Method::GET, "/health", Some(&junk), None).await;
        statuses.push(status);
    }
    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
}

#[tokio::test]
async fn location_accepts_wkt() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4());
    let (status, body) = app
        .call(
            Method::PUT,
            "/api/profile/location",
            Some(&token),
            Some(json!({"visible": true, "location": "POINT(2.35 48.85)"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"]["lat"], 48.85);

    let (_, users) = app.call(Method::GET, "/api/map/users", None, None).await;
    assert_eq!(users[0]["lng"], 2.35);
}
