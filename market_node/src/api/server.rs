use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::api::errors::ApiError;
use crate::api::handlers::{disputes, orders, payments, profiles, rpc, scenarios, storage};
use crate::api::rate_limiter::RateLimiter;
use crate::api::websocket::websocket_handler;
use crate::config::ServerConfig;
use crate::events::EventManager;
use crate::payment::PaymentVerifier;
use crate::policy::SessionValidator;
use crate::storage::ObjectStore;
use crate::MarketService;

/// Where clients send escrow payments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub token_address: Option<String>,
    pub escrow_address: Option<String>,
    pub token_decimals: u32,
    /// False when hashes are only format-checked
    pub verifies_on_chain: bool,
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MarketService>,
    pub sessions: Arc<SessionValidator>,
    pub events: Arc<EventManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub objects: Arc<dyn ObjectStore>,
    pub verifier: Arc<dyn PaymentVerifier>,
    pub payment: PaymentInfo,
    pub max_upload_bytes: usize,
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub realtime_listeners: usize,
    pub verifies_payments_on_chain: bool,
}

pub async fn root() -> &'static str {
    "BMB Server is running"
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        realtime_listeners: state.events.listener_count(),
        verifies_payments_on_chain: state.payment.verifies_on_chain,
    })
}

/// Requests are keyed by the authenticated user, then forwarded address.
/// Tokens that fail validation count against the address.
fn client_key(headers: &HeaderMap, sessions: &SessionValidator) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Ok(user) = sessions.validate_header(header("authorization")) {
        return format!("user:{}", user.id);
    }
    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| format!("addr:{v}"))
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = client_key(request.headers(), &state.sessions);
    match state.rate_limiter.check_rate_limit(&client) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            log::debug!("Throttled {} {}: {}", request.method(), request.uri().path(), e);
            ApiError::from(e).into_response()
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        // Profiles
        .route(
            "/api/profile",
            get(profiles::get_my_profile).put(profiles::save_profile),
        )
        .route("/api/profile/avatar", post(profiles::upload_avatar))
        .route("/api/profile/location", put(profiles::set_location))
        .route("/api/profiles/:id", get(profiles::get_profile_card))
        .route("/api/map/users", get(profiles::map_users))
        // Scenarios
        .route(
            "/api/scenarios",
            get(scenarios::catalog).post(scenarios::create_scenario),
        )
        .route("/api/scenarios/:id", delete(scenarios::delete_scenario))
        .route("/api/scenarios/:id/accept", post(scenarios::accept_scenario))
        .route("/api/my/scenarios", get(scenarios::my_scenarios))
        // Orders
        .route("/api/orders", post(orders::create_order))
        .route("/api/my/orders", get(orders::my_orders))
        .route(
            "/api/orders/:id",
            get(orders::get_order).patch(orders::edit_order),
        )
        .route("/api/orders/:id/transitions", post(orders::transition_order))
        // Disputes
        .route("/api/orders/:id/dispute", get(disputes::get_dispute))
        .route("/api/orders/:id/dispute/votes", post(disputes::cast_vote))
        // Payments
        .route("/api/payments/config", get(payments::payment_config))
        .route("/api/payments/verify", post(payments::verify_payment))
        // Named queries
        .route("/rpc/:name", get(rpc::call).post(rpc::call))
        // Files and realtime
        .route("/storage/:bucket/*path", get(storage::get_object))
        .route("/realtime", get(websocket_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(DefaultBodyLimit::max(server.max_upload_bytes + 64 * 1024))
        .layer(cors_layer(&server.cors_origins))
        .with_state(state)
}
