use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::debug;

use crate::{
    limiter::{CheckOptions, StatusReport},
    service::{RateLimitHeaders, RateLimitService},
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RateLimitService>,
    /// Options applied to every request passing the middleware
    pub options: Arc<CheckOptions>,
    /// Key clients on the first `X-Forwarded-For` hop instead of the peer address
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(service: Arc<RateLimitService>) -> Self {
        Self {
            service,
            options: Arc::new(CheckOptions::default()),
            trust_forwarded_for: false,
        }
    }

    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.options = Arc::new(options);
        self
    }

    /// Only enable behind a proxy that overwrites the header
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Public routes sit behind the limiter; metrics and admin routes do not
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/health", get(health_check))
        .route("/api/test", get(api_test))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(limited)
        .route("/metrics", get(metrics_handler))
        .route("/admin/status/:identifier", get(admin_status))
        .route("/admin/reset/:identifier", post(admin_reset))
        .with_state(state)
}

/// Peer address, or the first `X-Forwarded-For` hop when `trust_forwarded_for`
/// is set; `unknown` when neither is available
pub fn client_identifier(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identifier = client_identifier(&request, state.trust_forwarded_for);
    let decision = state.service.check(&identifier, &state.options).await;
    let headers = RateLimitHeaders::from(&decision);

    if !decision.allowed {
        debug!(identifier = %identifier, current = decision.current, "Request rate limited");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too Many Requests",
                "retryAfter": decision.reset_at(),
            })),
        )
            .into_response();
        headers.apply(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    headers.apply(response.headers_mut());
    response
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
        "nodeId": state.service.node_id(),
    }))
}

async fn api_test(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "Success",
        "nodeId": state.service.node_id(),
        "timestamp": chrono::Utc::now(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.service.metrics().registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Option<String>,
}

async fn admin_status(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<ActionQuery>,
) -> (StatusCode, Json<StatusReport>) {
    let report = state
        .service
        .status(&identifier, query.action.as_deref())
        .await;
    let code = match report {
        StatusReport::Current { .. } => StatusCode::OK,
        StatusReport::Error { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn admin_reset(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<ActionQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let reset = state
        .service
        .reset(&identifier, query.action.as_deref())
        .await;
    let code = if reset {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "reset": reset,
            "identifier": identifier,
            "action": query.action,
        })),
    )
}
