//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod compliance;
mod purge;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    api_routes()
        .layer(middleware)
        .with_state(state)
}

/// Routes without middleware
fn api_routes() -> Router<SharedState> {
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Compliance attachment routes ({kind} is modulesets or rulesets)
        .route(
            "/nodes/{node}/compliance/{kind}/{id}",
            post(compliance::attach).delete(compliance::detach_one),
        )
        .route("/nodes/{node}/compliance/{kind}", delete(compliance::detach_batch))

        // Maintenance routes
        .route("/purge/{job}", post(purge::run_job))
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::compliance::ComplianceService;
    use crate::db::memory::MemoryTables;
    use crate::db::MemoryGateway;
    use crate::notify::RecordingNotifier;
    use crate::session::{SessionConfig, SessionFactory};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Router over an in-memory store
    pub fn router(tables: MemoryTables) -> (Router, MemoryGateway, Arc<RecordingNotifier>) {
        let gateway = MemoryGateway::with_tables(tables);
        let notifier = Arc::new(RecordingNotifier::new());
        let sessions = SessionFactory::new(
            Arc::new(gateway.clone()),
            notifier.clone(),
            SessionConfig::default(),
        );
        let state = Arc::new(AppState::new(ComplianceService::new(sessions)));
        (api_routes().with_state(state), gateway, notifier)
    }

    /// Send one request and return the status and JSON body
    pub async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}
