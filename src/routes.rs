//! 路由注册
//! 探针路由并应用中间件

use axum::{http::HeaderValue, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{handlers, middleware::AppState, ssh::Connector};

/// 创建应用路由
pub fn create_router<C: Connector>(state: Arc<AppState<C>>) -> Router {
    let cors = cors_layer(state.config.server.allowed_origins.as_deref());

    Router::new()
        .route("/health", get(handlers::health::health_check::<C>))
        .route("/ready", get(handlers::health::readiness_check::<C>))
        .route("/metrics", get(handlers::metrics::metrics_export::<C>))
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS：未配置来源时允许任意来源
fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    match allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            layer.allow_origin(origins)
        }
        _ => layer.allow_origin(Any),
    }
}
