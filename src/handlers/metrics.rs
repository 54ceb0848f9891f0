//! 指标处理器
//! 提供 /metrics 端点

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::AppState;
use crate::ssh::{Connector, PoolStats};

/// 指标响应
#[derive(Serialize)]
pub struct MetricsResponse {
    pub pool: PoolStats,
    pub default_command_timeout_secs: u64,
    pub process_uptime_secs: u64,
}

/// 指标暴露端点
///
/// 计数器和直方图通过 `metrics` facade 上报，这里只返回会话池快照。
pub async fn metrics_export<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        pool: state.executor.pool_stats(),
        default_command_timeout_secs: state.executor.default_timeout().as_secs(),
        process_uptime_secs: state.uptime_secs(),
    })
}
