//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::middleware::AppState;
use crate::output::summarize;
use crate::ssh::{Connector, PoolStats};

/// 就绪探针远程命令的超时
const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
    pub pool: PoolStats,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
    })
}

/// 就绪探针
/// 在远程主机上执行 `true`，确认连接与认证可用
pub async fn readiness_check<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
) -> Json<ReadinessResponse> {
    let result = state.executor.run("true", Some(READINESS_TIMEOUT)).await;

    let remote = if result.is_success() {
        HealthCheck {
            name: "remote_host".to_string(),
            status: "healthy".to_string(),
            message: None,
        }
    } else {
        let message = if result.stderr.trim().is_empty() {
            format!("exit code {}", result.exit_code)
        } else {
            summarize(result.stderr.trim(), 200)
        };
        HealthCheck {
            name: "remote_host".to_string(),
            status: "unhealthy".to_string(),
            message: Some(message),
        }
    };

    let checks = vec![remote];
    let all_healthy = checks.iter().all(|c| c.status == "healthy");

    Json(ReadinessResponse {
        ready: all_healthy,
        checks,
        pool: state.executor.pool_stats(),
    })
}
