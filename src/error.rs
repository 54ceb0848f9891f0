//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::ssh::SshError;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    /// 命令没有在远端执行（执行器层失败，exit_code == -1）
    #[error("Remote host unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Confirmation required for {0}")]
    ConfirmationRequired(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Internal server error")]
    Internal,
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::ConfirmationRequired(_)
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Ssh(SshError::PoolExhausted { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Ssh(SshError::CommandTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Ssh(_) | AppError::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::ConfirmationRequired(action) => {
                format!("Operation '{}' requires confirm=true", action)
            }
            AppError::Validation(errors) => format!("Validation failed: {}", errors),
            AppError::Ssh(SshError::PoolExhausted { .. }) => {
                "Too many concurrent remote operations, retry later".to_string()
            }
            AppError::Ssh(SshError::CommandTimeout(_)) => "Remote command timed out".to_string(),
            AppError::Ssh(_) | AppError::RemoteUnavailable(_) => {
                "Remote host unavailable".to_string()
            }
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        // 记录错误日志
        tracing::error!(
            code = self.code(),
            message = %self,
            request_id = %error_response.error.request_id,
            "Application error"
        );

        (status, Json(error_response)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::BadRequest("test".to_string()).code(), 400);
        assert_eq!(AppError::ConfirmationRequired("stop".to_string()).code(), 400);
        assert_eq!(AppError::Ssh(SshError::PoolExhausted { max: 5 }).code(), 503);
        assert_eq!(AppError::Ssh(SshError::Connection("refused".into())).code(), 502);
        assert_eq!(AppError::Ssh(SshError::CommandTimeout(Duration::from_secs(1))).code(), 504);
        assert_eq!(AppError::RemoteUnavailable("x".into()).code(), 502);
        assert_eq!(AppError::Config("x".into()).code(), 500);
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Ssh(SshError::AuthenticationFailed(
            "cannot load key /root/.ssh/id_rsa".to_string(),
        ));
        let message = error.user_message();
        assert_eq!(message, "Remote host unavailable");
        assert!(!message.contains("id_rsa"));
    }
}
