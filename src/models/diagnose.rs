//! 诊断报告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 检查结果级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckStatus {
    /// 使用率阈值：低于 80 正常，低于 90 警告，否则错误
    pub fn from_percent(percent: u8) -> Self {
        match percent {
            0..=79 => CheckStatus::Ok,
            80..=89 => CheckStatus::Warning,
            _ => CheckStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnoseCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl DiagnoseCheck {
    pub fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseReport {
    pub checks: Vec<DiagnoseCheck>,
    /// 最严重的检查结果
    pub overall: CheckStatus,
    pub checked_at: DateTime<Utc>,
}

impl DiagnoseReport {
    pub fn new(checks: Vec<DiagnoseCheck>) -> Self {
        let overall = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok);

        Self {
            checks,
            overall,
            checked_at: Utc::now(),
        }
    }
}
