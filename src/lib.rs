//! 运维面板核心库
//! SSH 会话池、远程命令执行器，以及构建在其上的面板操作

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod output;
pub mod panel;
pub mod routes;
pub mod ssh;
pub mod telemetry;
