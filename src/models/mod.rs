//! 数据模型模块
//! 面板操作的请求与响应类型，全部可序列化为 JSON

pub mod diagnose;
pub mod disk;
pub mod panel;
pub mod status;

pub use diagnose::{CheckStatus, DiagnoseCheck, DiagnoseReport};
pub use disk::{DirUsage, DiskStats, DiskUsage, DockerDiskRow, ProjectUsage};
pub use panel::{
    ActionOutcome, BackupEntry, CleanupKind, ImageInfo, LogRequest, RemoteConfigFile,
    RemoteConfigUpdate, ServiceAction, ServiceRequest, ServiceTarget,
};
pub use status::{ContainerInfo, ServerInfo, StatusSnapshot, SystemUsage};
