//! 命令行参数解析
//!
//! 每个子命令对应一个面板操作；参数不合法时返回可直接打印的错误信息。

use crate::models::{CleanupKind, ServiceAction, ServiceTarget};

/// 子命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    Version,
    Help,
    Exec(String),
    Status,
    Disk,
    Diagnose,
    Logs {
        service: ServiceTarget,
        lines: u32,
    },
    Service {
        action: ServiceAction,
        target: Option<String>,
        confirm: bool,
    },
    Cleanup {
        kind: CleanupKind,
        confirm: bool,
    },
    Backups,
    Backup,
    ConfigGet,
    /// `source` 为文件路径，`-` 表示标准输入
    ConfigSet {
        source: String,
        confirm: bool,
    },
    Images,
    Tunnel,
}

const DEFAULT_LOG_LINES: u32 = 100;

/// 解析参数（不含程序名）
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(first) = args.first() else {
        return Ok(Command::Serve);
    };
    let rest = &args[1..];

    match first.as_str() {
        "serve" => Ok(Command::Serve),
        "--version" => Ok(Command::Version),
        "--help" | "help" => Ok(Command::Help),
        "exec" if !rest.is_empty() => Ok(Command::Exec(rest.join(" "))),
        "exec" => Err("exec 需要要执行的命令".to_string()),
        "status" => Ok(Command::Status),
        "disk" => Ok(Command::Disk),
        "diagnose" => Ok(Command::Diagnose),
        "logs" => parse_logs(rest),
        "service" => parse_service(rest),
        "cleanup" => parse_cleanup(rest),
        "backups" => Ok(Command::Backups),
        "backup" => Ok(Command::Backup),
        "config-get" => Ok(Command::ConfigGet),
        "config-set" => parse_config_set(rest),
        "images" => Ok(Command::Images),
        "tunnel" => Ok(Command::Tunnel),
        other => Err(format!("未知参数: {}", other)),
    }
}

fn parse_logs(rest: &[String]) -> Result<Command, String> {
    let service = match rest.first() {
        Some(name) => name.parse()?,
        None => ServiceTarget::default(),
    };
    let lines = match rest.get(1) {
        Some(n) => n.parse().map_err(|_| format!("无效的行数: {}", n))?,
        None => DEFAULT_LOG_LINES,
    };
    if rest.len() > 2 {
        return Err(format!("多余的参数: {}", rest[2]));
    }
    Ok(Command::Logs { service, lines })
}

fn parse_service(rest: &[String]) -> Result<Command, String> {
    let action = rest
        .first()
        .ok_or_else(|| "service 需要操作名: start|stop|restart|update|rebuild|clean-logs".to_string())?
        .parse()?;

    let mut target = None;
    let mut confirm = false;
    let mut iter = rest[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--confirm" => confirm = true,
            "--target" => {
                let name = iter.next().ok_or_else(|| "--target 需要容器名".to_string())?;
                target = Some(name.clone());
            }
            other => return Err(format!("未知参数: {}", other)),
        }
    }

    Ok(Command::Service {
        action,
        target,
        confirm,
    })
}

fn parse_cleanup(rest: &[String]) -> Result<Command, String> {
    let kind = rest
        .first()
        .ok_or_else(|| "cleanup 需要清理类型: docker-cache|docker-images|logs".to_string())?
        .parse()?;
    let confirm = parse_confirm_only(&rest[1..])?;
    Ok(Command::Cleanup { kind, confirm })
}

fn parse_config_set(rest: &[String]) -> Result<Command, String> {
    let source = rest
        .first()
        .ok_or_else(|| "config-set 需要文件路径（- 表示标准输入）".to_string())?
        .clone();
    let confirm = parse_confirm_only(&rest[1..])?;
    Ok(Command::ConfigSet { source, confirm })
}

fn parse_confirm_only(rest: &[String]) -> Result<bool, String> {
    let mut confirm = false;
    for arg in rest {
        match arg.as_str() {
            "--confirm" => confirm = true,
            other => return Err(format!("未知参数: {}", other)),
        }
    }
    Ok(confirm)
}

/// 帮助信息
pub fn help_text() -> String {
    format!(
        "ops-panel {version}

用法: ops-panel [命令]

命令:
  serve                                 启动探针服务（默认）
  exec <command>                        在远程主机执行命令并输出 JSON 结果
  status                                输出容器与主机状态
  disk                                  输出磁盘使用情况
  diagnose                              输出诊断报告
  logs [backend|frontend] [lines]       输出容器日志（默认 backend 100 行）
  service <action> [--target NAME] [--confirm]
                                        服务操作: start|stop|restart|update|rebuild|clean-logs
  cleanup <kind> [--confirm]            清理: docker-cache|docker-images|logs
  backups                               列出备份
  backup                                创建备份
  config-get                            输出远程 .env
  config-set <file|-> [--confirm]       写入远程 .env（- 读取标准输入）
  images                                列出镜像
  tunnel                                按配置建立端口转发，Ctrl+C 结束

选项:
  --version                             打印版本信息并退出
  --help                                打印此帮助信息并退出

环境变量:
  所有配置通过 OPS_ 前缀的环境变量完成，例如 OPS_REMOTE__HOST
  可用选项请参考 .env.example",
        version = env!("CARGO_PKG_VERSION")
    )
}
