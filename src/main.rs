//! 运维面板主入口
//! 默认启动探针服务；其余子命令执行单次面板操作并以 JSON 输出结果

use ops_panel::{
    cli::{self, Command},
    config::AppConfig,
    error::AppError,
    middleware::AppState,
    models::{LogRequest, RemoteConfigUpdate, ServiceRequest},
    panel::OpsPanel,
    routes,
    ssh::{CommandExecutor, TunnelManager},
    telemetry,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().skip(1).collect();

    let command = match cli::parse_args(&args) {
        Ok(Command::Version) => {
            println!("ops-panel {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Ok(Command::Help) => {
            println!("{}", cli::help_text());
            return Ok(());
        }
        Ok(command) => command,
        Err(message) => {
            eprintln!("{}", message);
            println!("{}", cli::help_text());
            std::process::exit(1);
        }
    };

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    // 生产环境应该直接设置环境变量，不依赖 .env 文件
    if let Ok(path) = std::env::var("OPS_ENV") {
        dotenv::from_filename(format!(".env.{}", path)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::from_filename(".env.development").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config.logging);

    // 3. 构建执行器（会话池随之创建，连接按需建立）
    let target = config.remote.to_target()?;
    tracing::info!(
        target = %target.address(),
        max_connections = config.pool.max_connections,
        default_timeout_secs = config.command.default_timeout_secs,
        "Remote command executor ready"
    );
    let executor = Arc::new(CommandExecutor::for_target(
        target,
        config.pool.max_connections,
        config.default_command_timeout(),
    ));

    let exit_code = match command {
        Command::Serve => {
            serve(config, executor.clone()).await?;
            0
        }
        Command::Exec(cmd) => {
            let result = executor.run_default(&cmd).await;
            print_json(&result)?;
            if result.is_success() {
                0
            } else {
                1
            }
        }
        Command::Tunnel => tunnel(&config, &executor).await?,
        command => {
            let panel = OpsPanel::new(executor.clone(), config.panel.clone(), config.remote.host.clone());
            run_panel(&panel, command).await?
        }
    };

    // 4. 关闭会话池
    executor.shutdown().await;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// 执行单次面板操作并输出 JSON，返回退出码
async fn run_panel(panel: &OpsPanel, command: Command) -> anyhow::Result<i32> {
    match command {
        Command::Status => report(panel.status().await),
        Command::Disk => report(panel.disk_usage().await),
        Command::Diagnose => report(panel.diagnose().await),
        Command::Logs { service, lines } => report(panel.logs(LogRequest { service, lines }).await),
        Command::Service {
            action,
            target,
            confirm,
        } => {
            let mut request = ServiceRequest::new(action);
            if let Some(target) = target {
                request = request.with_target(target);
            }
            if confirm {
                request = request.confirmed();
            }
            report(panel.service_action(request).await)
        }
        Command::Cleanup { kind, confirm } => report(panel.cleanup(kind, confirm).await),
        Command::Backups => report(panel.list_backups().await),
        Command::Backup => report(panel.create_backup().await),
        Command::ConfigGet => report(panel.read_remote_config().await),
        Command::ConfigSet { source, confirm } => {
            let content = read_source(&source).await?;
            report(panel.write_remote_config(RemoteConfigUpdate { content, confirm }).await)
        }
        Command::Images => report(panel.current_images().await),
        other => anyhow::bail!("{:?} is not a panel operation", other),
    }
}

fn report<T: Serialize>(outcome: Result<T, AppError>) -> anyhow::Result<i32> {
    match outcome {
        Ok(value) => {
            print_json(&value)?;
            Ok(0)
        }
        Err(e) => {
            tracing::error!(error = %e, "Panel operation failed");
            eprintln!("{}", e);
            Ok(1)
        }
    }
}

/// 读取 `config-set` 的内容，`-` 表示标准输入
async fn read_source(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut content = String::new();
        tokio::io::stdin().read_to_string(&mut content).await?;
        Ok(content)
    } else {
        Ok(tokio::fs::read_to_string(source).await?)
    }
}

/// 建立端口转发，直到 Ctrl+C
async fn tunnel(config: &AppConfig, executor: &CommandExecutor) -> anyhow::Result<i32> {
    let manager = TunnelManager::new(
        executor.pool().connector(),
        config.tunnel.bind_ip()?,
        config.tunnel.to_specs()?,
    );

    let status = match manager.start().await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, "Tunnel failed to start");
            eprintln!("{}", e);
            return Ok(1);
        }
    };
    print_json(&status)?;

    signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, stopping tunnel");

    print_json(&manager.status().await)?;
    manager.stop().await;
    Ok(0)
}

/// 启动探针服务
async fn serve(config: AppConfig, executor: Arc<CommandExecutor>) -> anyhow::Result<()> {
    let addr = config.server.addr.clone();
    let shutdown_timeout = config.server.graceful_shutdown_timeout_secs;

    let app_state = Arc::new(AppState::new(config, executor));
    let app = routes::create_router(app_state);

    let listener = TcpListener::bind(&addr).await?;

    tracing::info!(
        addr = %addr,
        "Server listening"
    );

    // 优雅关闭
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_timeout))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 优雅关闭信号处理
///
/// 收到信号后开始优雅关闭；超过 `timeout_secs` 仍未完成则强制退出。
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    // 超时后强制关闭
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}
