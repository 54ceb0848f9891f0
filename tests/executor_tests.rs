//! 远程命令执行器集成测试

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::future::join_all;
use ops_panel::ssh::{CommandExecutor, HostKeyVerification, RemoteTarget, EXECUTOR_FAILURE_CODE};

mod common;
use common::{create_test_executor, FakeConnector};

#[tokio::test]
async fn test_run_true_succeeds() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 2);

    let result = executor.run("true", None).await;

    assert_eq!(result.exit_code, 0);
    assert!(result.stderr.is_empty());
    assert!(result.is_success());
    assert!(!result.timed_out);
}

#[tokio::test]
async fn test_nonzero_exit_is_preserved() {
    let connector = FakeConnector::new();
    connector.respond("ls /missing", "", "ls: cannot access '/missing'\n", 2);
    let executor = create_test_executor(&connector, 2);

    let result = executor.run("ls /missing", None).await;

    assert_eq!(result.exit_code, 2);
    assert!(!result.is_executor_failure());
    assert!(result.stderr.contains("cannot access"));
}

#[tokio::test]
async fn test_sessions_are_reused() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 2);

    for _ in 0..5 {
        assert!(executor.run("uptime", None).await.is_success());
    }

    assert_eq!(connector.connects(), 1);
    assert_eq!(executor.pool_stats().idle, 1);
}

#[tokio::test]
async fn test_unreachable_host_returns_failure_result() {
    let target = RemoteTarget::with_key_file("127.0.0.1", "root", PathBuf::from("/nonexistent/id_rsa"))
        .with_port(1)
        .with_connect_timeout(Duration::from_secs(2))
        .with_host_key_verification(HostKeyVerification::Disabled);
    let executor = CommandExecutor::for_target(target, 1, Duration::from_secs(5));

    let result = executor.run("true", None).await;

    assert_eq!(result.exit_code, EXECUTOR_FAILURE_CODE);
    assert!(!result.stderr.is_empty());
    assert!(result.stdout.is_empty());
    assert_eq!(executor.pool_stats().total(), 0);
}

#[tokio::test]
async fn test_timeout_returns_failure_result() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 1);

    let started = Instant::now();
    let result = executor.run("sleep 5", Some(Duration::from_millis(200))).await;
    let elapsed = started.elapsed();

    assert_eq!(result.exit_code, EXECUTOR_FAILURE_CODE);
    assert!(result.timed_out);
    assert!(result.stderr.contains("timed out"));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

    // 超时的会话被丢弃，名额可以再次使用
    assert_eq!(executor.pool_stats().total(), 0);
    assert!(executor.run("true", None).await.is_success());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_channel_failure_discards_session() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 1);

    let result = executor.run("fail-channel", None).await;

    assert!(result.is_executor_failure());
    assert!(result.stderr.contains("channel closed"));
    assert_eq!(connector.closed(), 1);
    assert_eq!(executor.pool_stats().total(), 0);
}

#[tokio::test]
async fn test_concurrency_bound_with_extra_caller() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 3);

    let results = join_all((0..4).map(|_| executor.run("sleep 0.3", None))).await;

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let exhausted: Vec<_> = results.iter().filter(|r| r.is_executor_failure()).collect();

    assert_eq!(succeeded, 3);
    assert_eq!(exhausted.len(), 1);
    assert!(exhausted[0].stderr.contains("exhausted"));
    assert_eq!(connector.connects(), 3);
}

#[tokio::test]
async fn test_shutdown_closes_idle_sessions() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 2);

    executor.run("true", None).await;
    executor.shutdown().await;

    assert_eq!(connector.closed(), 1);
    assert_eq!(executor.pool_stats().total(), 0);
}

#[tokio::test]
async fn test_cancelled_run_discards_session() {
    let connector = FakeConnector::new();
    let executor = create_test_executor(&connector, 1);

    let cancelled = tokio::time::timeout(Duration::from_millis(50), executor.run("sleep 5", None)).await;
    assert!(cancelled.is_err());

    // 命令可能仍在远端运行，会话不回到空闲集合
    assert_eq!(executor.pool_stats().total(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connector.closed(), 1);

    assert!(executor.run("true", None).await.is_success());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_run_with_input_passes_stdin() {
    let connector = FakeConnector::new();
    connector.respond("wc -c", "5\n", "", 0);
    let executor = create_test_executor(&connector, 1);

    let result = executor.run_with_input("wc -c", b"hello", None).await;

    assert!(result.is_success());
    assert_eq!(result.stdout, "5\n");
    assert_eq!(connector.last_input().unwrap(), b"hello".to_vec());
    assert_eq!(executor.pool_stats().idle, 1);
}
