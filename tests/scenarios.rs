//! End-to-end scenarios against a real spawned tool server. The fixture
//! binary lives in `src/bin/echo_server.rs` and speaks the same
//! line-delimited JSON-RPC dialect as any production tool server.

use codeharness::config::{ExecutionConfig, HistoryConfig, ServerConfig};
use codeharness::connection::{Connection, ConnectionError, Timeouts};
use codeharness::eager::EagerPromptQueue;
use codeharness::execution::{ExecOutcome, ExecRequest, ExecutionEngine};
use codeharness::history::HistoryStore;
use codeharness::manager::{ConnectionManager, ManagerError, ToolDispatcher};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn fixture_command() -> String {
    env!("CARGO_BIN_EXE_echo_server").to_string()
}

fn server(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: fixture_command(),
        args: Vec::new(),
        env: HashMap::new(),
        workdir: None,
        pool: None,
    }
}

fn pooled_server(name: &str, pool: &str, prefix: &str) -> ServerConfig {
    let mut config = server(name);
    config.pool = Some(pool.to_string());
    config
        .env
        .insert("ECHO_PREFIX".to_string(), prefix.to_string());
    config
}

async fn manager_with(servers: &[ServerConfig]) -> (Arc<ConnectionManager>, Arc<HistoryStore>) {
    let history = Arc::new(HistoryStore::new(HistoryConfig::default()));
    let manager = Arc::new(
        ConnectionManager::start(servers, Timeouts::default(), Arc::clone(&history)).await,
    );
    (manager, history)
}

#[tokio::test]
async fn echo_round_trip_records_history() {
    let (manager, history) = manager_with(&[server("utilities")]).await;

    let result = manager
        .call("utilities", "echo", json!({"text": "hi"}))
        .await
        .expect("echo call");
    assert_eq!(result, "hi");

    let entries = history.snapshot();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].payload.contains("utilities/echo"));
    assert!(entries[0].payload.contains("hi"));

    manager.shutdown().await;
}

#[tokio::test]
async fn bare_tool_names_resolve_in_registration_order() {
    let (manager, _history) = manager_with(&[server("utilities")]).await;

    let (target, tool) = manager.resolve_tool("echo").await.expect("resolve");
    assert_eq!(target, "utilities");
    assert_eq!(tool, "echo");

    let (target, tool) = manager
        .resolve_tool("utilities/sleep_then_echo")
        .await
        .expect("compound resolve");
    assert_eq!(target, "utilities");
    assert_eq!(tool, "sleep_then_echo");

    let error = manager.resolve_tool("no_such_tool").await.expect_err("miss");
    assert!(matches!(error, ManagerError::ToolNotFound { .. }));

    manager.shutdown().await;
}

#[tokio::test]
async fn handshake_captures_instructions_and_catalog() {
    let connection = Connection::start(server("utilities"), Timeouts::default())
        .await
        .expect("handshake");

    let instructions = connection.instructions().await.expect("instructions");
    assert!(instructions.contains("Echoes"));

    let tools = connection.tools().await;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"echo"));
    assert!(names.contains(&"sleep_then_echo"));

    connection.shutdown().await;
}

#[tokio::test]
async fn timed_out_request_resolves_once_and_late_response_is_dropped() {
    let connection = Connection::start(server("utilities"), Timeouts::default())
        .await
        .expect("handshake");

    let error = connection
        .call_tool(
            "sleep_then_echo",
            json!({"text": "late", "delay_ms": 800}),
            Duration::from_millis(150),
        )
        .await
        .expect_err("deadline must fire first");
    assert!(matches!(error, ConnectionError::Timeout { .. }));

    // Let the late response arrive; it must land as a no-op, not as the
    // answer to the next request.
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let result = connection
        .call_tool("echo", json!({"text": "fresh"}), Duration::from_secs(5))
        .await
        .expect("correlation intact after timeout");
    assert_eq!(
        result,
        json!({ "content": [{ "type": "text", "text": "fresh" }] })
    );

    connection.shutdown().await;
}

#[tokio::test]
async fn list_changed_notification_refreshes_the_catalog() {
    let connection = Connection::start(server("utilities"), Timeouts::default())
        .await
        .expect("handshake");

    assert!(!connection.tools().await.iter().any(|t| t.name == "extra"));

    connection
        .call_tool("notify_changed", json!({}), Duration::from_secs(5))
        .await
        .expect("notify call");
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(connection.tools().await.iter().any(|t| t.name == "extra"));

    connection.shutdown().await;
}

#[tokio::test]
async fn catalog_refresh_honors_configured_call_timeout() {
    let mut config = server("utilities");
    config
        .env
        .insert("ECHO_LIST_DELAY_MS".to_string(), "400".to_string());
    let timeouts = Timeouts {
        handshake: Duration::from_secs(10),
        call: Duration::from_millis(100),
    };
    let connection = Connection::start(config, timeouts)
        .await
        .expect("handshake tolerates the slow catalog");

    connection
        .call_tool("notify_changed", json!({}), Duration::from_secs(5))
        .await
        .expect("notify call");
    tokio::time::sleep(Duration::from_millis(800)).await;

    // The refresh gave up at the connection's configured 100ms deadline,
    // well before the 400ms-delayed answer; the catalog stays as it was.
    assert!(!connection.tools().await.iter().any(|t| t.name == "extra"));

    connection.shutdown().await;
}

#[tokio::test]
async fn corrupt_line_does_not_break_the_stream() {
    let (manager, _history) = manager_with(&[server("utilities")]).await;

    let result = manager
        .call("utilities", "noisy_echo", json!({"text": "still here"}))
        .await
        .expect("call survives a corrupt line");
    assert_eq!(result, "still here");

    // Subsequent traffic is unaffected.
    let result = manager
        .call("utilities", "echo", json!({"text": "after"}))
        .await
        .expect("stream still usable");
    assert_eq!(result, "after");

    manager.shutdown().await;
}

#[tokio::test]
async fn pool_routes_concurrent_calls_to_different_members() {
    let (manager, _history) = manager_with(&[
        pooled_server("worker-a", "workers", "a"),
        pooled_server("worker-b", "workers", "b"),
    ])
    .await;

    let slow = json!({"text": "x", "delay_ms": 300});
    let (first, second) = tokio::join!(
        manager.call("workers", "sleep_then_echo", slow.clone()),
        manager.call("workers", "sleep_then_echo", slow.clone()),
    );
    let mut results = vec![first.expect("first call"), second.expect("second call")];
    results.sort();
    assert_eq!(results, vec!["a:x", "b:x"]);

    // Permits released: counters return to zero.
    assert_eq!(manager.pool_usage("workers"), Some(vec![0, 0]));

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_handshake_excludes_only_that_server() {
    let mut bogus = server("broken");
    bogus.command = "/nonexistent/tool-server".to_string();
    let (manager, _history) = manager_with(&[bogus, server("utilities")]).await;

    let result = manager
        .call("utilities", "echo", json!({"text": "alive"}))
        .await
        .expect("healthy server unaffected");
    assert_eq!(result, "alive");

    let error = manager
        .call("broken", "echo", json!({"text": "x"}))
        .await
        .expect_err("excluded from routing");
    assert!(matches!(error, ManagerError::ServerNotFound { .. }));

    manager.shutdown().await;
}

#[tokio::test]
async fn tool_error_results_surface_as_failures() {
    let (manager, history) = manager_with(&[server("utilities")]).await;

    let error = manager
        .call("utilities", "fail", json!({"message": "disk on fire"}))
        .await
        .expect_err("isError result");
    match error {
        ManagerError::ToolFailed { tool, message } => {
            assert_eq!(tool, "fail");
            assert!(message.contains("disk on fire"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let entries = history.snapshot();
    assert!(entries[0].payload.contains("error:"));

    manager.shutdown().await;
}

#[tokio::test]
async fn executed_code_reaches_tools_through_the_manager() {
    let (manager, history) = manager_with(&[server("utilities")]).await;

    let queue = Arc::new(EagerPromptQueue::new());
    let engine = ExecutionEngine::new(
        Arc::clone(&manager) as Arc<dyn ToolDispatcher>,
        Arc::clone(&queue),
        Arc::clone(&history),
        ExecutionConfig::default(),
    );

    let code = concat!(
        "echo '{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",",
        "\"params\":{\"name\":\"echo\",\"arguments\":{\"text\":\"from-child\"}}}'\n",
        "read reply\n",
        "echo \"reply:$reply\"\n",
    );
    let outcome = engine
        .execute(ExecRequest {
            code: code.to_string(),
            runtime: "sh".to_string(),
            timeout_ms: None,
        })
        .await
        .expect("execute");

    let ExecOutcome::Completed(report) = outcome else {
        panic!("expected synchronous completion");
    };
    assert!(report.success, "stderr: {}", report.error);
    assert!(report.output.contains("from-child"), "output: {}", report.output);

    // Both the execution and the intercepted tool call were recorded.
    let entries = history.snapshot();
    assert!(entries.iter().any(|e| e.payload.contains("utilities/echo")));
    assert!(entries.len() >= 3);

    manager.shutdown().await;
}
