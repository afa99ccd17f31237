//! Drives the connection manager against the bundled echo server process.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use toolgate_mcp::{
    ConnectionManager, McpError, MemoryTokenStore, ServerConfig, ServerStatus, ToolRouter,
};

const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_echo-mcp-server");

fn echo_config() -> ServerConfig {
    ServerConfig::stdio("echo", ECHO_SERVER, vec![])
}

async fn active_echo(manager: &ConnectionManager) -> String {
    let registration = manager.register(echo_config()).await.unwrap();
    assert_eq!(registration.status, ServerStatus::Connecting);

    let status = manager
        .wait_settled(&registration.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, ServerStatus::Active);
    registration.id
}

#[tokio::test]
async fn test_stdio_server_becomes_active() {
    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
    let id = active_echo(&manager).await;

    let list = manager.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, id);
    assert!(list[0].tool_count > 0);

    let tools = manager.get_tools(&id).await.unwrap();
    assert_eq!(tools[0].name, "echo");

    let result = manager
        .execute(&id, "echo", json!({"text": "over the pipe"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "over the pipe");
    assert!(!result.is_error);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_twice_succeeds() {
    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
    let id = active_echo(&manager).await;

    manager.remove(&id).await.unwrap();
    manager.remove(&id).await.unwrap();

    assert!(manager.list().await.is_empty());
    assert!(matches!(
        manager.get_status(&id).await,
        Err(McpError::UnknownServer(_))
    ));
}

#[tokio::test]
async fn test_missing_command_ends_in_error() {
    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
    let registration = manager
        .register(ServerConfig::stdio(
            "ghost",
            "/definitely/not/a/real/binary",
            vec![],
        ))
        .await
        .unwrap();

    let status = manager
        .wait_settled(&registration.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, ServerStatus::Error);

    let report = manager.get_status(&registration.id).await.unwrap();
    assert!(report.error.is_some());
}

#[tokio::test]
async fn test_router_reaches_server_tools() {
    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
    let id = active_echo(&manager).await;
    let router = ToolRouter::new(manager.clone());

    let names: Vec<String> = router
        .list_tools()
        .await
        .into_iter()
        .map(|tool| tool.name)
        .collect();
    assert_eq!(names, vec![format!("mcp:{id}:echo")]);

    let namespaced = router
        .execute(&format!("mcp:{id}:echo"), json!({"text": "a"}))
        .await
        .unwrap();
    assert_eq!(namespaced["content"][0]["text"], "a");

    let bare = router.execute("echo", json!({"text": "b"})).await.unwrap();
    assert_eq!(bare["content"][0]["text"], "b");

    let stats = router.stats().await;
    assert_eq!(stats["echo"].success, 1);
    assert_eq!(stats[&format!("mcp:{id}:echo")].success, 1);

    manager.shutdown().await;
}
