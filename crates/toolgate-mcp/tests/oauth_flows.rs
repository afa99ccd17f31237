//! Dynamic OAuth against a stubbed remote server, using the real HTTP
//! transport.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use toolgate_mcp::{
    ConnectionManager, McpError, MemoryTokenStore, OAuthConfig, ServerConfig, ServerStatus,
    TokenStore,
};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACCESS_TOKEN: &str = "remote-access-token";

/// Stub an MCP endpoint at `/mcp` that only answers with a bearer token, plus
/// the authorization server next to it.
async fn protected_server() -> MockServer {
    let server = MockServer::start().await;
    let bearer = format!("Bearer {ACCESS_TOKEN}");

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Authorization", bearer.as_str()))
        .and(body_string_contains("\"initialize\""))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "session-1")
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "remote"}
                    }
                })),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Authorization", bearer.as_str()))
        .and(body_string_contains("notifications/initialized"))
        .respond_with(ResponseTemplate::new(202))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("Authorization", bearer.as_str()))
        .and(body_string_contains("tools/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": [{"name": "search", "description": "Search pages"}]}
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer"),
        )
        .with_priority(10)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "registration_endpoint": format!("{}/register", server.uri()),
            "code_challenge_methods_supported": ["S256"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .and(body_string_contains("\"token_endpoint_auth_method\":\"none\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "registered-client"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": ACCESS_TOKEN,
            "refresh_token": "remote-refresh-token",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    server
}

fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn test_dynamic_oauth_flow() {
    let server = protected_server().await;
    let store = Arc::new(MemoryTokenStore::new());
    let manager = ConnectionManager::new(store.clone());

    let config = ServerConfig::http("remote", format!("{}/mcp", server.uri()))
        .with_oauth(OAuthConfig::Dynamic);
    let registration = manager.register(config).await.unwrap();
    assert_eq!(registration.status, ServerStatus::Connecting);

    let status = manager
        .wait_settled(&registration.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, ServerStatus::PendingAuth);

    let auth_url = manager
        .get_status(&registration.id)
        .await
        .unwrap()
        .auth_url
        .unwrap();
    assert!(auth_url.starts_with(&format!("{}/authorize?", server.uri())));
    assert!(auth_url.contains("code_challenge_method=S256"));
    assert_eq!(
        query_param(&auth_url, "client_id").as_deref(),
        Some("registered-client")
    );
    assert_eq!(
        query_param(&auth_url, "redirect_uri").as_deref(),
        Some("http://localhost:8080/api/mcp/oauth/callback")
    );

    let state = query_param(&auth_url, "state").unwrap();
    let id = manager
        .complete_authorization("auth-code", &state)
        .await
        .unwrap();
    assert_eq!(id, registration.id);

    let summary = &manager.list().await[0];
    assert_eq!(summary.status, ServerStatus::Active);
    assert_eq!(summary.tool_count, 1);

    let tokens = store.load_tokens(&id).await.unwrap().unwrap();
    assert_eq!(tokens.access_token, ACCESS_TOKEN);
    assert!(store.load_oauth_client(&id).await.unwrap().is_some());

    // The state was consumed.
    assert!(matches!(
        manager.complete_authorization("auth-code", &state).await,
        Err(McpError::NoMatchingAuth)
    ));

    manager.remove(&id).await.unwrap();
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_probe_401_without_declared_oauth_still_starts_flow() {
    let server = protected_server().await;
    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));

    let registration = manager
        .register(ServerConfig::http("remote", format!("{}/mcp", server.uri())))
        .await
        .unwrap();
    let status = manager
        .wait_settled(&registration.id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(status, ServerStatus::PendingAuth);
    let report = manager.get_status(&registration.id).await.unwrap();
    assert!(report
        .auth_url
        .is_some_and(|url| url.contains("code_challenge=")));
}

#[tokio::test]
async fn test_discovery_failure_ends_in_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
    let registration = manager
        .register(ServerConfig::http("remote", format!("{}/mcp", server.uri())))
        .await
        .unwrap();
    let status = manager
        .wait_settled(&registration.id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(status, ServerStatus::Error);
    let error = manager
        .get_status(&registration.id)
        .await
        .unwrap()
        .error
        .unwrap();
    assert!(error.contains("discovery"));
}
