//! MCP authorization flow: metadata discovery (RFC 8414), dynamic client
//! registration (RFC 7591) and PKCE (RFC 7636).
//!
//! A [`DynamicOAuth`] lives for one connection attempt. It is created when a
//! server answers 401, parked under its CSRF state while the user consents,
//! and consumed by the callback.

use super::pkce::{Pkce, CHALLENGE_METHOD};
use super::tokens::{post_token_form, TokenSet};
use crate::error::{McpError, McpResult};
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Well-known path of the authorization server metadata document.
pub const METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// Name we register under.
pub const CLIENT_NAME: &str = "toolgate MCP client";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Authorization server metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// Where to look for metadata: a trailing `/mcp` segment is dropped first.
pub fn metadata_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    let base = trimmed.strip_suffix("/mcp").unwrap_or(trimmed);
    format!("{base}{METADATA_PATH}")
}

/// Fetch the authorization server metadata for an MCP server URL.
pub async fn discover(http: &Client, server_url: &str) -> McpResult<AuthServerMetadata> {
    let url = metadata_url(server_url);
    info!(url = %url, "Discovering OAuth metadata");

    let response = http
        .get(&url)
        .header("Accept", "application/json")
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await
        .map_err(|e| McpError::Discovery(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(McpError::Discovery(format!("{url} returned {status}")));
    }

    response
        .json()
        .await
        .map_err(|e| McpError::Discovery(format!("invalid metadata from {url}: {e}")))
}

/// A client registered with an authorization server. Persisted so tokens
/// can be refreshed after the flow is gone.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub token_endpoint: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for RegisteredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredClient")
            .field("client_id", &self.client_id)
            .field("has_secret", &self.client_secret.is_some())
            .field("token_endpoint", &self.token_endpoint)
            .finish()
    }
}

#[derive(Deserialize)]
struct RegistrationResponse {
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

/// State of one dynamic authorization attempt.
#[derive(Debug)]
pub struct DynamicOAuth {
    http: Client,
    metadata: AuthServerMetadata,
    redirect_uri: String,
    client: Option<RegisteredClient>,
    pkce: Option<Pkce>,
}

impl DynamicOAuth {
    pub fn new(http: Client, metadata: AuthServerMetadata, redirect_uri: impl Into<String>) -> Self {
        Self {
            http,
            metadata,
            redirect_uri: redirect_uri.into(),
            client: None,
            pkce: None,
        }
    }

    /// Discover metadata for `server_url` and start a flow against it.
    pub async fn discover(
        http: Client,
        server_url: &str,
        redirect_uri: impl Into<String>,
    ) -> McpResult<Self> {
        let metadata = discover(&http, server_url).await?;
        Ok(Self::new(http, metadata, redirect_uri))
    }

    pub fn metadata(&self) -> &AuthServerMetadata {
        &self.metadata
    }

    pub fn client(&self) -> Option<&RegisteredClient> {
        self.client.as_ref()
    }

    /// Register as a public client.
    pub async fn register_client(&mut self) -> McpResult<&RegisteredClient> {
        let endpoint = self
            .metadata
            .registration_endpoint
            .as_deref()
            .ok_or_else(|| McpError::Registration("no registration_endpoint in metadata".to_string()))?;

        info!(endpoint = %endpoint, "Registering OAuth client");

        let body = json!({
            "client_name": CLIENT_NAME,
            "redirect_uris": [self.redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });

        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| McpError::Registration(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::Registration(format!("{status}: {text}")));
        }

        let registered: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| McpError::Registration(format!("invalid response: {e}")))?;
        let client_id = registered
            .client_id
            .ok_or_else(|| McpError::Registration("response has no client_id".to_string()))?;

        debug!(client_id = %client_id, "OAuth client registered");

        Ok(&*self.client.insert(RegisteredClient {
            client_id,
            client_secret: registered.client_secret,
            token_endpoint: self.metadata.token_endpoint.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }))
    }

    /// Create a fresh verifier/challenge pair for this attempt.
    pub fn generate_pkce(&mut self) -> &Pkce {
        self.pkce.insert(Pkce::generate())
    }

    /// Consent URL. Needs a registered client and a PKCE pair.
    pub fn authorization_url(&self, state: &str) -> McpResult<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| McpError::Registration("client not registered".to_string()))?;
        let pkce = self
            .pkce
            .as_ref()
            .ok_or_else(|| McpError::protocol_error("PKCE pair not generated"))?;

        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&state={}&code_challenge={}&code_challenge_method={}",
            self.metadata.authorization_endpoint,
            urlencoding::encode(&client.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state),
            urlencoding::encode(&pkce.challenge),
            CHALLENGE_METHOD,
        ))
    }

    /// Redeem an authorization code together with the PKCE verifier.
    pub async fn exchange_code(&self, code: &str) -> McpResult<TokenSet> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| McpError::TokenExchange("client not registered".to_string()))?;
        let pkce = self
            .pkce
            .as_ref()
            .ok_or_else(|| McpError::TokenExchange("PKCE pair not generated".to_string()))?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", client.client_id.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        info!(endpoint = %client.token_endpoint, "Exchanging authorization code");

        let response = post_token_form(&self.http, &client.token_endpoint, &form)
            .await
            .map_err(McpError::TokenExchange)?;
        Ok(TokenSet::from_response(response, Utc::now()))
    }
}

/// Refresh-token grant using a persisted client registration.
pub async fn refresh(http: &Client, client: &RegisteredClient, old: &TokenSet) -> McpResult<TokenSet> {
    let refresh_token = old
        .refresh_token
        .as_deref()
        .ok_or_else(|| McpError::Refresh("no refresh token stored".to_string()))?;

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client.client_id.as_str()),
    ];
    if let Some(secret) = client.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = post_token_form(http, &client.token_endpoint, &form)
        .await
        .map_err(McpError::Refresh)?;
    Ok(TokenSet::from_response(response, Utc::now()).inherit_refresh_token(old))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::pkce::challenge_for;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REDIRECT: &str = "http://localhost:8080/api/mcp/oauth/callback";

    fn metadata(base: &str) -> serde_json::Value {
        json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/register"),
            "code_challenge_methods_supported": ["S256"]
        })
    }

    async fn mount_auth_server(server: &MockServer, secret: Option<&str>) {
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata(&server.uri())))
            .mount(server)
            .await;

        let mut registration = json!({"client_id": "dyn-client"});
        if let Some(secret) = secret {
            registration["client_secret"] = json!(secret);
        }
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(body_string_contains("\"token_endpoint_auth_method\":\"none\""))
            .and(body_string_contains("\"grant_types\":[\"authorization_code\",\"refresh_token\"]"))
            .respond_with(ResponseTemplate::new(201).set_body_json(registration))
            .mount(server)
            .await;
    }

    #[test]
    fn test_metadata_url() {
        assert_eq!(
            metadata_url("https://mcp.notion.com/mcp"),
            "https://mcp.notion.com/.well-known/oauth-authorization-server"
        );
        assert_eq!(
            metadata_url("https://example.com/"),
            "https://example.com/.well-known/oauth-authorization-server"
        );
        assert_eq!(
            metadata_url("https://example.com/api"),
            "https://example.com/api/.well-known/oauth-authorization-server"
        );
    }

    #[tokio::test]
    async fn test_full_flow() {
        let server = MockServer::start().await;
        mount_auth_server(&server, None).await;

        let mut flow = DynamicOAuth::discover(Client::new(), &format!("{}/mcp", server.uri()), REDIRECT)
            .await
            .unwrap();
        assert_eq!(flow.metadata().token_endpoint, format!("{}/token", server.uri()));

        let client = flow.register_client().await.unwrap();
        assert_eq!(client.client_id, "dyn-client");
        assert!(client.client_secret.is_none());

        let verifier = flow.generate_pkce().verifier.clone();
        let url = flow.authorization_url("state-xyz").unwrap();

        let parsed = url::Url::parse(&url).unwrap();
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "dyn-client");
        assert_eq!(params["redirect_uri"], REDIRECT);
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["state"], "state-xyz");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], challenge_for(&verifier));

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains(format!("code_verifier={verifier}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "dyn-at",
                "refresh_token": "dyn-rt",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = flow.exchange_code("code-1").await.unwrap();
        assert_eq!(tokens.access_token, "dyn-at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("dyn-rt"));
    }

    #[tokio::test]
    async fn test_authorization_url_requires_registration_and_pkce() {
        let meta: AuthServerMetadata =
            serde_json::from_value(metadata("https://auth.example.com")).unwrap();
        let mut flow = DynamicOAuth::new(Client::new(), meta, REDIRECT);
        assert!(matches!(
            flow.authorization_url("s"),
            Err(McpError::Registration(_))
        ));

        flow.client = Some(RegisteredClient {
            client_id: "c".to_string(),
            client_secret: None,
            token_endpoint: "https://auth.example.com/token".to_string(),
            redirect_uri: REDIRECT.to_string(),
        });
        assert!(flow.authorization_url("s").is_err());

        flow.generate_pkce();
        assert!(flow.authorization_url("s").is_ok());
    }

    #[tokio::test]
    async fn test_discovery_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        assert!(matches!(
            discover(&Client::new(), &server.uri()).await,
            Err(McpError::Discovery(_))
        ));
        assert!(matches!(
            discover(&Client::new(), "http://127.0.0.1:1/mcp").await,
            Err(McpError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_redirect_uri"))
            .mount(&server)
            .await;

        let meta: AuthServerMetadata = serde_json::from_value(metadata(&server.uri())).unwrap();
        let mut flow = DynamicOAuth::new(Client::new(), meta, REDIRECT);
        assert!(matches!(
            flow.register_client().await,
            Err(McpError::Registration(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange_sends_secret_when_present() {
        let server = MockServer::start().await;
        mount_auth_server(&server, Some("dyn-secret")).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_secret=dyn-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "a"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut flow = DynamicOAuth::discover(Client::new(), &server.uri(), REDIRECT)
            .await
            .unwrap();
        flow.register_client().await.unwrap();
        flow.generate_pkce();
        flow.exchange_code("c").await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_rejects_empty_body() {
        let server = MockServer::start().await;
        mount_auth_server(&server, None).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut flow = DynamicOAuth::discover(Client::new(), &server.uri(), REDIRECT)
            .await
            .unwrap();
        flow.register_client().await.unwrap();
        flow.generate_pkce();
        assert!(matches!(
            flow.exchange_code("c").await,
            Err(McpError::TokenExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "at-2"})))
            .mount(&server)
            .await;

        let client = RegisteredClient {
            client_id: "c".to_string(),
            client_secret: None,
            token_endpoint: format!("{}/token", server.uri()),
            redirect_uri: REDIRECT.to_string(),
        };
        let old = TokenSet {
            access_token: "at-1".to_string(),
            refresh_token: Some("rt-1".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: None,
        };

        let new = refresh(&Client::new(), &client, &old).await.unwrap();
        assert_eq!(new.access_token, "at-2");
        assert_eq!(new.refresh_token.as_deref(), Some("rt-1"));
    }
}
