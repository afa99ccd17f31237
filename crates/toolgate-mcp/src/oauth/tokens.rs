//! Token sets and the two token-endpoint grants.

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tokens are treated as expired this long before their real expiry.
pub const EXPIRY_MARGIN_SECS: i64 = 5 * 60;

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Stored OAuth tokens for one server.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry. `None` means the provider did not say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenSet {
    /// Convert a token response, computing expiry relative to `now`.
    ///
    /// A lifetime too large to represent is stored as no expiry.
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_at = response.expires_in.and_then(|secs| {
            Duration::try_seconds(secs).and_then(|lifetime| now.checked_add_signed(lifetime))
        });
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            expires_at,
            scope: response.scope,
        }
    }

    /// Whether the token is still usable at `now` with the safety margin.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => match now.checked_add_signed(Duration::seconds(EXPIRY_MARGIN_SECS)) {
                Some(deadline) => expires_at > deadline,
                None => false,
            },
            None => true,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    /// Keep the previous refresh token when the provider did not rotate it.
    pub fn inherit_refresh_token(mut self, previous: &TokenSet) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        self
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// POST a form to a token endpoint and parse the response.
///
/// Any failure is returned as a message; callers wrap it in the error
/// variant for their grant.
pub(crate) async fn post_token_form(
    client: &Client,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, String> {
    let response = client
        .post(endpoint)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| format!("request to {endpoint} failed: {e}"))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| format!("failed to read response: {e}"))?;

    if status != StatusCode::OK {
        return Err(format!("{status}: {text}"));
    }
    if text.trim().is_empty() {
        return Err("empty response body".to_string());
    }

    serde_json::from_str(&text).map_err(|e| format!("invalid token response: {e}"))
}
