//! Ephemeral token issuance over HTTP.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroizing;

use super::base::{EphemeralToken, RealtimeError, RealtimeResult, TokenProvider};

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches a session token with `POST {endpoint}`.
///
/// Accepts either `{"client_secret": {"value", "expires_at"}}` or a flat
/// `{"token" | "value", "expires_at"?}` body.
pub struct HttpTokenProvider {
    endpoint: Url,
    client: reqwest::Client,
    bearer: Option<Zeroizing<String>>,
    body: Option<Value>,
}

impl HttpTokenProvider {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            bearer: None,
            body: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(Zeroizing::new(token.into()));
        self
    }

    /// JSON body sent with the request (for example the desired model)
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Pull the token out of either accepted response shape.
pub fn parse_token_response(body: &Value) -> Option<EphemeralToken> {
    let (holder, value) = match body.get("client_secret") {
        Some(secret) => (secret, secret.get("value")),
        None => (body, body.get("token").or_else(|| body.get("value"))),
    };
    let value = value?.as_str().filter(|v| !v.is_empty())?;
    let expires_at = holder
        .get("expires_at")
        .or_else(|| body.get("expires_at"))
        .and_then(Value::as_i64);
    Some(EphemeralToken::new(value, expires_at))
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> RealtimeResult<EphemeralToken> {
        debug!(endpoint = %self.endpoint, "Requesting ephemeral token");

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .timeout(TOKEN_REQUEST_TIMEOUT);
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer.as_str());
        }
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RealtimeError::Timeout("token request".to_string())
            } else {
                RealtimeError::ConnectionFailed(format!("token request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Token endpoint refused request");
            return Err(RealtimeError::AuthenticationFailed(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RealtimeError::SerializationError(format!("token response: {}", e)))?;

        parse_token_response(&body).ok_or_else(|| {
            RealtimeError::AuthenticationFailed("token response carried no token".to_string())
        })
    }
}

/// Provider for a token already in hand (tests, CLI).
pub struct StaticTokenProvider(EphemeralToken);

impl StaticTokenProvider {
    pub fn new(value: impl Into<String>) -> Self {
        Self(EphemeralToken::new(value, None))
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> RealtimeResult<EphemeralToken> {
        if self.0.value().is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "empty static token".to_string(),
            ));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_secret_shape() {
        let token = parse_token_response(&json!({
            "client_secret": {"value": "ek_123", "expires_at": 1700000000}
        }))
        .unwrap();
        assert_eq!(token.value(), "ek_123");
        assert_eq!(token.expires_at(), Some(1700000000));
    }

    #[test]
    fn test_parse_flat_shapes() {
        let token = parse_token_response(&json!({"token": "t1"})).unwrap();
        assert_eq!(token.value(), "t1");
        assert_eq!(token.expires_at(), None);

        let token = parse_token_response(&json!({"value": "t2", "expires_at": 5})).unwrap();
        assert_eq!(token.value(), "t2");
        assert_eq!(token.expires_at(), Some(5));
    }

    #[test]
    fn test_parse_rejects_missing_or_empty() {
        assert!(parse_token_response(&json!({})).is_none());
        assert!(parse_token_response(&json!({"token": ""})).is_none());
        assert!(parse_token_response(&json!({"client_secret": {}})).is_none());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let token = StaticTokenProvider::new("abc").fetch_token().await.unwrap();
        assert_eq!(token.value(), "abc");
        assert!(StaticTokenProvider::new("").fetch_token().await.is_err());
    }
}
