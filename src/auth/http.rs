use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{AuthClient, AuthResult};
use crate::error::{PusherError, Result};

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    channel_name: &'a str,
    socket_id: &'a str,
}

/// POSTs `{channel_name, socket_id}` to the configured endpoint
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    client: Client,
    endpoint: String,
    headers: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl HttpAuthClient {
    pub fn new(endpoint: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            headers,
            timeout: None,
        }
    }

    /// Per-request timeout; a request that runs over it fails as
    /// `AuthorizationFailure`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    #[tracing::instrument(name = "auth.authorize", skip(self, socket_id), fields(endpoint = %self.endpoint))]
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthResult> {
        let mut request = self.client.post(&self.endpoint).json(&AuthRequest {
            channel_name,
            socket_id,
        });
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(channel = %channel_name, error = %e, "Auth request failed");
            PusherError::unauthorized(channel_name, format!("request failed: {}", e))
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            tracing::warn!(channel = %channel_name, status = %status.as_u16(), "Auth endpoint refused channel");
            return Err(PusherError::unauthorized(
                channel_name,
                format!("HTTP {}", status.as_u16()),
            ));
        }

        response.json::<AuthResult>().await.map_err(|e| {
            PusherError::unauthorized(channel_name, format!("invalid auth response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_authorize_posts_channel_and_socket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pusher/auth"))
            .and(header("X-CSRF-Token", "csrf"))
            .and(body_json(json!({"channel_name": "private-room1", "socket_id": "1.2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"auth": "abc:def"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("X-CSRF-Token".to_string(), "csrf".to_string());
        let client = HttpAuthClient::new(format!("{}/pusher/auth", server.uri()), headers);

        let result = client.authorize("private-room1", "1.2").await.unwrap();
        assert_eq!(result.auth, "abc:def");
        assert_eq!(result.channel_data, None);
    }

    #[tokio::test]
    async fn test_authorize_returns_channel_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": "abc:def",
                "channel_data": "{\"user_id\":\"42\"}"
            })))
            .mount(&server)
            .await;

        let client = HttpAuthClient::new(server.uri(), HashMap::new());
        let result = tokio_test::assert_ok!(client.authorize("presence-lobby", "1.2").await);
        assert_eq!(result.channel_data.as_deref(), Some("{\"user_id\":\"42\"}"));
    }

    #[tokio::test]
    async fn test_non_200_is_authorization_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = HttpAuthClient::new(server.uri(), HashMap::new());
        let err = client.authorize("private-room1", "1.2").await.unwrap_err();
        match err {
            PusherError::AuthorizationFailure { channel, reason } => {
                assert_eq!(channel, "private-room1");
                assert_eq!(reason, "HTTP 403");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"auth": "abc:def"})))
            .mount(&server)
            .await;

        let client = HttpAuthClient::new(server.uri(), HashMap::new());
        tokio_test::assert_err!(client.authorize("private-room1", "1.2").await);
    }

    #[tokio::test]
    async fn test_malformed_body_is_authorization_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("nope"))
            .mount(&server)
            .await;

        let client = HttpAuthClient::new(server.uri(), HashMap::new());
        assert!(matches!(
            client.authorize("private-room1", "1.2").await,
            Err(PusherError::AuthorizationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"auth": "abc:def"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = HttpAuthClient::new(server.uri(), HashMap::new())
            .timeout(Duration::from_millis(100));
        let err = tokio_test::assert_err!(client.authorize("private-room1", "1.2").await);
        assert_eq!(err.kind(), "AUTHORIZATION_FAILURE");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_authorization_failure() {
        let client = HttpAuthClient::new("http://127.0.0.1:9/auth", HashMap::new());
        assert!(matches!(
            client.authorize("private-room1", "1.2").await,
            Err(PusherError::AuthorizationFailure { .. })
        ));
    }
}
