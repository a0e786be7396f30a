mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::http::HttpAuthClient;

/// Token (and optional presence payload) granted for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub auth: String,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Grants access to restricted channels.
///
/// Any failure must come back as `PusherError::AuthorizationFailure`.
#[async_trait]
pub trait AuthClient: Send + Sync + 'static {
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthResult>;
}
