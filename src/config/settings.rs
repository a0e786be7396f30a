use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub client: ClientConfig,
    /// Channels the `pusher-listen` binary subscribes to on startup
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub app_key: String,
    /// Host (and optional port) of the websocket endpoint
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Required only for `private-` and `presence-` channels
    #[serde(default)]
    pub auth_endpoint: Option<String>,
    #[serde(default)]
    pub auth_headers: HashMap<String, String>,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// Fixed delay before reconnecting after a 41xx `pusher:error`
    #[serde(default = "default_error_reconnect_delay_ms")]
    pub error_reconnect_delay_ms: u64,
    /// Upper bound on one channel authorization call
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between two attempts in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0). Anything above zero gives up strict monotonicity.
    #[serde(default)]
    pub jitter_factor: f64,
    /// Stop retrying once cumulative backoff would exceed this
    #[serde(default = "default_give_up_after_ms")]
    pub give_up_after_ms: u64,
}

fn default_cluster() -> String {
    "ws.pusherapp.com".to_string()
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_error_reconnect_delay_ms() -> u64 {
    1000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000 // 1 minute
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_give_up_after_ms() -> u64 {
    3_600_000 // 1 hour
}

impl Settings {
    pub fn new() -> Result<Self> {
        Self::with_env_prefix("PUSHER")
    }

    /// Same layering as [`Settings::new`], reading `{prefix}_*` variables
    pub fn with_env_prefix(prefix: &str) -> Result<Self> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("client.cluster", default_cluster())?
            .set_default("client.error_reconnect_delay_ms", default_error_reconnect_delay_ms() as i64)?
            .set_default("client.auth_timeout_ms", default_auth_timeout_ms() as i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // PUSHER_CLIENT__APP_KEY, PUSHER_CLIENT__CLUSTER, PUSHER_CHANNELS, ...
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("channels"),
            );

        Ok(builder.build()?.try_deserialize()?)
    }
}

impl ClientConfig {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            cluster: default_cluster(),
            auth_endpoint: None,
            auth_headers: HashMap::new(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            error_reconnect_delay_ms: default_error_reconnect_delay_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = Some(endpoint.into());
        self
    }

    pub fn auth_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_headers.insert(name.into(), value.into());
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn error_reconnect_delay(mut self, delay: Duration) -> Self {
        self.error_reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn error_reconnect_delay_duration(&self) -> Duration {
        Duration::from_millis(self.error_reconnect_delay_ms)
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn auth_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: 0.0,
            give_up_after_ms: default_give_up_after_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ClientConfig::new("key");
        assert_eq!(config.cluster, "ws.pusherapp.com");
        assert!(config.auth_endpoint.is_none());
        assert_eq!(config.error_reconnect_delay_ms, 1000);
        assert_eq!(config.backoff.give_up_after_ms, 3_600_000);
        assert_eq!(config.backoff.jitter_factor, 0.0);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"app_key": "abc", "auth_headers": {"X-Token": "t"}}"#)
                .unwrap();
        assert_eq!(config.app_key, "abc");
        assert_eq!(config.cluster, "ws.pusherapp.com");
        assert_eq!(config.auth_headers.get("X-Token").map(String::as_str), Some("t"));
        assert_eq!(config.backoff.initial_delay_ms, 1000);
    }

    #[test]
    fn test_builder_methods() {
        let config = ClientConfig::new("key")
            .cluster("localhost:6001")
            .auth_endpoint("http://localhost/auth")
            .auth_header("Authorization", "Bearer x")
            .error_reconnect_delay(Duration::from_millis(50))
            .auth_timeout(Duration::from_secs(2));
        assert_eq!(config.cluster, "localhost:6001");
        assert_eq!(config.auth_endpoint.as_deref(), Some("http://localhost/auth"));
        assert_eq!(config.auth_headers.len(), 1);
        assert_eq!(config.error_reconnect_delay_duration(), Duration::from_millis(50));
        assert_eq!(config.auth_timeout_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_settings_from_environment() {
        env::set_var("PUSHERENV_CLIENT__APP_KEY", "test-app");
        env::set_var("PUSHERENV_CLIENT__CLUSTER", "localhost:6001");
        env::set_var("PUSHERENV_CLIENT__BACKOFF__MAX_DELAY_MS", "5000");
        env::set_var("PUSHERENV_CHANNELS", "orders,private-room1");

        let settings = Settings::with_env_prefix("PUSHERENV").unwrap();

        assert_eq!(settings.client.app_key, "test-app");
        assert_eq!(settings.client.cluster, "localhost:6001");
        assert_eq!(settings.client.backoff.max_delay_ms, 5000);
        assert_eq!(settings.client.backoff.initial_delay_ms, 1000);
        assert_eq!(settings.client.error_reconnect_delay_ms, 1000);
        assert_eq!(settings.client.auth_timeout_ms, 10_000);
        assert_eq!(settings.channels, vec!["orders", "private-room1"]);
    }

    #[test]
    fn test_missing_app_key_is_config_error() {
        let err = Settings::with_env_prefix("PUSHERMISSING").unwrap_err();
        assert!(matches!(err, crate::error::PusherError::Config(_)));
        assert_eq!(err.kind(), "CONFIG_ERROR");
    }
}
