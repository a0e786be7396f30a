//! Pusher wire format: envelopes, control messages, and error-code policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{PusherError, Result};

pub const PROTOCOL_VERSION: u8 = 7;

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const ERROR: &str = "pusher:error";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";

/// Names broadcast on the connection's own emitter for lifecycle changes
pub mod lifecycle {
    pub const CONNECTING: &str = "connecting";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const ERROR: &str = "error";
}

/// Inbound envelope. `channel` is present on channel-scoped events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PusherMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub channel: Option<String>,
}

impl PusherMessage {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| PusherError::protocol(None, format!("malformed frame: {}", e)))
    }
}

/// Outbound envelope. Field order on the wire is `event`, then `data`.
#[derive(Debug, Serialize)]
pub struct OutboundMessage<'a, T: Serialize + ?Sized> {
    pub event: &'a str,
    pub data: &'a T,
}

pub fn encode<T: Serialize + ?Sized>(event: &str, data: &T) -> serde_json::Result<String> {
    serde_json::to_string(&OutboundMessage { event, data })
}

/// Body of `pusher:subscribe`. `auth` and `channel_data` are always
/// present on the wire, as `null` when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeData {
    pub channel: String,
    pub auth: Option<String>,
    pub channel_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeData {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

pub fn subscribe_message(data: &SubscribeData) -> serde_json::Result<String> {
    encode(SUBSCRIBE, data)
}

pub fn unsubscribe_message(channel: &str) -> serde_json::Result<String> {
    encode(
        UNSUBSCRIBE,
        &UnsubscribeData {
            channel: channel.to_string(),
        },
    )
}

pub fn pong_message() -> serde_json::Result<String> {
    encode(PONG, &serde_json::json!({}))
}

/// `data` frequently arrives as a JSON document encoded into a string.
/// Unwrap one level of that; anything else is returned unchanged.
pub fn decode_data(data: &Value) -> Value {
    match data {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| data.clone()),
        other => other.clone(),
    }
}

pub fn parse_connection_established(data: &Value) -> Result<ConnectionEstablished> {
    serde_json::from_value(decode_data(data)).map_err(|e| {
        PusherError::protocol(None, format!("invalid connection_established payload: {}", e))
    })
}

pub fn parse_error_data(data: &Value) -> ErrorData {
    serde_json::from_value(decode_data(data)).unwrap_or(ErrorData {
        code: None,
        message: None,
    })
}

/// What to do after a `pusher:error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// 4200 and above: reconnect now
    ReconnectImmediately,
    /// 4100..4200: reconnect after the fixed error delay
    ReconnectDelayed,
    /// Below 4100 or no code: report, no automatic recovery
    Fatal,
}

impl ErrorAction {
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(code) if code >= 4200 => ErrorAction::ReconnectImmediately,
            Some(code) if code >= 4100 => ErrorAction::ReconnectDelayed,
            _ => ErrorAction::Fatal,
        }
    }
}

/// `ws://{cluster}/app/{app_key}?protocol=7&client=..&version=..&flash=false`
pub fn connection_url(config: &ClientConfig) -> Result<String> {
    let base = format!("ws://{}/app", config.cluster);
    let mut url = Url::parse(&base)
        .map_err(|e| PusherError::connection(format!("invalid endpoint {}: {}", base, e)))?;

    // Pushed as one segment, so `/`, `?` or `:` in the key stay inside it
    url.path_segments_mut()
        .map_err(|_| PusherError::connection(format!("endpoint {} cannot carry a path", base)))?
        .push(&config.app_key);

    url.query_pairs_mut()
        .append_pair("protocol", &PROTOCOL_VERSION.to_string())
        .append_pair("client", &config.client_name)
        .append_pair("version", &config.client_version)
        .append_pair("flash", "false");

    Ok(url.into())
}

/// `private-` and `presence-` channels need an auth token before subscribing
pub fn is_restricted_channel(name: &str) -> bool {
    name.starts_with("private-") || name.starts_with("presence-")
}
