use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PusherError {
    /// Transport could not be opened, or an open transport errored or closed.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// The auth endpoint rejected the channel, failed, or answered with a body we could not read.
    #[error("Not authorized for channel {channel}: {reason}")]
    AuthorizationFailure { channel: String, reason: String },

    /// Malformed inbound frame, or a `pusher:error` without a recoverable code.
    #[error("Protocol error: code={code:?}, message={message}")]
    ProtocolError { code: Option<u16>, message: String },

    /// An operation that needs a socket id was attempted before the first connection was established.
    #[error("Precondition failed: {0}")]
    PreconditionFailure(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl PusherError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailure(message.into())
    }

    pub fn unauthorized(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AuthorizationFailure {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(code: Option<u16>, message: impl Into<String>) -> Self {
        Self::ProtocolError {
            code,
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::PreconditionFailure("not yet connected: no socket id assigned".to_string())
    }

    /// Stable short code for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailure(_) => "CONNECTION_FAILURE",
            Self::AuthorizationFailure { .. } => "AUTHORIZATION_FAILURE",
            Self::ProtocolError { .. } => "PROTOCOL_ERROR",
            Self::PreconditionFailure(_) => "PRECONDITION_FAILURE",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Owner-supplied error sink. Every failure that drives recovery instead of
/// surfacing to a caller ends up here.
pub type ErrorCallback = Arc<dyn Fn(&PusherError) + Send + Sync>;

pub type Result<T> = std::result::Result<T, PusherError>;
