// Shared infrastructure
pub mod config;
pub mod error;
pub mod telemetry;

// Wire protocol and external collaborators
pub mod auth;
pub mod protocol;
pub mod transport;

// Subscription core
pub mod channel;
pub mod client;
pub mod connection;
pub mod events;

// Test doubles for downstream integration tests
pub mod testing;

pub use auth::{AuthClient, AuthResult, HttpAuthClient};
pub use channel::Channel;
pub use client::{Client, ClientBuilder};
pub use config::{BackoffConfig, ClientConfig, Settings};
pub use connection::{Connection, ConnectionState};
pub use error::{PusherError, Result};
pub use events::{EventEmitter, Listener};
