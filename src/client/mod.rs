//! Public entry point: one `Client` owns exactly one `Connection`.

use std::sync::{Arc, PoisonError, RwLock};

use crate::auth::{AuthClient, HttpAuthClient};
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ErrorCallback, PusherError};
use crate::events::Listener;
use crate::transport::{Transport, TungsteniteTransport};

type LogHook = Arc<dyn Fn(&str) + Send + Sync>;

static LOG_HOOK: RwLock<Option<LogHook>> = RwLock::new(None);

/// Install a process-wide hook that sees every raw inbound frame of every
/// connection, before it is parsed.
pub fn set_log_hook(hook: impl Fn(&str) + Send + Sync + 'static) {
    *LOG_HOOK.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
}

pub fn clear_log_hook() {
    *LOG_HOOK.write().unwrap_or_else(PoisonError::into_inner) = None;
}

pub(crate) fn log_inbound(raw: &str) {
    let hook = LOG_HOOK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(hook) = hook {
        hook(raw);
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    auth_client: Option<Arc<dyn AuthClient>>,
    on_error: Option<ErrorCallback>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            auth_client: None,
            on_error: None,
        }
    }

    /// Defaults to [`TungsteniteTransport`]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Defaults to [`HttpAuthClient`] when `auth_endpoint` is configured
    pub fn auth_client(mut self, auth_client: impl AuthClient) -> Self {
        self.auth_client = Some(Arc::new(auth_client));
        self
    }

    /// Shared variant of [`ClientBuilder::auth_client`]
    pub fn auth_client_arc(mut self, auth_client: Arc<dyn AuthClient>) -> Self {
        self.auth_client = Some(auth_client);
        self
    }

    /// Receives connection, protocol and authorization failures
    pub fn on_error(mut self, callback: impl Fn(&PusherError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Build the client and start connecting. Must be called inside a tokio
    /// runtime.
    pub fn build(self) -> Client {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport::new()));

        let auth_client = self.auth_client.or_else(|| {
            self.config.auth_endpoint.as_ref().map(|endpoint| {
                Arc::new(
                    HttpAuthClient::new(endpoint.clone(), self.config.auth_headers.clone())
                        .timeout(self.config.auth_timeout_duration()),
                ) as Arc<dyn AuthClient>
            })
        });

        let on_error = self.on_error.unwrap_or_else(|| {
            Arc::new(|e: &PusherError| {
                tracing::error!(kind = e.kind(), error = %e, "Unhandled client error");
            })
        });

        let connection = Connection::new(self.config, transport, auth_client, on_error);
        tracing::info!(app_key = %connection.app_key(), "Client created");
        connection.connect();

        Client { connection }
    }
}

/// Facade over one shared connection. Dropping the client disconnects.
pub struct Client {
    connection: Arc<Connection>,
}

impl Client {
    /// Client with the default websocket transport and HTTP auth. Must be
    /// called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn subscribe(&self, channel_name: &str) -> Arc<Channel> {
        self.connection.subscribe(channel_name)
    }

    pub fn unsubscribe(&self, channel_name: &str) -> bool {
        self.connection.unsubscribe(channel_name)
    }

    pub fn channel(&self, channel_name: &str) -> Option<Arc<Channel>> {
        self.connection.channel(channel_name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.connection.channel_names()
    }

    /// Bind on the connection's emitter: sees every inbound event name plus
    /// `connecting`, `connected`, `disconnected` and `error`.
    pub fn bind(&self, event: &str, listener: &Listener) {
        self.connection.bind(event, listener);
    }

    pub fn unbind(&self, event: &str, listener: &Listener) {
        self.connection.unbind(event, listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn socket_id(&self) -> Option<String> {
        self.connection.socket_id()
    }

    /// Reconnect now with a fresh retry budget
    pub fn connect(&self) {
        self.connection.reconnect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
