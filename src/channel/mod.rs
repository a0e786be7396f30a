use std::sync::Weak;

use serde::Serialize;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::PusherError;
use crate::events::{EventEmitter, Listener};
use crate::protocol::{self, SubscribeData};

/// A named subscription on the shared connection.
///
/// Owned by the connection's registry; holds only a weak handle back to the
/// connection for sends and auth.
pub struct Channel {
    name: String,
    connection: Weak<Connection>,
    events: EventEmitter,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, connection: Weak<Connection>) -> Self {
        Self {
            name: name.into(),
            connection,
            events: EventEmitter::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `private-` / `presence-` channels authenticate before subscribing
    pub fn is_restricted(&self) -> bool {
        protocol::is_restricted_channel(&self.name)
    }

    pub fn bind(&self, event: &str, listener: &Listener) {
        self.events.bind(event, listener);
    }

    pub fn unbind(&self, event: &str, listener: &Listener) {
        self.events.unbind(event, listener);
    }

    /// Deliver an event to this channel's listeners
    pub fn broadcast(&self, event: &str, data: &Value) {
        self.events.broadcast(event, data);
    }

    pub(crate) fn release(&self) {
        self.events.clear();
    }

    /// Send `{event, data}` over the owning connection.
    ///
    /// Fire-and-forget: any failure (connection gone, no open transport,
    /// unserializable data) is swallowed and shows up only as `false`.
    pub fn trigger<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };

        match protocol::encode(event, data) {
            Ok(text) => connection.send(text),
            Err(e) => {
                tracing::debug!(channel = %self.name, event = %event, error = %e, "Failed to encode event");
                false
            }
        }
    }

    /// Send `pusher:subscribe` for this channel.
    ///
    /// Restricted channels are authenticated first. An auth failure goes to
    /// `on_error` and the subscribe is still sent with empty auth; the
    /// server rejects it with a `pusher:error` of its own. Nothing is sent
    /// if, by the time auth finishes, the connection moved to a new epoch
    /// (its own resubscription covers this channel) or the channel was
    /// unsubscribed.
    pub async fn connect<F>(&self, on_error: F) -> bool
    where
        F: Fn(&PusherError),
    {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        let epoch = connection.epoch();
        drop(connection);

        match self.prepare(on_error).await {
            Some(data) => self.send_prepared(epoch, &data),
            None => false,
        }
    }

    /// Build the subscribe payload, authenticating restricted channels.
    /// `None` once the connection is gone.
    pub(crate) async fn prepare<F>(&self, on_error: F) -> Option<SubscribeData>
    where
        F: Fn(&PusherError),
    {
        let connection = self.connection.upgrade()?;

        let mut data = SubscribeData {
            channel: self.name.clone(),
            auth: None,
            channel_data: None,
        };

        if self.is_restricted() {
            match connection.authenticate(&self.name).await {
                Ok(result) => {
                    data.auth = Some(result.auth);
                    data.channel_data = result.channel_data;
                }
                Err(e) => {
                    tracing::warn!(channel = %self.name, error = %e, "Channel auth failed, subscribing without auth");
                    on_error(&e);
                }
            }
        }

        Some(data)
    }

    /// Send a prepared subscribe if `epoch` is still current and this
    /// channel is still registered.
    pub(crate) fn send_prepared(&self, epoch: u64, data: &SubscribeData) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };

        match protocol::subscribe_message(data) {
            Ok(text) => connection.send_subscribe(self, epoch, text),
            Err(e) => {
                tracing::debug!(channel = %self.name, error = %e, "Failed to encode subscribe");
                false
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}
