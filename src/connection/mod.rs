//! The single shared transport and everything that rides on it.
//!
//! A `Connection` owns the transport, the reconnect policy, the channel
//! registry and the inbound router. Every connect() starts a new epoch;
//! asynchronous work (transport open, reads, scheduled retries, channel
//! auth) captures the epoch it started in and drops its effect when a newer
//! epoch has begun.

mod backoff;
mod state;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures::stream::FuturesOrdered;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::auth::{AuthClient, AuthResult};
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::{ErrorCallback, PusherError, Result};
use crate::events::{EventEmitter, Listener};
use crate::protocol::{self, lifecycle, ErrorAction, PusherMessage};
use crate::transport::{Transport, TransportSink, TransportStream};

pub use backoff::ReconnectBackoff;
pub use state::ConnectionState;

/// Write side of the transport for one epoch. Dropping it ends the writer
/// task (which closes the sink) and stops the reader.
struct ActiveTransport {
    epoch: u64,
    outbound: mpsc::UnboundedSender<String>,
    _shutdown: broadcast::Sender<()>,
}

pub struct Connection {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    auth_client: Option<Arc<dyn AuthClient>>,
    on_error: ErrorCallback,
    events: EventEmitter,
    state: AtomicU8,
    epoch: AtomicU64,
    socket_id: RwLock<Option<String>>,
    /// Registry order is resubscription order
    channels: RwLock<Vec<Arc<Channel>>>,
    backoff: Mutex<ReconnectBackoff>,
    active: Mutex<Option<ActiveTransport>>,
    /// Recovery already chosen by a `pusher:error` in this epoch. The close
    /// the server sends after it must not start a second one.
    error_action: Mutex<Option<(u64, ErrorAction)>>,
    me: Weak<Connection>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Create a connection in the `Initialized` state. Nothing is opened
    /// until [`Connection::connect`] runs.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        auth_client: Option<Arc<dyn AuthClient>>,
        on_error: ErrorCallback,
    ) -> Arc<Self> {
        let backoff = ReconnectBackoff::with_config(config.backoff.clone());
        Arc::new_cyclic(|me| Self {
            config,
            transport,
            auth_client,
            on_error,
            events: EventEmitter::new(),
            state: AtomicU8::new(ConnectionState::Initialized as u8),
            epoch: AtomicU64::new(0),
            socket_id: RwLock::new(None),
            channels: RwLock::new(Vec::new()),
            backoff: Mutex::new(backoff),
            active: Mutex::new(None),
            error_action: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn app_key(&self) -> &str {
        &self.config.app_key
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    pub fn socket_id(&self) -> Option<String> {
        read(&self.socket_id).clone()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn retry_counter(&self) -> u32 {
        lock(&self.backoff).retry_counter()
    }

    pub fn bind(&self, event: &str, listener: &Listener) {
        self.events.bind(event, listener);
    }

    pub fn unbind(&self, event: &str, listener: &Listener) {
        self.events.unbind(event, listener);
    }

    pub(crate) fn report(&self, error: &PusherError) {
        tracing::warn!(kind = error.kind(), error = %error, "Connection error reported");
        (self.on_error)(error);
    }

    /// Start a new epoch and open the transport.
    ///
    /// Any previous transport is closed first. Failure to open is reported
    /// and retried with backoff.
    pub fn connect(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.close_transport();
        *write(&self.socket_id) = None;
        self.set_state(ConnectionState::Connecting);
        self.events.broadcast(lifecycle::CONNECTING, &Value::Null);

        let url = match protocol::connection_url(&self.config) {
            Ok(url) => url,
            Err(e) => {
                self.report(&e);
                self.schedule_retry(epoch);
                return;
            }
        };

        let Some(this) = self.me.upgrade() else {
            return;
        };

        tracing::info!(epoch, url = %url, "Connecting");
        tokio::spawn(async move {
            this.open(epoch, url).await;
        });
    }

    /// Explicit reconnect from the owner: retry counter back to its floor,
    /// then connect().
    pub fn reconnect(&self) {
        lock(&self.backoff).reset();
        self.connect();
    }

    /// Close the transport and stay down. The channel registry is kept, so a
    /// later [`Connection::reconnect`] resubscribes everything.
    pub fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let previous = ConnectionState::from(
            self.state
                .swap(ConnectionState::Disconnected as u8, Ordering::AcqRel),
        );
        self.close_transport();
        *write(&self.socket_id) = None;

        if previous != ConnectionState::Disconnected {
            tracing::info!(from = %previous, "Disconnected");
            self.events.broadcast(lifecycle::DISCONNECTED, &Value::Null);
        }
    }

    fn close_transport(&self) {
        if let Some(active) = lock(&self.active).take() {
            tracing::debug!(epoch = active.epoch, "Closing transport");
        }
    }

    async fn open(self: Arc<Self>, epoch: u64, url: String) {
        let (sink, stream) = match self.transport.open(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                if !self.is_current(epoch) {
                    tracing::debug!(epoch, error = %e, "Ignoring failure of superseded connect");
                    return;
                }
                self.report(&e);
                self.schedule_retry(epoch);
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        {
            let mut active = lock(&self.active);
            // Checked under the lock so a concurrent connect() either sees this
            // transport and closes it, or has already moved the epoch on.
            if !self.is_current(epoch) {
                tracing::debug!(epoch, "Dropping transport opened by superseded connect");
                return;
            }
            *active = Some(ActiveTransport {
                epoch,
                outbound: outbound_tx,
                _shutdown: shutdown_tx,
            });
        }

        tracing::debug!(epoch, "Transport open, waiting for connection_established");
        tokio::spawn(write_loop(epoch, sink, outbound_rx));
        let weak = Arc::downgrade(&self);
        drop(self);
        read_loop(weak, epoch, stream, shutdown_rx).await;
    }

    fn schedule_retry(&self, epoch: u64) {
        let (delay, retry_counter) = {
            let mut backoff = lock(&self.backoff);
            let counter = backoff.retry_counter();
            (backoff.next_delay(), counter)
        };

        match delay {
            Some(delay) => {
                tracing::info!(
                    epoch,
                    retry_counter,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                self.schedule_connect(epoch, delay);
            }
            None => {
                tracing::error!(
                    epoch,
                    retry_counter,
                    "Reconnect budget exhausted, giving up until reconnect is requested"
                );
            }
        }
    }

    /// connect() after `delay`, unless something else started a new epoch first
    fn schedule_connect(&self, epoch: u64, delay: Duration) {
        let weak = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            if this.is_current(epoch) {
                this.connect();
            } else {
                tracing::debug!(epoch, "Scheduled connect superseded");
            }
        });
    }

    fn on_transport_lost(&self, epoch: u64, error: PusherError) {
        if !self.is_current(epoch) || self.state() == ConnectionState::Disconnected {
            return;
        }

        let handled = match *lock(&self.error_action) {
            Some((handled_epoch, action)) if handled_epoch == epoch => Some(action),
            _ => None,
        };

        self.close_transport();
        *write(&self.socket_id) = None;
        self.set_state(ConnectionState::Connecting);

        match handled {
            Some(action) => {
                tracing::info!(epoch, ?action, error = %error, "Transport closed after pusher:error");
            }
            None => {
                tracing::warn!(epoch, error = %error, "Transport lost");
                self.report(&error);
                self.schedule_retry(epoch);
            }
        }
    }

    /// Handle one inbound frame: global broadcast first, then control
    /// messages, then per-channel routing.
    fn handle_frame(&self, epoch: u64, raw: &str) {
        crate::client::log_inbound(raw);
        tracing::trace!(epoch, raw = %raw, "Inbound frame");

        let message = match PusherMessage::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                self.report(&e);
                return;
            }
        };

        self.events.broadcast(&message.event, &message.data);

        match message.event.as_str() {
            protocol::CONNECTION_ESTABLISHED => self.on_established(epoch, &message.data),
            protocol::ERROR => self.on_protocol_error(&message.data),
            protocol::PING => {
                if let Ok(pong) = protocol::pong_message() {
                    self.send(pong);
                }
            }
            _ => self.route_to_channel(&message),
        }
    }

    fn on_established(&self, epoch: u64, data: &Value) {
        let established = match protocol::parse_connection_established(data) {
            Ok(e) => e,
            Err(e) => {
                self.report(&e);
                return;
            }
        };

        let channels = {
            // Registry lock held while flipping to Connected: a concurrent
            // subscribe() lands either in this snapshot or sees Connected and
            // connects its channel itself, never both.
            let channels = read(&self.channels);
            if !self.is_current(epoch) {
                return;
            }
            let mut socket_id = write(&self.socket_id);
            if let Some(current) = socket_id.as_deref() {
                tracing::warn!(epoch, socket_id = %current, "Duplicate connection_established ignored");
                return;
            }
            *socket_id = Some(established.socket_id.clone());
            drop(socket_id);
            self.set_state(ConnectionState::Connected);
            channels.clone()
        };
        lock(&self.backoff).reset();

        tracing::info!(epoch, socket_id = %established.socket_id, channels = channels.len(), "Connected");
        self.events.broadcast(
            lifecycle::CONNECTED,
            &json!({ "socket_id": established.socket_id }),
        );

        if channels.is_empty() {
            return;
        }

        // Auth for every channel runs concurrently; frames still go out in
        // registry order.
        let mut pending: FuturesOrdered<_> = channels
            .into_iter()
            .map(|channel| {
                let on_error = self.on_error.clone();
                async move {
                    let data = channel.prepare(|e| on_error(e)).await;
                    (channel, data)
                }
            })
            .collect();

        let weak = self.me.clone();
        tokio::spawn(async move {
            while let Some((channel, data)) = pending.next().await {
                match weak.upgrade() {
                    Some(this) if this.is_current(epoch) => {}
                    _ => {
                        tracing::debug!(epoch, "Resubscription sweep superseded");
                        return;
                    }
                }
                let sent = data.is_some_and(|data| channel.send_prepared(epoch, &data));
                if !sent {
                    tracing::debug!(channel = %channel.name(), "Resubscribe not sent");
                }
            }
        });
    }

    fn on_protocol_error(&self, data: &Value) {
        let error = protocol::parse_error_data(data);
        self.events.broadcast(lifecycle::ERROR, data);

        let reported = PusherError::protocol(
            error.code,
            error.message.clone().unwrap_or_default(),
        );
        self.report(&reported);

        let epoch = self.epoch();
        let action = ErrorAction::classify(error.code);
        if action != ErrorAction::ReconnectImmediately {
            *lock(&self.error_action) = Some((epoch, action));
        }
        match action {
            ErrorAction::ReconnectImmediately => {
                tracing::info!(code = ?error.code, "Server asked for immediate reconnect");
                self.connect();
            }
            ErrorAction::ReconnectDelayed => {
                let delay = self.config.error_reconnect_delay_duration();
                tracing::info!(
                    code = ?error.code,
                    delay_ms = delay.as_millis() as u64,
                    "Server asked for delayed reconnect"
                );
                self.schedule_connect(epoch, delay);
            }
            ErrorAction::Fatal => {
                tracing::error!(code = ?error.code, message = ?error.message, "Fatal protocol error, not reconnecting");
            }
        }
    }

    fn route_to_channel(&self, message: &PusherMessage) {
        let Some(name) = message.channel.as_deref() else {
            tracing::trace!(event = %message.event, "Event without channel, not routed");
            return;
        };

        match self.channel(name) {
            Some(channel) => channel.broadcast(&message.event, &message.data),
            None => {
                tracing::debug!(channel = %name, event = %message.event, "Event for unknown channel dropped");
            }
        }
    }

    /// Queue a frame on the current transport. `false` when no transport is
    /// open or its writer has already stopped.
    pub(crate) fn send(&self, text: String) -> bool {
        match lock(&self.active).as_ref() {
            Some(active) => active.outbound.send(text).is_ok(),
            None => false,
        }
    }

    /// Send a subscribe frame for `channel`, unless the connection moved to
    /// a new epoch or the channel left the registry in the meantime.
    pub(crate) fn send_subscribe(&self, channel: &Channel, epoch: u64, text: String) -> bool {
        // Held across the send so unsubscribe() cannot slip its frame in
        // ahead of this one.
        let channels = read(&self.channels);
        if !self.is_current(epoch) {
            tracing::debug!(channel = %channel.name(), epoch, "Dropping subscribe from superseded connection");
            return false;
        }
        if !channels.iter().any(|c| std::ptr::eq(Arc::as_ptr(c), channel)) {
            tracing::debug!(channel = %channel.name(), "Dropping subscribe for unsubscribed channel");
            return false;
        }
        self.send(text)
    }

    /// Fetch an auth token for `channel_name` using the current socket id.
    ///
    /// Fails with `PreconditionFailure` before the first connection is
    /// established, without calling the auth endpoint. Calls that outlast
    /// `auth_timeout_ms` fail with `AuthorizationFailure`.
    pub async fn authenticate(&self, channel_name: &str) -> Result<AuthResult> {
        let socket_id = self.socket_id().ok_or_else(PusherError::not_connected)?;

        let auth_client = self.auth_client.as_ref().ok_or_else(|| {
            PusherError::unauthorized(channel_name, "no auth endpoint configured")
        })?;

        let timeout = self.config.auth_timeout_duration();
        let result = tokio::time::timeout(timeout, auth_client.authorize(channel_name, &socket_id))
            .await
            .map_err(|_| {
                PusherError::unauthorized(
                    channel_name,
                    format!("auth timed out after {}ms", timeout.as_millis()),
                )
            })?;

        result.map_err(|e| match e {
            e @ PusherError::AuthorizationFailure { .. } => e,
            other => PusherError::unauthorized(channel_name, other.to_string()),
        })
    }

    /// Register `name` (or return the existing channel). When connected the
    /// subscribe message goes out right away; otherwise the next
    /// connection_established picks it up.
    pub fn subscribe(&self, name: &str) -> Arc<Channel> {
        let (channel, connect_now) = {
            let mut channels = write(&self.channels);
            if let Some(existing) = channels.iter().find(|c| c.name() == name) {
                return existing.clone();
            }
            let channel = Arc::new(Channel::new(name, self.me.clone()));
            channels.push(channel.clone());
            (channel, self.state() == ConnectionState::Connected)
        };

        tracing::info!(channel = %name, connect_now, "Subscribed to channel");

        if connect_now {
            let to_connect = channel.clone();
            let on_error = self.on_error.clone();
            tokio::spawn(async move {
                to_connect.connect(|e| on_error(e)).await;
            });
        }

        channel
    }

    /// Drop `name` from the registry and send `pusher:unsubscribe`
    /// best-effort. Returns whether the channel was registered.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let removed = {
            let mut channels = write(&self.channels);
            let index = channels.iter().position(|c| c.name() == name);
            index.map(|i| channels.remove(i))
        };

        let Some(channel) = removed else {
            return false;
        };
        channel.release();

        let sent = protocol::unsubscribe_message(name)
            .map(|text| self.send(text))
            .unwrap_or(false);
        tracing::info!(channel = %name, sent, "Unsubscribed from channel");
        true
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        read(&self.channels).iter().find(|c| c.name() == name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        read(&self.channels).iter().map(|c| c.name().to_string()).collect()
    }
}

async fn write_loop(
    epoch: u64,
    mut sink: Box<dyn TransportSink>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = outbound_rx.recv().await {
        if let Err(e) = sink.send(text).await {
            tracing::warn!(epoch, error = %e, "Transport write failed");
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(epoch, error = %e, "Transport close failed");
    }
}

async fn read_loop(
    connection: Weak<Connection>,
    epoch: u64,
    mut stream: TransportStream,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!(epoch, "Reader stopped");
                return;
            }
            frame = stream.next() => {
                let Some(this) = connection.upgrade() else {
                    return;
                };
                if !this.is_current(epoch) {
                    return;
                }
                match frame {
                    Some(Ok(text)) => this.handle_frame(epoch, &text),
                    Some(Err(e)) => {
                        this.on_transport_lost(epoch, e);
                        return;
                    }
                    None => {
                        this.on_transport_lost(epoch, PusherError::connection("transport closed"));
                        return;
                    }
                }
            }
        }
    }
}
