//! In-memory collaborators for driving a `Client` without a network.
//!
//! [`MockTransport::channel_pair`] returns the transport to hand to the
//! client plus a [`MockServer`] that accepts each opened socket, so tests
//! can script `pusher:*` frames and read what the client wrote.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::auth::{AuthClient, AuthResult};
use crate::error::{PusherError, Result};
use crate::transport::{Transport, TransportSink, TransportStream};

struct MockTransportInner {
    accepted_tx: mpsc::UnboundedSender<MockSocket>,
    failures_remaining: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

/// Transport whose sockets are in-memory channels
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MockTransportInner {
            accepted_tx,
            failures_remaining: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        (
            Self {
                inner: inner.clone(),
            },
            MockServer { accepted_rx, inner },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<(Box<dyn TransportSink>, TransportStream)> {
        if let Ok(mut urls) = self.inner.urls.lock() {
            urls.push(url.to_string());
        }

        let refused = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PusherError::connection("mock transport refused connection"));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        self.inner
            .accepted_tx
            .send(MockSocket {
                url: url.to_string(),
                outbound_rx,
                inbound_tx: Some(inbound_tx),
            })
            .map_err(|_| PusherError::connection("mock server is gone"))?;

        let stream = UnboundedReceiverStream::new(inbound_rx).boxed();
        Ok((Box::new(MockSink { outbound_tx }), stream))
    }
}

struct MockSink {
    outbound_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outbound_tx
            .send(text)
            .map_err(|_| PusherError::connection("mock socket closed"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Server-side test handle paired with [`MockTransport`].
pub struct MockServer {
    accepted_rx: mpsc::UnboundedReceiver<MockSocket>,
    inner: Arc<MockTransportInner>,
}

impl MockServer {
    /// Wait for the client to open its next socket.
    pub async fn accept(&mut self) -> Option<MockSocket> {
        self.accept_timeout(Duration::from_secs(5)).await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockSocket> {
        tokio::time::timeout(timeout, self.accepted_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Refuse the next `n` open attempts.
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.failures_remaining.store(n, Ordering::Release);
    }

    /// Every URL the client tried to open, refused ones included.
    pub fn open_attempts(&self) -> Vec<String> {
        self.inner
            .urls
            .lock()
            .map(|urls| urls.clone())
            .unwrap_or_default()
    }
}

/// One accepted socket.
pub struct MockSocket {
    url: String,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: Option<mpsc::UnboundedSender<Result<String>>>,
}

impl MockSocket {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a raw text frame to the client. `false` once the socket was
    /// dropped or the client stopped reading.
    pub fn send_inbound(&self, text: impl Into<String>) -> bool {
        match self.inbound_tx.as_ref() {
            Some(tx) => tx.send(Ok(text.into())).is_ok(),
            None => false,
        }
    }

    /// Push `{event, data}` (plus `channel` when given)
    pub fn send_event(&self, event: &str, channel: Option<&str>, data: Value) -> bool {
        let mut frame = serde_json::json!({ "event": event, "data": data });
        if let Some(channel) = channel {
            frame["channel"] = Value::String(channel.to_string());
        }
        self.send_inbound(frame.to_string())
    }

    /// Send `pusher:connection_established` with the payload string-encoded
    /// the way the service does.
    pub fn establish(&self, socket_id: &str) -> bool {
        let payload = serde_json::json!({ "socket_id": socket_id, "activity_timeout": 120 });
        self.send_event(
            "pusher:connection_established",
            None,
            Value::String(payload.to_string()),
        )
    }

    pub fn send_error(&self, code: Option<u16>, message: &str) -> bool {
        self.send_event(
            "pusher:error",
            None,
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    /// Deliver a transport error to the client's reader.
    pub fn fail(&mut self, reason: &str) -> bool {
        match self.inbound_tx.take() {
            Some(tx) => tx.send(Err(PusherError::connection(reason))).is_ok(),
            None => false,
        }
    }

    /// Close the inbound side; the client sees a clean close.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    /// Next frame written by the client. `None` once the client closed its
    /// writer and the queue is drained.
    pub async fn recv_outbound(&mut self) -> Option<String> {
        self.recv_outbound_timeout(Duration::from_secs(5)).await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv_outbound().await?;
        serde_json::from_str(&text).ok()
    }

    /// Assert-style helper: no frame within `timeout`.
    pub async fn expect_silence(&mut self, timeout: Duration) -> bool {
        self.recv_outbound_timeout(timeout).await.is_none()
    }
}

/// Auth collaborator that records calls and answers from a script
pub struct MockAuthClient {
    response: std::result::Result<AuthResult, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockAuthClient {
    pub fn granting(auth: &str) -> Self {
        Self {
            response: Ok(AuthResult {
                auth: auth.to_string(),
                channel_data: None,
            }),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn denying(reason: &str) -> Self {
        Self {
            response: Err(reason.to_string()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_channel_data(mut self, channel_data: &str) -> Self {
        if let Ok(result) = self.response.as_mut() {
            result.channel_data = Some(channel_data.to_string());
        }
        self
    }

    /// Hold every answer back for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(channel_name, socket_id)` of every call, in order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuthClient for MockAuthClient {
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((channel_name.to_string(), socket_id.to_string()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response
            .clone()
            .map_err(|reason| PusherError::unauthorized(channel_name, reason))
    }
}
