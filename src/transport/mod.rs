//! Transport boundary for websocket IO.
//!
//! The connection owns protocol state and policies; a `Transport` only moves
//! text frames.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

mod tungstenite;

pub use self::tungstenite::TungsteniteTransport;

/// Inbound text frames. The stream ending is a clean close; an `Err` item is
/// a transport failure and is the last item the connection will read.
pub type TransportStream = BoxStream<'static, Result<String>>;

/// Write half of an open transport
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<(Box<dyn TransportSink>, TransportStream)>;
}
