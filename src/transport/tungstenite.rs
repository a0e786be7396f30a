use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportSink, TransportStream};
use crate::error::{PusherError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` backed transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self
    }
}

struct TungsteniteSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for TungsteniteSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| PusherError::connection(format!("write failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| PusherError::connection(format!("close failed: {}", e)))
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &str) -> Result<(Box<dyn TransportSink>, TransportStream)> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| PusherError::connection(format!("connect to {} failed: {}", url, e)))?;

        let (write, mut read) = ws_stream.split();

        let frames = async_stream::stream! {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => yield Ok(text.as_str().to_owned()),
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(frame = ?frame, "Received close frame");
                        break;
                    }
                    // Pong is handled automatically by tungstenite
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(PusherError::connection(format!("read failed: {}", e)));
                        break;
                    }
                }
            }
        };

        Ok((Box::new(TungsteniteSink { inner: write }), Box::pin(frames)))
    }
}
