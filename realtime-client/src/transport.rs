//! Transport seam
//!
//! The connection manager only ever sees a boxed sink/stream pair of
//! WebSocket messages, which keeps the reconnect logic independent of how
//! the socket is opened.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use realtime_core::{StreamError, StreamResult};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

/// Error type of the underlying WebSocket
pub type WsError = tungstenite::Error;

/// Outbound half of an open transport
pub type TransportSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Inbound half of an open transport
pub type TransportStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An open transport, split into its two halves
pub struct Transport {
    pub sink: TransportSink,
    pub stream: TransportStream,
}

impl Transport {
    pub fn new(sink: TransportSink, stream: TransportStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports for the connection manager
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> StreamResult<Transport>;
}

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> StreamResult<Transport> {
        let (ws_stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::transport(e.to_string()))?;

        debug!(
            "[Realtime WS] Handshake with {} completed ({})",
            url,
            response.status()
        );

        let (write, read) = ws_stream.split();
        Ok(Transport::new(Box::pin(write), Box::pin(read)))
    }
}
