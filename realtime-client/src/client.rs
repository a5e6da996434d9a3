//! Public handle over the realtime stream

use std::sync::Arc;

use realtime_core::{ConnectionState, ControlFrame, Frame, StreamResult};
use tokio::sync::{broadcast, watch};

use crate::config::StreamConfig;
use crate::connection::{ConnectFuture, ConnectionManager};
use crate::dispatcher::{Dispatcher, FrameHandler, Registration};
use crate::transport::{Connector, WsConnector};

/// Cheaply cloneable handle to one realtime connection
///
/// Construct one in the composition root and hand clones to consumers.
/// Every clone drives the same connection, subscription set and handlers.
///
/// ```no_run
/// use std::sync::Arc;
/// use realtime_client::{StreamClient, StreamConfig};
/// use realtime_core::Frame;
///
/// # async fn run() -> realtime_core::StreamResult<()> {
/// let client = StreamClient::new(StreamConfig::default())?;
/// client.subscribe("price_updates");
/// client.on("price_update", Arc::new(|frame: &Frame| println!("{:?}", frame.data)));
/// client.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct StreamClient {
    manager: Arc<ConnectionManager>,
}

impl StreamClient {
    /// Client over a real WebSocket
    pub fn new(config: StreamConfig) -> StreamResult<Self> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Client over a custom transport
    pub fn with_connector(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
    ) -> StreamResult<Self> {
        Ok(Self {
            manager: Arc::new(ConnectionManager::new(config, connector)?),
        })
    }

    /// Client configured from the environment
    pub fn from_env() -> StreamResult<Self> {
        Self::new(StreamConfig::from_env()?)
    }

    /// Start connecting; the returned future settles on the first open
    ///
    /// The attempt starts immediately, awaiting the future is optional.
    pub fn connect(&self) -> ConnectFuture {
        self.manager.connect()
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    pub fn subscribe(&self, topic: &str) {
        self.manager.subscribe(topic);
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.manager.unsubscribe(topic);
    }

    /// Register a frame handler under a dispatch key
    pub fn on(&self, key: &str, handler: FrameHandler) -> Registration {
        self.manager.dispatcher().on(key, handler)
    }

    pub fn off(&self, key: &str, handler: &FrameHandler) -> bool {
        self.manager.dispatcher().off(key, handler)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.manager.dispatcher()
    }

    pub fn send(&self, frame: ControlFrame) -> bool {
        self.manager.send(frame)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    /// Every decoded frame, whether or not a handler matched it
    pub fn frames(&self) -> broadcast::Receiver<Frame> {
        self.manager.frames()
    }

    pub fn topics(&self) -> Vec<String> {
        self.manager.topics()
    }

    pub fn config(&self) -> &StreamConfig {
        self.manager.config()
    }
}
