//! Realtime stream client for the trading dashboard
//!
//! Holds one WebSocket connection to the dashboard server, multiplexes topic
//! subscriptions over it and routes inbound frames to registered handlers.
//! Dropped connections are re-established automatically and every topic is
//! re-subscribed on reconnect.
//!
//! Configuration can be read from environment variables, see
//! [`StreamConfig::from_env`]:
//! - `REALTIME_WS_URL` - Server base, e.g. `ws://localhost:8000`
//! - `REALTIME_TOPICS` - Comma-separated topics subscribed at startup

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod registry;
pub mod transport;

pub use client::StreamClient;
pub use config::{Backoff, StreamConfig};
pub use connection::{ConnectFuture, ConnectionManager};
pub use dispatcher::{Dispatcher, FrameHandler, Handler, HandlerId, Publisher, Registration};
pub use heartbeat::Heartbeat;
pub use registry::SubscriptionRegistry;
pub use transport::{Connector, Transport, TransportSink, TransportStream, WsConnector, WsError};
