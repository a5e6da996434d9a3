//! In-memory transport for driving the client without a network
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use realtime_client::{Connector, StreamClient, StreamConfig, Transport, WsError};
use realtime_core::{ConnectionState, StreamError, StreamResult};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Server end of one accepted mock connection
pub struct MockServer {
    received: mpsc::UnboundedReceiver<Message>,
    inbound: mpsc::UnboundedSender<Result<Message, WsError>>,
}

impl MockServer {
    /// Next message the client wrote, None once the client let go of the socket
    pub async fn next_message(&mut self) -> Option<Message> {
        self.received.recv().await
    }

    /// Next text frame the client wrote, parsed as JSON
    pub async fn next_frame(&mut self) -> Value {
        match self.next_message().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).expect("client sent JSON"),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Everything the client has written so far, without waiting
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = self.received.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn push(&self, frame: Value) {
        self.push_message(Message::Text(frame.to_string().into()));
    }

    pub fn push_raw(&self, text: &str) {
        self.push_message(Message::Text(text.to_string().into()));
    }

    pub fn push_message(&self, message: Message) {
        let _ = self.inbound.send(Ok(message));
    }

    /// Server-initiated close
    pub fn close(&self) {
        self.push_message(Message::Close(None));
    }

    /// Transport error on the client's read side
    pub fn fail(&self) {
        let _ = self.inbound.send(Err(WsError::ConnectionClosed));
    }
}

/// Connector handing out in-memory transports
///
/// Every successful open is announced on the accept channel.
pub struct MockConnector {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    held: AtomicBool,
    release: Semaphore,
    accept_tx: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            release: Semaphore::new(0),
            accept_tx,
        });
        (connector, accept_rx)
    }

    /// Number of open attempts seen so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse the next `count` open attempts
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Park every open attempt until [`MockConnector::release_one`]
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let one parked open attempt continue
    pub fn release_one(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &Url) -> StreamResult<Transport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.held.load(Ordering::SeqCst) {
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(refused());
        }

        let (client_tx, received) = mpsc::unbounded_channel::<Message>();
        let (inbound, client_rx) = mpsc::unbounded_channel::<Result<Message, WsError>>();

        let sink = futures::sink::unfold(client_tx, |tx, message: Message| async move {
            tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
            Ok::<_, WsError>(tx)
        });
        let stream = futures::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let _ = self.accept_tx.send(MockServer { received, inbound });
        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Error every refused attempt fails with
pub fn refused() -> StreamError {
    StreamError::transport("connection refused")
}

pub fn client_with(
    config: StreamConfig,
) -> (StreamClient, Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
    let (connector, servers) = MockConnector::new();
    let client =
        StreamClient::with_connector(config, connector.clone()).expect("valid client config");
    (client, connector, servers)
}

pub fn client() -> (StreamClient, Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
    client_with(StreamConfig::default())
}

/// Wait until the client reaches `state`
pub async fn wait_for_state(client: &StreamClient, state: ConnectionState) {
    let mut changes = client.state_changes();
    changes
        .wait_for(|current| *current == state)
        .await
        .expect("state channel open");
}

pub fn subscribe_frame(topic: &str) -> Value {
    serde_json::json!({ "type": "subscribe", "topic": topic })
}

pub fn unsubscribe_frame(topic: &str) -> Value {
    serde_json::json!({ "type": "unsubscribe", "topic": topic })
}
