//! Connection manager for the realtime event stream
//!
//! Owns the single transport connection, drives the connection state
//! machine, schedules reconnects and replays the subscription registry on
//! every successful (re)connect.
//!
//! One connection task runs per lifecycle (from `connect()` until
//! `disconnect()`). Public operations never touch the transport: they
//! update shared state under a short lock and, while connected, queue
//! control frames on an outbound channel that only exists for the current
//! session.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use realtime_core::{CodecError, ConnectionState, ControlFrame, Frame, StreamError, StreamResult};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::dispatcher::Dispatcher;
use crate::heartbeat::Heartbeat;
use crate::registry::SubscriptionRegistry;
use crate::transport::{Connector, Transport, TransportSink, WsError};

/// Outcome of a connection attempt, shared by every caller awaiting it
pub type ConnectFuture = Shared<BoxFuture<'static, StreamResult<()>>>;

/// Longest inbound payload echoed into logs
const LOG_PREVIEW_LEN: usize = 200;

/// Connection task of the current (or just torn down) lifecycle
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State guarded by the manager's lock
struct Inner {
    registry: SubscriptionRegistry,
    state: ConnectionState,
    /// Present only while connected
    outbound: Option<mpsc::UnboundedSender<ControlFrame>>,
    /// Outcome of the current or most recent attempt
    attempt: Option<ConnectFuture>,
    /// Settles `attempt`; present while that attempt is unresolved
    resolver: Option<oneshot::Sender<StreamResult<()>>>,
    /// Set by `connect()` to cut a reconnect delay short
    retry_requested: bool,
    session: Option<Session>,
}

impl Inner {
    /// Pending attempt future, created if none is outstanding
    fn begin_attempt(&mut self) -> ConnectFuture {
        if self.resolver.is_some() {
            if let Some(attempt) = &self.attempt {
                return attempt.clone();
            }
        }

        let (tx, rx) = oneshot::channel();
        let attempt = async move {
            rx.await
                .unwrap_or_else(|_| Err(StreamError::closed("connection task ended")))
        }
        .boxed()
        .shared();

        self.resolver = Some(tx);
        self.attempt = Some(attempt.clone());
        attempt
    }

    fn settle_attempt(&mut self, outcome: StreamResult<()>) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(outcome);
        }
    }
}

/// Why a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Remote close, stream end or transport error
    Dropped,
    /// Explicit teardown
    Cancelled,
}

/// Drives the single transport connection
pub struct ConnectionManager {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    frame_tx: broadcast::Sender<Frame>,
    retry_now: Notify,
}

impl ConnectionManager {
    /// Fails with [`StreamError::Config`] for settings the task cannot run with
    pub fn new(config: StreamConfig, connector: Arc<dyn Connector>) -> StreamResult<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (frame_tx, _) = broadcast::channel(config.frame_capacity.max(1));

        Ok(Self {
            dispatcher: Dispatcher::new(config.dispatch_key),
            inner: Mutex::new(Inner {
                registry: SubscriptionRegistry::with_topics(config.default_topics.iter().cloned()),
                state: ConnectionState::Disconnected,
                outbound: None,
                attempt: None,
                resolver: None,
                retry_requested: false,
                session: None,
            }),
            state_tx,
            frame_tx,
            retry_now: Notify::new(),
            config,
            connector,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn frames(&self) -> broadcast::Receiver<Frame> {
        self.frame_tx.subscribe()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().registry.snapshot()
    }

    /// Start (or join) a connection attempt
    ///
    /// While connecting or connected this returns the existing attempt, so
    /// concurrent callers share one transport open. During a reconnect
    /// delay it cuts the delay short. Must be called within a Tokio runtime.
    pub fn connect(self: &Arc<Self>) -> ConnectFuture {
        let mut inner = self.inner.lock();
        let state = inner.state;

        match state {
            ConnectionState::Disconnected => {
                let attempt = inner.begin_attempt();
                let cancel = CancellationToken::new();
                let previous = inner.session.take().map(|session| session.task);

                self.set_state(&mut inner, ConnectionState::Connecting);

                let task = tokio::spawn(Arc::clone(self).supervise(cancel.clone(), previous));
                inner.session = Some(Session { cancel, task });
                attempt
            }
            ConnectionState::Connecting => inner.begin_attempt(),
            ConnectionState::Connected => match &inner.attempt {
                Some(attempt) => attempt.clone(),
                None => future::ready(Ok(())).boxed().shared(),
            },
            ConnectionState::ReconnectScheduled => {
                let attempt = inner.begin_attempt();
                inner.retry_requested = true;
                self.retry_now.notify_one();
                debug!("[Realtime WS] Reconnect requested, skipping remaining delay");
                attempt
            }
        }
    }

    /// Tear down the connection and cancel any pending reconnect
    ///
    /// The client stays disconnected until `connect()` is called again.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();

        if inner.state == ConnectionState::Disconnected {
            return;
        }

        if let Some(session) = &inner.session {
            session.cancel.cancel();
        }
        inner.outbound = None;
        inner.retry_requested = false;
        inner.settle_attempt(Err(StreamError::closed(
            "client disconnected before the connection opened",
        )));

        self.set_state(&mut inner, ConnectionState::Disconnected);
        info!("[Realtime WS] Disconnected");
    }

    /// Add a topic; sent now if connected, otherwise on the next connect
    pub fn subscribe(&self, topic: &str) {
        let mut inner = self.inner.lock();
        let added = inner.registry.insert(topic);

        match &inner.outbound {
            Some(outbound) => {
                if outbound.send(ControlFrame::subscribe(topic)).is_err() {
                    debug!("[Realtime WS] Session closing, '{}' will be replayed", topic);
                }
            }
            None if added => {
                debug!("[Realtime WS] Not connected, '{}' will be sent on connect", topic);
            }
            None => {}
        }
    }

    /// Remove a topic; an unsubscribe frame is sent only if it was present
    pub fn unsubscribe(&self, topic: &str) {
        let mut inner = self.inner.lock();

        if !inner.registry.remove(topic) {
            return;
        }

        if let Some(outbound) = &inner.outbound {
            let _ = outbound.send(ControlFrame::unsubscribe(topic));
        }
    }

    /// Send a control frame on the live connection
    ///
    /// Dropped with a warning when not connected; never queued.
    pub fn send(&self, frame: ControlFrame) -> bool {
        let inner = self.inner.lock();

        let Some(outbound) = &inner.outbound else {
            warn!("[Realtime WS] Not connected, dropping {:?}", frame);
            return false;
        };

        match outbound.send(frame) {
            Ok(()) => true,
            Err(mpsc::error::SendError(frame)) => {
                warn!("[Realtime WS] Session closing, dropping {:?}", frame);
                false
            }
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!("[Realtime WS] State {} -> {}", inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Run the connection task, resetting to `Disconnected` if it panics
    async fn supervise(
        self: Arc<Self>,
        cancel: CancellationToken,
        previous: Option<JoinHandle<()>>,
    ) {
        let run = AssertUnwindSafe(Arc::clone(&self).run(cancel.clone(), previous));
        if run.catch_unwind().await.is_err() {
            self.abandon(&cancel);
        }
    }

    /// Tear down the lifecycle owned by `cancel` after its task died
    fn abandon(&self, cancel: &CancellationToken) {
        let mut inner = self.inner.lock();
        if cancel.is_cancelled() {
            return;
        }

        error!("[Realtime WS] Connection task panicked, client is now disconnected");
        cancel.cancel();
        inner.outbound = None;
        inner.retry_requested = false;
        inner.settle_attempt(Err(StreamError::closed("connection task panicked")));
        self.set_state(&mut inner, ConnectionState::Disconnected);
    }

    /// Connection task: connect, serve, back off, repeat until cancelled
    async fn run(self: Arc<Self>, cancel: CancellationToken, previous: Option<JoinHandle<()>>) {
        // The previous lifecycle's socket must be gone before opening a new one
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        let mut first_attempt = true;
        let mut failures = 0u32;

        loop {
            {
                let mut inner = self.inner.lock();
                if cancel.is_cancelled() {
                    return;
                }
                inner.retry_requested = false;
                let _ = inner.begin_attempt();
                self.set_state(&mut inner, ConnectionState::Connecting);
            }

            info!("[Realtime WS] Connecting to {}", self.config.url);

            let result = tokio::select! {
                result = self.connector.connect(&self.config.url) => result,
                _ = cancel.cancelled() => return,
            };

            match result {
                Ok(transport) => {
                    first_attempt = false;
                    failures = 0;

                    let Some(outbound_rx) = self.open_session(&cancel) else {
                        return;
                    };

                    if self.serve(transport, outbound_rx, &cancel).await == SessionEnd::Cancelled {
                        return;
                    }
                }
                Err(e) => {
                    let mut inner = self.inner.lock();
                    if cancel.is_cancelled() {
                        return;
                    }

                    if first_attempt {
                        error!("[Realtime WS] Connection failed: {}", e);
                        inner.settle_attempt(Err(e));
                    } else {
                        warn!("[Realtime WS] Reconnect failed: {}", e);
                    }
                    first_attempt = false;
                }
            }

            failures = failures.saturating_add(1);
            let delay = self.config.backoff.delay(failures);

            {
                let mut inner = self.inner.lock();
                if cancel.is_cancelled() {
                    return;
                }
                inner.outbound = None;
                self.set_state(&mut inner, ConnectionState::ReconnectScheduled);
            }

            info!(
                "[Realtime WS] Reconnecting in {:?} (attempt {})",
                delay, failures
            );

            if !self.wait_for_retry(delay, &cancel).await {
                return;
            }
        }
    }

    /// Enter the connected state and queue the subscription replay
    ///
    /// The replay is queued and the outbound path opened under one lock, so
    /// a concurrent `subscribe` is either part of the replay or sent after it.
    fn open_session(
        &self,
        cancel: &CancellationToken,
    ) -> Option<mpsc::UnboundedReceiver<ControlFrame>> {
        let mut inner = self.inner.lock();
        if cancel.is_cancelled() {
            return None;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let replay = inner.registry.subscribe_frames();
        let replayed = replay.len();
        for frame in replay {
            let _ = outbound_tx.send(frame);
        }

        inner.outbound = Some(outbound_tx);
        self.set_state(&mut inner, ConnectionState::Connected);
        inner.settle_attempt(Ok(()));

        info!(
            "[Realtime WS] Connected, resubscribing {} topic(s)",
            replayed
        );
        Some(outbound_rx)
    }

    /// Pump one connected session until it drops or is cancelled
    async fn serve(
        &self,
        transport: Transport,
        mut outbound_rx: mpsc::UnboundedReceiver<ControlFrame>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        let mut heartbeat = Heartbeat::start(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("[Realtime WS] Close frame not sent: {}", e);
                    }
                    return SessionEnd::Cancelled;
                }

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = Self::write(&mut sink, &frame).await {
                        warn!("[Realtime WS] Failed to send {:?}: {}", frame, e);
                        return SessionEnd::Dropped;
                    }
                }

                msg = stream.next() => {
                    if !self.handle_message(msg, &mut sink).await {
                        return SessionEnd::Dropped;
                    }
                }

                ping = heartbeat.tick() => {
                    if let Err(e) = Self::write(&mut sink, &ping).await {
                        warn!("[Realtime WS] Failed to send ping: {}", e);
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }

    /// Handle one transport event, returns false once the session is over
    async fn handle_message(
        &self,
        msg: Option<Result<Message, WsError>>,
        sink: &mut TransportSink,
    ) -> bool {
        match msg {
            Some(Ok(Message::Text(text))) => {
                match Frame::decode(&text) {
                    Ok(frame) => self.deliver(frame),
                    Err(e) => Self::drop_malformed(&e, &text),
                }
                true
            }
            Some(Ok(Message::Binary(bytes))) => {
                match Frame::decode_bytes(&bytes) {
                    Ok(frame) => self.deliver(frame),
                    Err(e) => Self::drop_malformed(&e, &String::from_utf8_lossy(&bytes)),
                }
                true
            }
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = sink.send(Message::Pong(data)).await {
                    warn!("[Realtime WS] Failed to send pong: {}", e);
                    return false;
                }
                true
            }
            Some(Ok(Message::Close(_))) => {
                info!("[Realtime WS] Connection closed by server");
                false
            }
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                error!("[Realtime WS] Error: {}", e);
                false
            }
            None => {
                info!("[Realtime WS] Stream ended");
                false
            }
        }
    }

    /// Route a decoded frame to handlers and raw-feed observers
    fn deliver(&self, frame: Frame) {
        if self.dispatcher.dispatch(&frame) == 0 {
            debug!(
                "[Realtime WS] No handler for '{}'",
                frame.dispatch_key(self.dispatcher.dispatch_key())
            );
        }
        // No receivers is fine
        let _ = self.frame_tx.send(frame);
    }

    fn drop_malformed(error: &CodecError, raw: &str) {
        warn!(
            "[Realtime WS] Dropping malformed frame ({}): {}",
            error,
            preview(raw)
        );
    }

    async fn write(
        sink: &mut TransportSink,
        frame: &ControlFrame,
    ) -> Result<(), WsError> {
        match frame.encode() {
            Ok(json) => sink.send(Message::Text(json.into())).await,
            Err(e) => {
                error!("[Realtime WS] Failed to encode {:?}: {}", frame, e);
                Ok(())
            }
        }
    }

    /// Sleep out the backoff delay; false if cancelled meanwhile
    async fn wait_for_retry(&self, delay: std::time::Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = cancel.cancelled() => return false,
                _ = self.retry_now.notified() => {
                    // Permits can outlive the request that stored them
                    if self.inner.lock().retry_requested {
                        return true;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

fn preview(raw: &str) -> &str {
    match raw.char_indices().nth(LOG_PREVIEW_LEN) {
        Some((end, _)) => &raw[..end],
        None => raw,
    }
}
