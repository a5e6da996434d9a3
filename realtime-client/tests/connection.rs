mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{client, refused, subscribe_frame, wait_for_state, MockConnector};
use futures::future::join_all;
use realtime_client::{Backoff, Connector, StreamClient, StreamConfig, Transport};
use realtime_core::{ConnectionState, ControlFrame, StreamError, StreamResult};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[tokio::test(start_paused = true)]
async fn test_connect_transitions() {
    let (client, connector, _servers) = client();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let attempt = client.connect();
    assert_eq!(client.state(), ConnectionState::Connecting);

    assert_eq!(attempt.await, Ok(()));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.is_connected());
    assert_eq!(*client.state_changes().borrow(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let (client, connector, mut servers) = client();
    let other = client.clone();

    let outcomes = join_all(vec![client.connect(), other.connect(), client.connect()]).await;

    assert_eq!(outcomes, vec![Ok(()), Ok(()), Ok(())]);
    assert_eq!(connector.attempts(), 1);
    let _server = servers.try_recv().expect("one transport opened");
    assert!(servers.try_recv().is_err());

    // Already connected
    assert_eq!(client.connect().await, Ok(()));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_failure_is_shared_then_retried() {
    let (client, connector, mut servers) = client();
    connector.fail_next(1);

    let outcomes = join_all(vec![client.connect(), client.connect()]).await;
    assert_eq!(outcomes, vec![Err(refused()), Err(refused())]);
    assert_eq!(connector.attempts(), 1);

    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;
    let failed_at = Instant::now();

    let _server = servers.recv().await.expect("retry opens a transport");
    let elapsed = failed_at.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "retried after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "retried after {:?}", elapsed);

    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_topics_before_other_traffic() {
    let (client, connector, mut servers) = client();
    client.subscribe("price_updates");
    client.subscribe("position_updates");
    client.connect().await.unwrap();

    let mut first = servers.recv().await.unwrap();
    assert_eq!(first.next_frame().await, subscribe_frame("price_updates"));
    assert_eq!(first.next_frame().await, subscribe_frame("position_updates"));

    first.close();
    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;
    let dropped_at = Instant::now();

    // Changes while reconnecting only touch the registry
    client.unsubscribe("position_updates");
    client.subscribe("alerts");
    assert_eq!(first.next_message().await, None);

    let mut second = servers.recv().await.unwrap();
    let elapsed = dropped_at.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "reconnected after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "reconnected after {:?}", elapsed);

    wait_for_state(&client, ConnectionState::Connected).await;
    client.subscribe("trade_updates");

    assert_eq!(second.next_frame().await, subscribe_frame("price_updates"));
    assert_eq!(second.next_frame().await, subscribe_frame("alerts"));
    assert_eq!(second.next_frame().await, subscribe_frame("trade_updates"));
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_only_while_connected() {
    let (client, connector, mut servers) = client();
    client.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();

    let connected_at = Instant::now();
    let ping = server.next_frame().await;
    let elapsed = connected_at.elapsed();
    assert_eq!(ping["type"], "ping");
    assert!(ping["timestamp"].is_i64());
    assert!(elapsed >= Duration::from_secs(30), "first ping after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(31), "first ping after {:?}", elapsed);

    connector.fail_next(usize::MAX);
    server.fail();
    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;

    sleep(Duration::from_secs(120)).await;

    // The dead socket saw nothing more and no new socket was opened
    assert_eq!(server.next_message().await, None);
    assert!(servers.try_recv().is_err());
    assert!(connector.attempts() > 2);
    assert_eq!(client.state(), ConnectionState::ReconnectScheduled);

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let (client, connector, mut servers) = client();
    client.connect().await.unwrap();
    let server = servers.recv().await.unwrap();

    server.close();
    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(servers.try_recv().is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_live_socket() {
    let (client, connector, mut servers) = client();
    client.subscribe("alerts");
    client.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();
    assert_eq!(server.next_frame().await, subscribe_frame("alerts"));

    client.disconnect();
    assert!(!client.is_connected());
    assert!(!client.send(ControlFrame::ping()));

    assert_eq!(server.next_message().await, Some(Message::Close(None)));
    assert_eq!(server.next_message().await, None);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);

    // Teardown twice is harmless
    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_reconnecting_skips_delay() {
    let (client, connector, mut servers) = client();
    client.connect().await.unwrap();
    let first = servers.recv().await.unwrap();

    first.close();
    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;

    let requested_at = Instant::now();
    let attempt = client.connect();
    let _second = servers.recv().await.unwrap();

    assert!(requested_at.elapsed() < Duration::from_secs(1));
    assert_eq!(attempt.await, Ok(()));
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_later_failures_keep_connect_pending() {
    let (client, connector, mut servers) = client();
    client.connect().await.unwrap();
    let first = servers.recv().await.unwrap();

    first.close();
    wait_for_state(&client, ConnectionState::ReconnectScheduled).await;
    connector.fail_next(2);

    // Immediate retry fails, the next one 5s later fails, the third succeeds
    let requested_at = Instant::now();
    assert_eq!(client.connect().await, Ok(()));

    let elapsed = requested_at.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "connected after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(11), "connected after {:?}", elapsed);
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_rejects_pending_connect() {
    let (client, connector, _servers) = client();
    connector.fail_next(usize::MAX);

    assert_eq!(client.connect().await, Err(refused()));

    let pending = client.connect();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.attempts(), 2);

    client.disconnect();
    assert!(matches!(pending.await, Err(StreamError::Closed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_disconnect_starts_fresh() {
    let (client, connector, mut servers) = client();
    client.subscribe("alerts");
    client.connect().await.unwrap();
    let mut first = servers.recv().await.unwrap();
    assert_eq!(first.next_frame().await, subscribe_frame("alerts"));

    client.disconnect();
    assert_eq!(client.connect().await, Ok(()));

    let mut second = servers.recv().await.unwrap();
    // The old socket is closed before the new one opens
    assert_eq!(first.next_message().await, Some(Message::Close(None)));
    assert_eq!(first.next_message().await, None);

    assert_eq!(second.next_frame().await, subscribe_frame("alerts"));
    assert_eq!(connector.attempts(), 2);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting() {
    let (client, connector, mut servers) = client();
    connector.hold();

    let pending = client.connect();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(connector.attempts(), 1);

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(pending.await, Err(StreamError::Closed(_))));

    // The abandoned open never turns into a session
    connector.release_one();
    sleep(Duration::from_secs(60)).await;
    assert!(servers.try_recv().is_err());
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected() {
    let (connector, _servers) = MockConnector::new();

    let no_heartbeat = StreamConfig {
        heartbeat_interval: Duration::ZERO,
        ..StreamConfig::default()
    };
    assert!(matches!(
        StreamClient::with_connector(no_heartbeat, connector.clone()),
        Err(StreamError::Config(_))
    ));

    let no_delay = StreamConfig {
        backoff: Backoff::Fixed(Duration::ZERO),
        ..StreamConfig::default()
    };
    assert!(matches!(
        StreamClient::with_connector(no_delay, connector.clone()),
        Err(StreamError::Config(_))
    ));
    assert_eq!(connector.attempts(), 0);
}

/// Connector whose open attempts panic
struct PanickingConnector;

#[async_trait]
impl Connector for PanickingConnector {
    async fn connect(&self, _url: &Url) -> StreamResult<Transport> {
        panic!("connector bug");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_task_resets_to_disconnected() {
    let client =
        StreamClient::with_connector(StreamConfig::default(), Arc::new(PanickingConnector))
            .unwrap();
    client.subscribe("alerts");

    assert!(matches!(client.connect().await, Err(StreamError::Closed(_))));
    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert!(!client.send(ControlFrame::ping()));
    assert_eq!(client.topics(), vec!["alerts"]);

    // A later connect starts a fresh lifecycle instead of hanging
    assert!(matches!(client.connect().await, Err(StreamError::Closed(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
