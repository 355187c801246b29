/// Reconnect supervisor tests: backoff re-dials, attempt-counter reset,
/// and termination on exhaustion.
mod common;

use bridge::client::{BridgeState, SocketBridge};
use common::{CaptureBroker, CaptureConnector, TRADE_FRAME, test_config};
use sb_test_utils::MockMarketServer;
use std::time::Duration;

/// Test: frames published before a disconnect survive it; the client
/// re-dials with backoff, resubscribes, resets the attempt counter, and the
/// pipeline keeps flowing on the new connection.
#[tokio::test]
async fn reconnects_after_server_drop_and_resets_attempts() {
    let server = MockMarketServer::start().await.unwrap();
    let broker = CaptureBroker::new();
    let client = SocketBridge::with_connector(
        test_config(server.url()),
        CaptureConnector::new(broker.clone()),
    );

    client.start().await.expect("start");
    server
        .wait_for_client_messages(1, Duration::from_secs(2))
        .await
        .expect("subscribe frame");

    for _ in 0..10 {
        server.push_frame(TRADE_FRAME);
    }
    broker
        .wait_for_publishes(10, Duration::from_secs(5))
        .await
        .expect("pre-disconnect publishes");

    server.drop_clients();
    server
        .wait_for_connections(2, Duration::from_secs(5))
        .await
        .expect("re-dial");
    server
        .wait_for_client_messages(2, Duration::from_secs(2))
        .await
        .expect("re-subscribe");

    // All pre-disconnect frames were already published; the counter reset.
    let metrics = client.get_metrics();
    assert_eq!(metrics.processed_messages, 10);
    assert_eq!(metrics.reconnect_attempts, 0);

    server.push_frame(TRADE_FRAME);
    broker
        .wait_for_publishes(11, Duration::from_secs(5))
        .await
        .expect("post-reconnect publish");
    assert_eq!(client.state(), BridgeState::Running);

    client.stop().await;
}

/// Test: when the endpoint is gone for good, the supervisor retries
/// `max_attempts` times with backoff, then drops the run flag and fires the
/// termination watch.
#[tokio::test]
async fn reconnect_exhaustion_terminates_client() {
    let server = MockMarketServer::start().await.unwrap();
    let broker = CaptureBroker::new();
    let mut config = test_config(server.url());
    config.reconnect.max_attempts = 2;
    let client = SocketBridge::with_connector(config, CaptureConnector::new(broker));

    client.start().await.expect("start");
    server
        .wait_for_connections(1, Duration::from_secs(2))
        .await
        .expect("connection");

    let mut terminated = client.terminated();
    server.drop_clients();
    server.shutdown();

    tokio::time::timeout(Duration::from_secs(5), terminated.wait_for(|t| *t))
        .await
        .expect("termination watch fires")
        .expect("watch alive");

    assert!(!client.is_running());
    assert_eq!(client.state(), BridgeState::Terminated);
    assert_eq!(client.get_metrics().reconnect_attempts, 2);

    client.stop().await;
}

/// Test: a stop during the backoff loop cancels it quietly.
#[tokio::test]
async fn stop_during_reconnect_cancels_quietly() {
    let server = MockMarketServer::start().await.unwrap();
    let broker = CaptureBroker::new();
    let mut config = test_config(server.url());
    // Long enough that the loop is certainly mid-backoff when stop lands.
    config.reconnect.initial_delay_s = 30.0;
    let client = SocketBridge::with_connector(config, CaptureConnector::new(broker));

    client.start().await.expect("start");
    server
        .wait_for_connections(1, Duration::from_secs(2))
        .await
        .expect("connection");

    server.drop_clients();
    server.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(6), client.stop())
        .await
        .expect("stop returns promptly despite pending backoff");
    assert!(!client.is_running());
}
