//! Stream client integration tests against a loopback WebSocket server.
//!
//! The upstream protocol is small enough to fake end to end: accept the
//! socket, read the auth/subscription frame, push vessel frames back. All
//! reconnect scenarios use a shortened backoff base so the full budget runs
//! in well under a second.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use harborwatch_backend::{
    models::{RegionBounds, SubscriptionFilter},
    stream::{ConnectionState, StreamClientConfig, StreamConnectionClient, StreamEvent},
};

const POSITION_FRAME: &str = r#"{
    "MessageType": "PositionReport",
    "MetaData": {
        "MMSI": 244660920,
        "latitude": 52.36,
        "longitude": 4.88,
        "time_utc": "2024-03-01 12:34:56.789012345 +0000 UTC"
    },
    "Message": {
        "PositionReport": {
            "Sog": 12.3,
            "Cog": 284.5,
            "TrueHeading": 285,
            "NavigationalStatus": 0
        }
    }
}"#;

const MALFORMED_FRAME: &str = r#"{
    "MessageType": "PositionReport",
    "MetaData": {"MMSI": 1, "latitude": 1.0, "longitude": 2.0},
    "Message": {"PositionReport": {"Cog": 10.0}}
}"#;

const UNRECOGNIZED_FRAME: &str =
    r#"{"MessageType": "AidsToNavigationReport", "MetaData": {"MMSI": 1}}"#;

fn mediterranean_filter() -> SubscriptionFilter {
    SubscriptionFilter::from_boxes(vec![RegionBounds::new(30.0, 46.0, -6.0, 37.0)])
}

fn client_config(url: String, backoff_base_ms: u64) -> StreamClientConfig {
    StreamClientConfig {
        url,
        api_key: "test-key".to_string(),
        backoff_base_ms,
        max_reconnect_attempts: 5,
        ..Default::default()
    }
}

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Accept one connection and complete the handshake: returns the server side
/// of the socket plus the auth/subscription frame the client sent.
async fn accept_session(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    let auth = match timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for auth frame")
        .expect("connection closed before auth")
        .expect("auth read failed")
    {
        Message::Text(text) => text,
        other => panic!("expected text auth frame, got {:?}", other),
    };
    (ws, auth)
}

async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s: {what}");
}

#[tokio::test]
async fn connect_authenticates_and_streams() {
    let (listener, url) = bind_server().await;
    let client = StreamConnectionClient::new(client_config(url, 1_000));
    let mut events = client.subscribe_events();

    client.connect(mediterranean_filter());

    let (mut ws, auth) = accept_session(&listener).await;
    assert!(auth.contains("\"APIKey\":\"test-key\""));
    assert!(auth.contains("[[[30.0,-6.0],[46.0,37.0]]]"));
    assert!(auth.contains("PositionReport"));

    ws.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();

    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));
    match next_event(&mut events).await {
        StreamEvent::Position(update) => {
            assert_eq!(update.mmsi, 244660920);
            assert_eq!(update.latitude, 52.36);
            assert_eq!(update.longitude, 4.88);
            assert_eq!(update.speed_over_ground, 12.3);
            assert_eq!(update.course_over_ground, 284.5);
        }
        other => panic!("expected Position, got {:?}", other),
    }

    assert_eq!(client.state(), ConnectionState::Streaming);
    let stats = client.statistics();
    assert!(stats.connected);
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.messages_processed, 1);
    assert_eq!(stats.error_count, 0);
    assert!(stats.last_message_at.is_some());
}

#[tokio::test]
async fn malformed_frames_warn_without_killing_the_stream() {
    let (listener, url) = bind_server().await;
    let client = StreamConnectionClient::new(client_config(url, 1_000));
    let mut events = client.subscribe_events();

    client.connect(mediterranean_filter());
    let (mut ws, _auth) = accept_session(&listener).await;

    ws.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(MALFORMED_FRAME.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(UNRECOGNIZED_FRAME.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();

    let mut saw_warning = false;
    let mut positions = 0;
    while positions < 2 {
        match next_event(&mut events).await {
            StreamEvent::Position(_) => positions += 1,
            StreamEvent::Warning {
                message_type,
                reason,
                raw,
            } => {
                assert_eq!(message_type, "PositionReport");
                assert!(reason.contains("Sog"));
                assert!(raw.contains("MessageType"));
                saw_warning = true;
            }
            StreamEvent::Connected => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(saw_warning);

    // Unrecognized frames count as received but never as processed or errors.
    let c = client.clone();
    wait_until("all four frames received", || {
        c.statistics().messages_received == 4
    })
    .await;
    let stats = client.statistics();
    assert_eq!(stats.messages_processed, 2);
    assert_eq!(stats.error_count, 1);
}

#[tokio::test]
async fn abrupt_close_schedules_first_backoff_attempt() {
    let (listener, url) = bind_server().await;
    let client = StreamConnectionClient::new(client_config(url, 1_000));
    let mut events = client.subscribe_events();

    client.connect(mediterranean_filter());
    let (mut ws, _auth) = accept_session(&listener).await;
    ws.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();

    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    // Drop the socket without a close handshake: abnormal closure (1006).
    drop(ws);

    loop {
        match next_event(&mut events).await {
            StreamEvent::Disconnected { code, .. } => {
                assert_eq!(code, 1006);
                break;
            }
            StreamEvent::Position(_) => {}
            other => panic!("expected Disconnected, got {:?}", other),
        }
    }

    match next_event(&mut events).await {
        StreamEvent::Reconnecting { attempt, delay_ms } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, 1_000);
        }
        other => panic!("expected Reconnecting, got {:?}", other),
    }
    assert_eq!(client.statistics().reconnect_attempts, 1);
}

#[tokio::test]
async fn exhausted_retries_end_in_failed_state() {
    // Bind then drop so the port refuses connections.
    let (listener, url) = bind_server().await;
    drop(listener);

    let client = StreamConnectionClient::new(client_config(url, 10));
    let mut events = client.subscribe_events();
    client.connect(mediterranean_filter());

    let mut delays = Vec::new();
    let mut disconnects = 0;
    loop {
        match next_event(&mut events).await {
            StreamEvent::Reconnecting { attempt, delay_ms } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay_ms);
            }
            StreamEvent::Disconnected { .. } => disconnects += 1,
            StreamEvent::Error(message) => {
                assert!(message.contains("5"));
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(delays, vec![10, 20, 40, 80, 160]);
    // Five scheduled retries means six consecutive transport failures.
    assert_eq!(disconnects, 6);
    assert_eq!(client.state(), ConnectionState::Failed);

    // Terminal: no further automatic attempt.
    assert!(
        timeout(Duration::from_millis(300), events.recv()).await.is_err(),
        "no events expected after Failed"
    );
}

#[tokio::test]
async fn successful_connect_resets_backoff() {
    let (listener, url) = bind_server().await;
    let client = StreamConnectionClient::new(client_config(url, 10));
    let mut events = client.subscribe_events();

    let server = tokio::spawn(async move {
        // Two broken sessions: accept the TCP connection, then drop it before
        // the WebSocket handshake completes.
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        }
        // Third session works, then dies abruptly after one frame.
        let (mut ws, _auth) = accept_session(&listener).await;
        ws.send(Message::Text(POSITION_FRAME.to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(ws);
        // Keep the port open for the post-reset reconnect.
        let _ = listener.accept().await;
    });

    client.connect(mediterranean_filter());

    // Two failures ramp the backoff to attempt 2.
    let mut attempts_before_connect = Vec::new();
    loop {
        match next_event(&mut events).await {
            StreamEvent::Reconnecting { attempt, .. } => attempts_before_connect.push(attempt),
            StreamEvent::Disconnected { .. } => {}
            StreamEvent::Connected => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(attempts_before_connect, vec![1, 2]);

    // After streaming, the next outage starts over at attempt 1 / base delay.
    loop {
        match next_event(&mut events).await {
            StreamEvent::Reconnecting { attempt, delay_ms } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 10);
                break;
            }
            StreamEvent::Disconnected { .. } | StreamEvent::Position(_) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    server.abort();
}

#[tokio::test]
async fn update_subscription_reconnects_without_backoff() {
    let (listener, url) = bind_server().await;
    let client = StreamConnectionClient::new(client_config(url, 1_000));
    let mut events = client.subscribe_events();

    client.connect(mediterranean_filter());
    let (mut ws, auth) = accept_session(&listener).await;
    assert!(auth.contains("[[[30.0,-6.0],[46.0,37.0]]]"));
    ws.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    // Voluntary filter change: Gulf of Mexico window.
    client.update_subscription(SubscriptionFilter::from_boxes(vec![RegionBounds::new(
        8.0, 31.0, -98.0, -60.0,
    )]));

    let (mut ws2, auth2) = accept_session(&listener).await;
    assert!(auth2.contains("[[[8.0,-98.0],[31.0,-60.0]]]"));
    ws2.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();

    // The cycle re-enters Connecting, never the backoff path.
    loop {
        match next_event(&mut events).await {
            StreamEvent::Connected => break,
            StreamEvent::Reconnecting { .. } => {
                panic!("voluntary resubscribe must not enter backoff")
            }
            StreamEvent::Position(_) | StreamEvent::Disconnected { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(client.state(), ConnectionState::Streaming);
}

#[tokio::test]
async fn deliberate_disconnect_suppresses_reconnect() {
    let (listener, url) = bind_server().await;
    let client = StreamConnectionClient::new(client_config(url, 1_000));
    let mut events = client.subscribe_events();

    client.connect(mediterranean_filter());
    let (mut ws, _auth) = accept_session(&listener).await;
    ws.send(Message::Text(POSITION_FRAME.to_string()))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    client.disconnect();

    let c = client.clone();
    wait_until("client returns to idle", || {
        c.state() == ConnectionState::Idle
    })
    .await;
    assert!(!client.statistics().connected);

    // The close itself is surfaced as a normal closure; only the reconnect
    // machinery stays quiet afterwards.
    let mut saw_close = false;
    loop {
        match timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Ok(StreamEvent::Position(_))) => {}
            Ok(Ok(StreamEvent::Disconnected { code, .. })) => {
                assert_eq!(code, 1000);
                saw_close = true;
            }
            Ok(Ok(other)) => panic!("unexpected event after disconnect: {:?}", other),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn update_subscription_cancels_pending_backoff() {
    // Bind then drop so every connect is refused immediately.
    let (listener, url) = bind_server().await;
    drop(listener);

    // Backoff long enough that only a cancelled timer explains a fast retry.
    let client = StreamConnectionClient::new(client_config(url, 60_000));
    let mut events = client.subscribe_events();
    client.connect(mediterranean_filter());

    loop {
        match next_event(&mut events).await {
            StreamEvent::Reconnecting { attempt, delay_ms } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 60_000);
                break;
            }
            StreamEvent::Disconnected { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    // A filter change while the backoff timer is armed retries now, and the
    // failure streak keeps counting instead of restarting at 1.
    client.update_subscription(SubscriptionFilter::from_boxes(vec![RegionBounds::new(
        8.0, 31.0, -98.0, -60.0,
    )]));

    loop {
        match next_event(&mut events).await {
            StreamEvent::Reconnecting { attempt, delay_ms } => {
                assert_eq!(attempt, 2);
                assert_eq!(delay_ms, 120_000);
                break;
            }
            StreamEvent::Disconnected { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(client.statistics().reconnect_attempts, 2);
}
