//! Polling Fallback Contract Tests
//!
//! These tests verify exact HTTP API format compliance for the polling
//! channel: fallback connect, transcript delivery, status-driven reply
//! completion and the final stop payload.

use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use voxcoach::config::ConnectionConfig;
use voxcoach::connection::messages::WireMessage;
use voxcoach::connection::polling::StopBody;
use voxcoach::connection::{ChannelEvent, ConnectionManager, ConnectionMode};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Port 9 (discard) refuses connections immediately, forcing fallback.
const DEAD_SOCKET: &str = "ws://127.0.0.1:9/voice-call";

fn test_config(server: &MockServer) -> ConnectionConfig {
    ConnectionConfig {
        socket_url: DEAD_SOCKET.into(),
        polling_url: server.uri(),
        poll_interval_ms: 25,
        reconnect_base_ms: 10,
        reconnect_max_ms: 40,
        max_reconnect_attempts: 3,
        request_timeout_ms: 2_000,
    }
}

fn pending_status() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "status": "pending" }))
}

async fn next_reply(
    events: &mut broadcast::Receiver<ChannelEvent>,
    wait: Duration,
) -> Option<String> {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => return None,
            event = events.recv() => match event {
                Ok(ChannelEvent::ReplyReady(text)) => return Some(text),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }
}

#[tokio::test]
async fn falls_back_to_polling_when_socket_unreachable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(pending_status())
        .mount(&server)
        .await;

    let connection = ConnectionManager::connect(&test_config(&server), reqwest::Client::new())
        .await
        .expect("polling fallback should connect");

    assert_eq!(connection.mode(), ConnectionMode::Polling);
    assert_eq!(connection.state().attempt, 0);

    connection.shutdown(None).await;
    assert_eq!(connection.mode(), ConnectionMode::Disconnected);
}

#[tokio::test]
async fn transcript_is_posted_and_reply_arrives_once_status_is_done() {
    let server = MockServer::start().await;

    // Two pending polls (the connect probe plus one cycle), then done.
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(pending_status())
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "done",
            "aiResponse": "Keep your shoulders relaxed."
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/transcript"))
        .and(body_json(json!({ "transcript": "how is my posture" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let connection = ConnectionManager::connect(&test_config(&server), reqwest::Client::new())
        .await
        .expect("connect");
    let mut events = connection.subscribe();

    connection
        .send(WireMessage::Transcript {
            text: "how is my posture".into(),
            is_final: true,
        })
        .await
        .expect("send transcript");

    let reply = next_reply(&mut events, Duration::from_secs(2)).await;
    assert_eq!(reply.as_deref(), Some("Keep your shoulders relaxed."));

    connection.shutdown(None).await;
}

#[tokio::test]
async fn only_the_exact_done_status_completes_a_turn() {
    let server = MockServer::start().await;

    // A lookalike status must not complete the turn, even with a reply
    // attached.
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "completed",
            "aiResponse": "should never surface"
        })))
        .mount(&server)
        .await;

    let connection = ConnectionManager::connect(&test_config(&server), reqwest::Client::new())
        .await
        .expect("connect");
    let mut events = connection.subscribe();

    let reply = next_reply(&mut events, Duration::from_millis(300)).await;
    assert_eq!(reply, None);

    connection.shutdown(None).await;
}

#[tokio::test]
async fn malformed_status_bodies_are_dropped_without_closing_the_channel() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(pending_status())
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("surprise, not json"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "done",
            "aiResponse": "still here"
        })))
        .mount(&server)
        .await;

    let connection = ConnectionManager::connect(&test_config(&server), reqwest::Client::new())
        .await
        .expect("connect");
    let mut events = connection.subscribe();

    let reply = next_reply(&mut events, Duration::from_secs(2)).await;
    assert_eq!(reply.as_deref(), Some("still here"));

    connection.shutdown(None).await;
}

#[tokio::test]
async fn stop_posts_the_accumulated_call_text() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(pending_status())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/stop"))
        .and(body_json(json!({
            "transcript": "first thing\nsecond thing",
            "aiResponses": ["reply one", "reply two"]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let connection = ConnectionManager::connect(&test_config(&server), reqwest::Client::new())
        .await
        .expect("connect");

    connection
        .shutdown(Some(StopBody {
            transcript: "first thing\nsecond thing".into(),
            ai_responses: vec!["reply one".into(), "reply two".into()],
        }))
        .await;
}

#[tokio::test]
async fn reconnect_budget_exhaustion_is_surfaced() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(pending_status())
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // Every later poll and reconnect probe fails.
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let connection = ConnectionManager::connect(&test_config(&server), reqwest::Client::new())
        .await
        .expect("connect");
    let mut events = connection.subscribe();

    let exhausted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Exhausted) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await;

    assert!(matches!(exhausted, Ok(true)));
    assert_eq!(connection.mode(), ConnectionMode::Disconnected);
    assert_eq!(connection.state().attempt, 3);
}
