mod common;

use std::time::Duration;

use common::{FakeSocketFactory, init_logs, next_connection, settle};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::advance;
use voicelink::client::{ClientStatus, SignalingClient};
use voicelink::config::ClientConfig;

const EDGE: &str = "wss://edge-a.example.com/signal";

fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).expect("outbound frames are JSON envelopes")
}

#[tokio::test(start_paused = true)]
async fn listen_is_first_and_queued_messages_replay_once() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok-1", vec![EDGE.into()], factory, ClientConfig::default());
    let mut errors = client.events().error.subscribe();
    settle().await;
    let mut conn = next_connection(&mut attempts).await;

    // The channel is still connecting, so this gets buffered.
    client.invite("v=0 sdp", "CA123", "env=prod").await;
    let error = errors.recv().await.expect("queueing is surfaced");
    assert_eq!(error.code, 53009);

    conn.open().await;
    settle().await;

    let listen = parse(&conn.expect_frame().await);
    assert_eq!(listen["type"], "listen");
    assert_eq!(listen["version"], "1.6");
    assert_eq!(listen["payload"]["token"], "tok-1");
    assert_eq!(listen["payload"]["browserinfo"]["p"], "rust");
    assert_eq!(listen["payload"]["reconnectTimeout"], 16);

    let invite = parse(&conn.expect_frame().await);
    assert_eq!(invite["type"], "invite");
    assert_eq!(invite["payload"]["callid"], "CA123");
    assert_eq!(invite["payload"]["sdp"], "v=0 sdp");
    assert!(conn.try_frame().is_none());

    // A reconnection replays nothing: the queue was already drained.
    conn.close(1006).await;
    settle().await;
    let mut conn2 = next_connection(&mut attempts).await;
    conn2.open().await;
    settle().await;
    assert_eq!(parse(&conn2.expect_frame().await)["type"], "listen");
    settle().await;
    assert!(conn2.try_frame().is_none(), "the invite must not replay twice");
}

#[tokio::test(start_paused = true)]
async fn queued_messages_keep_their_order() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let mut conn = next_connection(&mut attempts).await;

    client.register(json!({ "audio": true })).await;
    client.dtmf("CA1", "5w9").await;
    client.hangup("CA1", Some("goodbye")).await;

    conn.open().await;
    settle().await;

    let kinds: Vec<String> = vec![
        parse(&conn.expect_frame().await)["type"].as_str().unwrap().into(),
        parse(&conn.expect_frame().await)["type"].as_str().unwrap().into(),
        parse(&conn.expect_frame().await)["type"].as_str().unwrap().into(),
        parse(&conn.expect_frame().await)["type"].as_str().unwrap().into(),
    ];
    assert_eq!(kinds, ["listen", "register", "dtmf", "hangup"]);
}

#[tokio::test(start_paused = true)]
async fn reinvite_is_never_buffered() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let mut conn = next_connection(&mut attempts).await;

    client.reinvite("v=0", "CA1").await;

    conn.open().await;
    settle().await;
    assert_eq!(parse(&conn.expect_frame().await)["type"], "listen");
    settle().await;
    assert!(conn.try_frame().is_none(), "reinvite is best effort only");
}

#[tokio::test(start_paused = true)]
async fn verb_payload_shapes() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let mut conn = next_connection(&mut attempts).await;
    conn.open().await;
    settle().await;
    conn.expect_frame().await; // listen

    client.answer("v=0 answer", "CA9").await;
    let answer = parse(&conn.expect_frame().await);
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["payload"], json!({ "callid": "CA9", "sdp": "v=0 answer" }));

    client.reconnect("v=0", "CA9", "rt-42").await;
    let reconnect = parse(&conn.expect_frame().await);
    assert_eq!(reconnect["type"], "reconnect");
    assert_eq!(reconnect["payload"]["reconnect"], "rt-42");

    client.reject("CA9").await;
    assert_eq!(
        parse(&conn.expect_frame().await)["payload"],
        json!({ "callid": "CA9" })
    );

    client.hangup("CA9", None).await;
    let hangup = parse(&conn.expect_frame().await);
    assert_eq!(hangup["payload"], json!({ "callid": "CA9" }));

    client
        .send_message("CA9", json!({ "k": "v" }), "application/json", "user-defined-message", "m-1")
        .await;
    let message = parse(&conn.expect_frame().await);
    assert_eq!(message["type"], "message");
    assert_eq!(message["payload"]["contenttype"], "application/json");
    assert_eq!(message["payload"]["messageid"], "m-1");
}

#[tokio::test(start_paused = true)]
async fn connected_frame_reports_ready_and_caches_metadata() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let conn = next_connection(&mut attempts).await;
    conn.open().await;
    settle().await;
    assert_eq!(client.status().await, ClientStatus::Connected);

    let mut ready = client.events().ready.subscribe();
    conn.message(
        r#"{"type":"connected","payload":{"gateway":"gw-7","region":"us-east-1"},"version":"1.6"}"#,
    )
    .await;
    settle().await;

    let event = ready.try_recv().expect("ready must fire");
    assert_eq!(event.gateway.gateway.as_deref(), Some("gw-7"));
    assert_eq!(event.gateway.region.as_deref(), Some("us-east-1"));
    assert_eq!(client.status().await, ClientStatus::Ready);
    assert_eq!(client.gateway_info().await.region.as_deref(), Some("us-east-1"));
}

#[tokio::test(start_paused = true)]
async fn error_frames_are_decorated() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let conn = next_connection(&mut attempts).await;
    conn.open().await;
    settle().await;

    let mut errors = client.events().error.subscribe();
    let mut messages = client.events().message.subscribe();
    conn.message(
        r#"{"type":"error","payload":{"error":{"code":31486,"message":"User Busy"},"callid":"CA1"},"version":"1.6"}"#,
    )
    .await;
    settle().await;

    let error = errors.try_recv().expect("error must be decorated and emitted");
    assert_eq!(error.code, 31486);
    assert_eq!(error.message, "User Busy");
    assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn inbound_verbs_flow_through_the_message_channel() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let conn = next_connection(&mut attempts).await;
    conn.open().await;
    settle().await;

    let mut messages = client.events().message.subscribe();
    conn.message(r#"{"type":"ringing","payload":{"callid":"CA1"},"version":"1.6"}"#)
        .await;
    conn.message("this is not json").await;
    conn.message(r#"{"type":"hangup","payload":{"callid":"CA1"},"version":"1.6"}"#)
        .await;
    settle().await;

    assert_eq!(messages.try_recv().unwrap().kind, "ringing");
    assert_eq!(messages.try_recv().unwrap().kind, "hangup");
    assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn set_token_reauthenticates_a_live_channel() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok-old", vec![EDGE.into()], factory, ClientConfig::default());
    settle().await;
    let mut conn = next_connection(&mut attempts).await;
    conn.open().await;
    settle().await;
    assert_eq!(parse(&conn.expect_frame().await)["payload"]["token"], "tok-old");

    client.set_token("tok-new").await;
    assert_eq!(parse(&conn.expect_frame().await)["payload"]["token"], "tok-new");

    // Every later handshake uses the fresh token.
    conn.close(1006).await;
    settle().await;
    let mut conn2 = next_connection(&mut attempts).await;
    conn2.open().await;
    settle().await;
    assert_eq!(parse(&conn2.expect_frame().await)["payload"]["token"], "tok-new");
}

#[tokio::test(start_paused = true)]
async fn offline_and_destroy_transitions() {
    init_logs();
    let (factory, mut attempts) = FakeSocketFactory::new();
    let client = SignalingClient::new("tok", vec![EDGE.into()], factory, ClientConfig::default());
    let mut offline = client.events().offline.subscribe();
    let mut closed = client.events().close.subscribe();
    settle().await;
    let conn = next_connection(&mut attempts).await;
    conn.open().await;
    settle().await;

    conn.close(1006).await;
    settle().await;
    assert!(offline.try_recv().is_ok(), "losing the channel emits offline");
    assert_eq!(client.status().await, ClientStatus::Offline);

    client.destroy().await;
    settle().await;
    assert!(closed.try_recv().is_ok());
    assert_eq!(client.status().await, ClientStatus::Disconnected);

    // Reconnection stops with the client.
    advance(Duration::from_secs(600)).await;
    settle().await;
    while attempts.try_recv().is_ok() {}
    advance(Duration::from_secs(600)).await;
    settle().await;
    assert!(attempts.try_recv().is_err());
}
