//! Component tests: broker dispatch, correlation bookkeeping, and the
//! connection lifecycle over an in-memory transport.

mod common;

use agentwire::broker::{Broker, BrokerError, Envelope};
use agentwire::store::ObjectCategory;
use agentwire::sync::SyncHandler;
use common::{fake_transport, payload, test_broker, wait_until, RecordingStore};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn request_round_trip_empties_the_registry() {
    let (broker, _store, _handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    let replier = tokio::spawn(async move {
        let request = agent.next_envelope().await;
        assert_eq!(request.kind, "RUN_X");
        assert_eq!(request.payload.get("n"), Some(&json!(1)));
        let correlation_id = request.correlation_id.clone().expect("correlated dispatch");
        agent.send_envelope(&Envelope::correlated(
            "RUN_X",
            correlation_id,
            payload(&[("status", json!("completed")), ("result", json!(42))]),
        ));
        agent
    });

    let reply = broker
        .request(
            "aw_a",
            "RUN_X",
            payload(&[("n", json!(1))]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload.get("result"), Some(&json!(42)));
    assert!(reply.is_terminal());
    assert_eq!(broker.pending_replies(), 0);

    let _agent = replier.await.unwrap();
}

#[tokio::test]
async fn failed_status_replies_are_returned_as_data() {
    let (broker, _store, _handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    let replier = tokio::spawn(async move {
        let request = agent.next_envelope().await;
        let correlation_id = request.correlation_id.clone().unwrap();
        agent.send_envelope(&Envelope::correlated(
            "RUN_X",
            correlation_id,
            payload(&[("status", json!("failed")), ("reason", json!("boom"))]),
        ));
        agent
    });

    let reply = broker
        .request("aw_a", "RUN_X", Map::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(reply.is_failed());
    assert_eq!(reply.payload.get("reason"), Some(&json!("boom")));

    let _agent = replier.await.unwrap();
}

#[tokio::test]
async fn request_times_out_within_bound_and_leaves_no_waiter() {
    let (broker, _store, _handler) = test_broker();
    let (sink, frames, agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    let start = Instant::now();
    let err = broker
        .request("aw_a", "SLOW", Map::new(), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Timeout { .. }));
    assert!(start.elapsed() < Duration::from_millis(700));
    assert_eq!(broker.pending_replies(), 0);

    drop(agent);
}

#[tokio::test]
async fn request_against_unknown_token_fails_fast() {
    let (broker, _store, _handler) = test_broker();
    let err = broker
        .request("aw_ghost", "RUN_X", Map::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoActiveConnection { .. }));
}

#[tokio::test]
async fn send_without_connection_is_no_active_connection() {
    let (broker, _store, _handler) = test_broker();
    let err = broker.send("aw_ghost", "PING", Map::new()).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::NoActiveConnection { token } if token == "aw_ghost"
    ));
    assert_eq!(broker.pending_replies(), 0);
}

#[tokio::test]
async fn send_writes_a_single_uncorrelated_frame() {
    let (broker, _store, _handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    broker
        .send("aw_a", "NOTIFY", payload(&[("message", json!("hello"))]))
        .await
        .unwrap();

    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.kind, "NOTIFY");
    assert!(envelope.correlation_id.is_none());
    assert_eq!(envelope.payload.get("message"), Some(&json!("hello")));

    assert!(agent.try_next_frame().is_none());
    assert_eq!(broker.pending_replies(), 0);
}

#[tokio::test]
async fn second_connection_for_a_token_replaces_the_first() {
    let (broker, store, _handler) = test_broker();

    let (sink1, frames1, mut agent1) = fake_transport();
    let reader1 = broker.connect("aw_a", sink1, frames1).await;
    let (sink2, frames2, mut agent2) = fake_transport();
    broker.connect("aw_a", sink2, frames2).await;

    assert_eq!(broker.agent_count(), 1);

    broker.send("aw_a", "PING", Map::new()).await.unwrap();
    let envelope = agent2.next_envelope().await;
    assert_eq!(envelope.kind, "PING");
    assert!(agent1.try_next_frame().is_none());

    // The replaced transport's teardown must not evict the live entry or
    // flip the persisted presence.
    drop(agent1);
    reader1.await.unwrap();
    assert!(broker.is_connected("aw_a"));
    assert_eq!(store.disconnect_count(), 0);
    assert!(store.is_online("aw_a"));
}

#[tokio::test]
async fn stream_yields_fifo_then_terminates() {
    let (broker, _store, _handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    let streamer = tokio::spawn(async move {
        let request = agent.next_envelope().await;
        let correlation_id = request.correlation_id.clone().unwrap();
        for seq in 0..5u64 {
            agent.send_envelope(&Envelope::correlated(
                "GEN",
                correlation_id.clone(),
                payload(&[("status", json!("streaming")), ("seq", json!(seq))]),
            ));
        }
        agent.send_envelope(&Envelope::correlated(
            "GEN",
            correlation_id,
            payload(&[("status", json!("completed")), ("seq", json!(5))]),
        ));
        agent
    });

    let mut replies = broker
        .stream("aw_a", "GEN", Map::new(), Duration::from_secs(2))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(envelope) = replies.next().await {
        seen.push(envelope.payload.get("seq").and_then(Value::as_u64).unwrap());
    }

    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    assert!(replies.is_finished());
    assert_eq!(broker.pending_replies(), 0);

    let _agent = streamer.await.unwrap();
}

#[tokio::test]
async fn abandoned_stream_releases_the_waiter() {
    let (broker, _store, handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    let opener = tokio::spawn(async move {
        let request = agent.next_envelope().await;
        let correlation_id = request.correlation_id.clone().unwrap();
        agent.send_envelope(&Envelope::correlated(
            "GEN",
            correlation_id.clone(),
            payload(&[("status", json!("streaming")), ("seq", json!(0))]),
        ));
        (agent, correlation_id)
    });

    let replies = broker
        .stream("aw_a", "GEN", Map::new(), Duration::from_secs(2))
        .await
        .unwrap();
    let (agent, correlation_id) = opener.await.unwrap();

    assert_eq!(broker.pending_replies(), 1);
    drop(replies);
    assert_eq!(broker.pending_replies(), 0);

    // Replies still in flight reroute to the unsolicited handler.
    agent.send_envelope(&Envelope::correlated(
        "GEN",
        correlation_id,
        payload(&[("status", json!("streaming")), ("seq", json!(1))]),
    ));
    wait_until(|| handler.seen.lock().iter().any(|e| e.kind == "GEN")).await;
}

#[tokio::test]
async fn stream_ends_when_the_agent_dies_mid_sequence() {
    let (broker, store, _handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    let reader = broker.connect("aw_a", sink, frames).await;

    let opener = tokio::spawn(async move {
        let request = agent.next_envelope().await;
        let correlation_id = request.correlation_id.clone().unwrap();
        agent.send_envelope(&Envelope::correlated(
            "GEN",
            correlation_id,
            payload(&[("status", json!("streaming")), ("seq", json!(0))]),
        ));
        agent.close();
    });

    let mut replies = broker
        .stream("aw_a", "GEN", Map::new(), Duration::from_secs(2))
        .await
        .unwrap();
    opener.await.unwrap();
    reader.await.unwrap();
    assert_eq!(store.disconnect_count(), 1);

    let first = replies.next().await.unwrap();
    assert_eq!(first.payload.get("seq"), Some(&json!(0)));

    // No terminal status ever arrives; the torn-down connection must end
    // the sequence instead of leaving the consumer suspended.
    let ended = tokio::time::timeout(Duration::from_secs(2), replies.next()).await;
    assert!(ended.expect("stream should end after the disconnect").is_none());
    assert!(replies.is_finished());
    assert_eq!(broker.pending_replies(), 0);
}

#[tokio::test]
async fn late_reply_after_timeout_goes_to_the_unsolicited_handler() {
    let (broker, _store, handler) = test_broker();
    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    let err = broker
        .request("aw_a", "SLOW", Map::new(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));

    let request = agent.next_envelope().await;
    let correlation_id = request.correlation_id.unwrap();
    agent.send_envelope(&Envelope::correlated(
        "SLOW",
        correlation_id,
        payload(&[("status", json!("completed"))]),
    ));

    wait_until(|| handler.seen.lock().iter().any(|e| e.kind == "SLOW")).await;
}

#[tokio::test]
async fn malformed_frame_tears_down_only_that_connection() {
    let (broker, store, _handler) = test_broker();
    let (sink, frames, agent) = fake_transport();
    let reader = broker.connect("aw_a", sink, frames).await;

    agent.send_frame("this is not json");
    reader.await.unwrap();

    assert_eq!(store.disconnect_count(), 1);
    assert!(!broker.is_connected("aw_a"));

    // Nothing re-runs the teardown afterwards.
    drop(agent);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.disconnect_count(), 1);
}

#[tokio::test]
async fn clean_close_marks_the_agent_offline() {
    let (broker, store, _handler) = test_broker();
    let (sink, frames, agent) = fake_transport();
    let reader = broker.connect("aw_a", sink, frames).await;

    assert!(store.is_online("aw_a"));
    assert!(broker.connected_since("aw_a").is_some());

    agent.close();
    reader.await.unwrap();

    assert_eq!(store.disconnect_count(), 1);
    assert!(!store.is_online("aw_a"));
    assert!(!broker.is_connected("aw_a"));
    assert!(broker.connected_since("aw_a").is_none());
}

#[tokio::test]
async fn shutdown_tears_down_every_connection() {
    let (broker, store, _handler) = test_broker();
    let (sink_a, frames_a, _agent_a) = fake_transport();
    broker.connect("aw_a", sink_a, frames_a).await;
    let (sink_b, frames_b, _agent_b) = fake_transport();
    broker.connect("aw_b", sink_b, frames_b).await;

    assert_eq!(broker.agent_count(), 2);
    broker.shutdown().await;

    assert_eq!(broker.agent_count(), 0);
    assert_eq!(store.disconnect_count(), 2);
}

#[tokio::test]
async fn sync_code_creates_missing_objects_and_acks() {
    let store = Arc::new(RecordingStore::default());
    store.with_project("home-lab");
    store.seed_objects(ObjectCategory::Models, &["existing-model"]);

    let handler = Arc::new(SyncHandler::new(store.clone()));
    let broker = Broker::new(store.clone(), handler);

    let (sink, frames, mut agent) = fake_transport();
    broker.connect("aw_a", sink, frames).await;

    agent.send_envelope(&Envelope::correlated(
        "SYNC_CODE",
        "sync-1",
        payload(&[
            ("models", json!(["existing-model", "new-model"])),
            ("prompts", json!(["greeting"])),
        ]),
    ));

    let ack = agent.next_envelope().await;
    assert_eq!(ack.kind, "SYNC_COMPLETE");
    assert_eq!(ack.correlation_id.as_deref(), Some("sync-1"));
    assert_eq!(ack.status(), Some("completed"));
    assert_eq!(
        ack.payload.get("models"),
        Some(&json!({"created": 1, "updated": 1}))
    );
    assert_eq!(
        ack.payload.get("prompts"),
        Some(&json!({"created": 1, "updated": 0}))
    );

    assert_eq!(store.changelog().len(), 2);
    let created = store.created();
    assert!(created
        .iter()
        .any(|(category, names)| *category == ObjectCategory::Models
            && names == &vec!["new-model".to_owned()]));

    // A category left out of the report is acked with zero counts and gets
    // no changelog entry.
    agent.send_envelope(&Envelope::correlated(
        "SYNC_CODE",
        "sync-2",
        payload(&[("models", json!(["existing-model"]))]),
    ));

    let ack = agent.next_envelope().await;
    assert_eq!(
        ack.payload.get("prompts"),
        Some(&json!({"created": 0, "updated": 0}))
    );
    assert_eq!(store.changelog().len(), 3);
}

#[tokio::test]
async fn unrecognized_agent_envelopes_are_dropped_quietly() {
    let store = Arc::new(RecordingStore::default());
    store.with_project("home-lab");
    let handler = Arc::new(SyncHandler::new(store.clone()));
    let broker = Broker::new(store.clone(), handler);

    let (sink, frames, mut agent) = fake_transport();
    let reader = broker.connect("aw_a", sink, frames).await;

    agent.send_frame(r#"{"type":"TELEMETRY","cpu":0.4}"#);
    agent.send_envelope(&Envelope::correlated("SYNC_CODE", "sync-7", Map::new()));

    // Frames come back in order, so the sync ack arriving first proves the
    // telemetry envelope produced no reply and left the connection up.
    let ack = agent.next_envelope().await;
    assert_eq!(ack.kind, "SYNC_COMPLETE");
    assert_eq!(ack.correlation_id.as_deref(), Some("sync-7"));

    agent.close();
    reader.await.unwrap();
    assert_eq!(store.disconnect_count(), 1);
}
