//! End-to-end correlation protocol tests over the in-memory broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use forgesign_core::bus::BusConnection;
use forgesign_core::bus::memory::MemoryBus;
use forgesign_core::completion::wait_for_completion;
use forgesign_core::dispatch::Dispatcher;
use forgesign_core::listener::spawn_listener;
use forgesign_core::{
    CorrelationFilter, Environment, RequestKind, SignError, SignPayload, SigningRequest,
};
use serde_json::json;

fn request() -> SigningRequest {
    SigningRequest {
        kind: RequestKind::OstreeSign,
        build_id: "b1".into(),
        basearch: "x86_64".into(),
        extra_keys: BTreeMap::new(),
        payload: SignPayload::Ostree {
            checksum: "deadbeef".into(),
            object_key: "fcos/tmp/deadbeef.commit".into(),
        },
    }
}

const PREFIX: &str = "org.example";
const ENV: Environment = Environment::Production;

#[tokio::test]
async fn success_roundtrip_with_delayed_publish() {
    let bus = MemoryBus::new();
    let req = request();
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    // The registered signal, not timing, is what makes this safe: an
    // arbitrary delay before publish must change nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dispatcher = Dispatcher::new(Arc::new(bus.connect()), PREFIX, ENV);
    dispatcher.dispatch(&req).await.unwrap();

    // Signer's reply, with extra keys the filter does not know about.
    bus.connect()
        .publish(
            &finished,
            &json!({
                "build_id": "b1",
                "basearch": "x86_64",
                "status": "success",
                "signer": "robot",
            }),
        )
        .await
        .unwrap();

    let body = wait_for_completion(listener.completion, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(body["signer"], "robot");
}

#[tokio::test]
async fn unrelated_messages_never_complete_the_wait() {
    let bus = MemoryBus::new();
    let req = request();
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    // Same topic, different build: concurrent unrelated sign flows share
    // the finished topic.
    bus.connect()
        .publish(
            &finished,
            &json!({"build_id": "other", "basearch": "x86_64", "status": "success"}),
        )
        .await
        .unwrap();

    let err = wait_for_completion(listener.completion, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SignError::Timeout(_)));
}

#[tokio::test]
async fn no_response_is_a_timeout() {
    let bus = MemoryBus::new();
    let req = request();

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        req.kind.finished_topic(PREFIX, ENV),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    let err = wait_for_completion(listener.completion, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SignError::Timeout(_)));
}

#[tokio::test]
async fn second_matching_message_is_ignored() {
    let bus = MemoryBus::new();
    let req = request();
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    let publisher = bus.connect();
    publisher
        .publish(
            &finished,
            &json!({"build_id": "b1", "basearch": "x86_64", "status": "success", "seq": "first"}),
        )
        .await
        .unwrap();
    // A duplicate with a contradictory status arrives late; the first
    // terminal state must stand.
    publisher
        .publish(
            &finished,
            &json!({"build_id": "b1", "basearch": "x86_64", "status": "failure", "seq": "second"}),
        )
        .await
        .unwrap();

    let body = wait_for_completion(listener.completion, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(body["seq"], "first");
}

#[tokio::test]
async fn failure_status_surfaces_the_signer_message() {
    let bus = MemoryBus::new();
    let req = request();
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    bus.connect()
        .publish(
            &finished,
            &json!({
                "build_id": "b1",
                "basearch": "x86_64",
                "status": "failure",
                "failure-message": "bad key",
            }),
        )
        .await
        .unwrap();

    let err = wait_for_completion(listener.completion, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad key"));
    assert_eq!(err.kind(), "signing");
}

#[tokio::test]
async fn extra_filter_keys_must_all_match() {
    let bus = MemoryBus::new();
    let mut req = request();
    req.extra_keys
        .insert("stream".to_string(), "stable".to_string());
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    let publisher = bus.connect();
    // Missing the stream key: not the reply.
    publisher
        .publish(
            &finished,
            &json!({"build_id": "b1", "basearch": "x86_64", "status": "success"}),
        )
        .await
        .unwrap();
    // All keys present and equal: accepted.
    publisher
        .publish(
            &finished,
            &json!({
                "build_id": "b1",
                "basearch": "x86_64",
                "stream": "stable",
                "status": "success",
                "seq": "matching",
            }),
        )
        .await
        .unwrap();

    let body = wait_for_completion(listener.completion, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(body["seq"], "matching");
}

#[tokio::test]
async fn timeout_closes_the_slot_and_stops_the_listener() {
    let bus = MemoryBus::new();
    let req = request();
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();

    let err = wait_for_completion(listener.completion, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, SignError::Timeout(_)));

    // Close-on-timeout: a match arriving after the deadline goes nowhere
    // and the listener has wound down; publishing must not panic or hang.
    bus.connect()
        .publish(
            &finished,
            &json!({"build_id": "b1", "basearch": "x86_64", "status": "success"}),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn explicit_abort_tears_the_listener_down() {
    let bus = MemoryBus::new();
    let req = request();
    let finished = req.kind.finished_topic(PREFIX, ENV);

    let mut listener = spawn_listener(
        Arc::new(bus.connect()),
        finished.clone(),
        req.correlation_filter(),
    );
    listener.registered().await.unwrap();
    listener.abort();

    // The slot's sender dies with the task, so a waiter sees a transport
    // failure immediately instead of sleeping out its bound.
    let err = wait_for_completion(listener.completion, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SignError::Transport(_)));

    // A reply published after teardown has nowhere to go.
    bus.connect()
        .publish(
            &finished,
            &json!({"build_id": "b1", "basearch": "x86_64", "status": "success"}),
        )
        .await
        .unwrap();
}
