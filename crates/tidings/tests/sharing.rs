//! Two queues in one process exchanging messages over a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidings::{BroadcastShare, Listener, Message, MessageQueue, ShareMode, ShareTransport};
use tidings_testing::Recorder;

fn linked_pair() -> (MessageQueue, MessageQueue) {
    let transport: Arc<dyn ShareTransport> = Arc::new(BroadcastShare::default());
    let left = MessageQueue::new();
    let right = MessageQueue::new();
    left.attach_share(transport.clone()).unwrap();
    right.attach_share(transport).unwrap();
    (left, right)
}

#[tokio::test]
async fn immediate_share_carries_the_original_value() {
    let (left, right) = linked_pair();
    left.register(Listener::on(1).map(|m| m.with_value("local edit")))
        .unwrap();
    let recorder = Recorder::new();
    right.register(recorder.listener("peer", 1)).unwrap();

    let result = left
        .send_sync(Message::sync().with_mask(1).with_value("original"))
        .unwrap();
    assert_eq!(result.value(), &json!("local edit"));

    assert!(recorder.wait_for(1, Duration::from_secs(1)).await);
    let seen = &recorder.messages()[0];
    assert_eq!(seen.value(), &json!("original"));
    assert_eq!(seen.id(), result.id());
    assert!(seen.is_from_peer());
}

#[tokio::test]
async fn deferred_share_carries_the_final_value() {
    let (left, right) = linked_pair();
    left.register(Listener::on(1).map(|m| m.with_value("final")))
        .unwrap();
    let recorder = Recorder::new();
    right.register(recorder.listener("peer", 1)).unwrap();

    left.send_async(
        Message::from_value("draft")
            .with_mask(1)
            .with_share(ShareMode::Deferred),
    )
    .await;

    assert!(recorder.wait_for(1, Duration::from_secs(1)).await);
    assert_eq!(recorder.values(), vec![json!("final")]);
}

#[tokio::test]
async fn peers_do_not_echo_back() {
    let (left, right) = linked_pair();
    let left_seen = Recorder::new();
    let right_seen = Recorder::new();
    left.register(left_seen.listener("left", 1)).unwrap();
    right.register(right_seen.listener("right", 1)).unwrap();

    left.send_async(Message::from_value(1).with_mask(1)).await;
    assert!(right_seen.wait_for(1, Duration::from_secs(1)).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(left_seen.len(), 1);
    assert_eq!(right_seen.len(), 1);
}

#[tokio::test]
async fn disabled_share_stays_local() {
    let (left, right) = linked_pair();
    let recorder = Recorder::new();
    right.register(recorder.listener("peer", 1)).unwrap();

    left.send_sync(
        Message::sync()
            .with_mask(1)
            .with_share(ShareMode::Disabled),
    )
    .unwrap();

    assert!(!recorder.wait_for(1, Duration::from_millis(50)).await);
}
