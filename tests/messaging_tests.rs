//! Integration tests for the message channel and read-receipt pass:
//! counter arithmetic, snapshot ordering, and idempotence.

use std::time::Duration;

use fiche::channel::MessageChannel;
use fiche::conversation::start_or_get_conversation;
use fiche::receipts::ReadReceiptTracker;
use fiche::storage::{MessageRow, Storage};

fn setup() -> (Storage, MessageChannel, String) {
    let storage = Storage::open_in_memory().unwrap();
    let conv = start_or_get_conversation(&storage, "uma", "ravi").unwrap();
    let channel = MessageChannel::new(storage.clone());
    (storage, channel, conv.conversation_id)
}

#[test]
fn send_bumps_only_the_counterpart() {
    let (storage, channel, conv) = setup();
    let before = storage.get_conversation(&conv).unwrap().unwrap();

    let sent = channel.send(&conv, "uma", "hi").unwrap().unwrap();

    let after = storage.get_conversation(&conv).unwrap().unwrap();
    let last = after.last_message.as_ref().unwrap();
    assert_eq!(last.body, "hi");
    assert_eq!(last.sender_id, "uma");
    assert_eq!(after.unread_for("ravi"), before.unread_for("ravi") + 1);
    assert_eq!(after.unread_for("uma"), before.unread_for("uma"));
    // The sender is in the read-set from the start.
    assert!(sent.is_read_by("uma"));
    assert!(!sent.is_read_by("ravi"));
}

#[test]
fn every_send_appears_in_the_next_snapshot() {
    let (storage, channel, conv) = setup();
    channel.send(&conv, "uma", "first").unwrap();
    channel.send(&conv, "ravi", "second").unwrap();
    channel.send(&conv, "uma", "third").unwrap();

    let messages = storage.list_messages(&conv).unwrap();
    let flat: Vec<(&str, &str)> = messages
        .iter()
        .map(|m| (m.sender_id.as_str(), m.body.as_str()))
        .collect();
    assert_eq!(
        flat,
        [("uma", "first"), ("ravi", "second"), ("uma", "third")]
    );
    assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn read_pass_is_idempotent() {
    let (storage, channel, conv) = setup();
    channel.send(&conv, "uma", "one").unwrap();
    channel.send(&conv, "uma", "two").unwrap();

    let receipts = ReadReceiptTracker::new(storage.clone());
    assert_eq!(receipts.mark_conversation_read(&conv, "ravi").unwrap(), 2);
    assert_eq!(storage.unread_count(&conv, "ravi").unwrap(), 0);

    // A second pass with no new messages writes nothing at all.
    let mut changes = storage.subscribe_changes();
    assert_eq!(receipts.mark_conversation_read(&conv, "ravi").unwrap(), 0);
    assert!(changes.try_recv().is_err());
}

#[test]
fn read_sets_grow_monotonically() {
    let (storage, channel, conv) = setup();
    channel.send(&conv, "uma", "hello").unwrap();

    let receipts = ReadReceiptTracker::new(storage.clone());
    receipts.mark_conversation_read(&conv, "ravi").unwrap();

    let message = &storage.list_messages(&conv).unwrap()[0];
    assert!(message.is_read_by("uma"));
    assert!(message.is_read_by("ravi"));

    // Further passes never shrink the set.
    receipts.mark_conversation_read(&conv, "ravi").unwrap();
    receipts.mark_conversation_read(&conv, "uma").unwrap();
    let message = &storage.list_messages(&conv).unwrap()[0];
    assert_eq!(message.read_by.len(), 2);
}

#[tokio::test]
async fn live_snapshot_tracks_sends_in_order() {
    let (_storage, channel, conv) = setup();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = channel.subscribe_messages(&conv, move |messages: Vec<MessageRow>| {
        let _ = tx.send(messages);
    });

    // First delivery is the current (empty) history.
    let initial = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no initial snapshot")
        .expect("subscription closed");
    assert!(initial.is_empty());

    channel.send(&conv, "uma", "allô").unwrap();
    channel.send(&conv, "ravi", "oui").unwrap();

    // Snapshots replace each other; wait for the one carrying both sends.
    let mut latest = Vec::new();
    while latest.len() < 2 {
        latest = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("snapshot stream stalled")
            .expect("subscription closed");
    }
    assert_eq!(latest[0].body, "allô");
    assert_eq!(latest[1].body, "oui");
    assert_eq!(latest[0].sender_id, "uma");
    assert_eq!(latest[1].sender_id, "ravi");
}

#[tokio::test]
async fn detached_subscription_stops_delivering() {
    let (_storage, channel, conv) = setup();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sub = channel.subscribe_messages(&conv, move |messages: Vec<MessageRow>| {
        let _ = tx.send(messages);
    });

    // Drain the initial snapshot, then detach.
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no initial snapshot")
        .expect("subscription closed");
    sub.detach();

    channel.send(&conv, "uma", "into the void").unwrap();
    // The sender side of the sink is dropped with the task; recv ends
    // rather than delivering another snapshot.
    let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(matches!(next, Ok(None)));
}
