//! Integration tests for read receipts.
//!
//! The open conversation is marked read only once its history is loaded
//! and it has messages. The unread counter drops to zero when the server
//! acknowledges, not when the conversation is selected. Messages arriving
//! after (or during) an acknowledged request cause a new request.
//!
//! Verification command: `cargo test --test read_receipts`

mod common;

use chatsync::chat::dispatch::DispatchOutcome;
use chatsync::chat::receipts::ReceiptState;

use chatsync_proto::conversation::ChannelKey;

use common::{
    AGENT, Harness, cid, conversation, is_history, is_mark_read, message, push, read_ack,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `c1` with `count` customer messages in its history.
async fn with_history(count: u64, unread: u32) -> Harness {
    let mut h = Harness::loaded(vec![
        conversation("c1", None, unread),
        conversation("c2", None, 0),
    ])
    .await;
    h.api.set_messages(
        &cid("c1"),
        (1..=count)
            .map(|i| message("c1", &format!("m{i}"), i * 1_000, "customer"))
            .collect(),
    );
    h
}

// ===========================================================================
// Guard
// ===========================================================================

#[tokio::test]
async fn no_request_before_history_is_loaded() {
    let mut h = with_history(1, 0).await;
    let gate = h.api.hold_messages(&cid("c1"));
    h.engine.select_conversation(&cid("c1")).await.unwrap();
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    h.deliver(&server, push(message("c1", "live", 5_000, "customer")))
        .await;
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Unviewed);
    assert!(h.api.read_calls().is_empty());

    gate.release();
    h.step_until(is_history).await;
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    h.step_until(is_mark_read).await;
    assert_eq!(h.api.read_calls(), vec![cid("c1")]);
}

#[tokio::test]
async fn empty_conversation_is_not_marked_read() {
    let mut h = with_history(0, 0).await;
    h.open("c1").await;

    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Unviewed);
    assert!(h.api.read_calls().is_empty());
}

#[tokio::test]
async fn other_conversations_are_never_marked_read() {
    let mut h = with_history(0, 0).await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    h.deliver(&server, push(message("c2", "x1", 1_000, "customer")))
        .await;

    assert_eq!(h.engine.receipt_state(&cid("c2")), ReceiptState::Unviewed);
    assert!(h.api.read_calls().is_empty());
    assert_eq!(h.engine.unread_count(&cid("c2")), 1);
}

// ===========================================================================
// Acknowledgement
// ===========================================================================

#[tokio::test]
async fn unread_clears_on_ack_not_on_select() {
    let mut h = with_history(3, 3).await;
    h.open("c1").await;
    assert_eq!(h.engine.unread_count(&cid("c1")), 3);
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    h.step_until(is_mark_read).await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    assert_eq!(
        h.deliver(&server, read_ack("c1", &[])).await,
        DispatchOutcome::Applied
    );

    assert_eq!(h.engine.unread_count(&cid("c1")), 0);
    assert!(h.engine.messages(&cid("c1")).iter().all(|m| m.is_read));
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Acked);
    let c1 = h.engine.conversation(&cid("c1")).unwrap();
    assert!(c1.last_message.as_ref().unwrap().is_read);
}

#[tokio::test]
async fn replayed_message_after_ack_is_not_counted_again() {
    let mut h = with_history(0, 0).await;
    h.open("c2").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    h.deliver(&server, push(message("c1", "m1", 1_000, "customer")))
        .await;
    assert_eq!(h.engine.unread_count(&cid("c1")), 1);
    h.deliver(&server, read_ack("c1", &[])).await;
    assert_eq!(h.engine.unread_count(&cid("c1")), 0);

    h.deliver(&server, push(message("c1", "m1", 1_000, "customer")))
        .await;
    assert_eq!(h.engine.unread_count(&cid("c1")), 0);

    h.deliver(&server, push(message("c1", "m2", 2_000, "customer")))
        .await;
    assert_eq!(h.engine.unread_count(&cid("c1")), 1);
}

#[tokio::test]
async fn ack_for_listed_ids_marks_only_those() {
    let mut h = with_history(2, 0).await;
    h.open("c1").await;
    h.step_until(is_mark_read).await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    h.deliver(&server, read_ack("c1", &["m1"])).await;

    let messages = h.engine.messages(&cid("c1"));
    assert!(messages[0].is_read);
    assert!(!messages[1].is_read);
}

#[tokio::test]
async fn new_message_after_ack_requests_again() {
    let mut h = with_history(1, 0).await;
    h.open("c1").await;
    h.step_until(is_mark_read).await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.deliver(&server, read_ack("c1", &[])).await;
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Acked);

    h.deliver(&server, push(message("c1", "m2", 9_000, "customer")))
        .await;

    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    h.step_until(is_mark_read).await;
    assert_eq!(h.api.read_calls().len(), 2);
}

#[tokio::test]
async fn own_message_after_ack_needs_no_request() {
    let mut h = with_history(1, 0).await;
    h.open("c1").await;
    h.step_until(is_mark_read).await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.deliver(&server, read_ack("c1", &[])).await;

    h.deliver(&server, push(message("c1", "mine", 9_000, AGENT)))
        .await;

    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Acked);
    assert_eq!(h.api.read_calls().len(), 1);
}

#[tokio::test]
async fn message_during_pending_request_is_marked_after_ack() {
    let mut h = with_history(1, 0).await;
    h.open("c1").await;
    h.step_until(is_mark_read).await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    h.deliver(&server, push(message("c1", "m2", 9_000, "customer")))
        .await;
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    assert_eq!(h.api.read_calls().len(), 1, "no second request while pending");

    // The ack only covers the first request.
    h.deliver(&server, read_ack("c1", &["m1"])).await;
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    h.step_until(is_mark_read).await;
    assert_eq!(h.api.read_calls().len(), 2);
}

#[tokio::test]
async fn failed_request_reverts_to_unviewed() {
    let mut h = with_history(1, 0).await;
    h.api.fail_mark_read("read endpoint down");
    h.open("c1").await;

    assert_eq!(
        h.step_until(is_mark_read).await,
        DispatchOutcome::Applied
    );
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Unviewed);

    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.deliver(&server, push(message("c1", "m2", 9_000, "customer")))
        .await;
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    h.step_until(is_mark_read).await;
    assert_eq!(h.api.read_calls().len(), 2);
}

#[tokio::test]
async fn reopening_with_new_messages_requests_again() {
    let mut h = with_history(1, 0).await;
    h.open("c1").await;
    h.step_until(is_mark_read).await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.deliver(&server, read_ack("c1", &[])).await;

    h.open("c2").await;
    let late = message("c1", "m2", 9_000, "customer");
    assert_eq!(
        h.deliver(&server, push(late.clone())).await,
        DispatchOutcome::ListOnly
    );
    h.api
        .set_messages(&cid("c1"), vec![message("c1", "m1", 1_000, "customer"), late]);

    h.open("c1").await;

    assert_eq!(h.message_ids("c1"), ["m1", "m2"]);
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);
    h.step_until(is_mark_read).await;
    assert_eq!(h.api.read_calls().len(), 2);
}
