//! Integration tests for the core synchronization path.
//!
//! Covers the conversation list, live delivery into the open
//! conversation, list-only updates for every other conversation, message
//! de-duplication and ordering, history pagination and sending.
//!
//! Verification command: `cargo test --test engine_sync`

mod common;

use chatsync::chat::{EngineError, EngineEvent};
use chatsync::chat::dispatch::DispatchOutcome;
use chatsync::chat::receipts::ReceiptState;
use chatsync::config::EngineConfig;

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::{ClientEvent, SendMessage};
use chatsync_proto::message::{MessageId, UserId};

use common::{
    AGENT, Harness, cid, conversation, is_conversations, is_history, is_mark_read, message, push,
    read_ack, test_config,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn paged_config(page_size: usize) -> EngineConfig {
    let mut config = test_config();
    config.page_size = page_size;
    config
}

// ===========================================================================
// End to end
// ===========================================================================

#[tokio::test]
async fn live_message_is_read_and_acknowledged() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    assert_eq!(
        server.next_client_event().await.unwrap(),
        ClientEvent::join(cid("c1"))
    );

    let outcome = h
        .deliver(&server, push(message("c1", "m1", 1_000, "customer")))
        .await;
    assert_eq!(outcome, DispatchOutcome::Applied);
    assert_eq!(h.message_ids("c1"), ["m1"]);
    assert_eq!(h.engine.unread_count(&cid("c1")), 0);
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::PendingAck);

    h.step_until(is_mark_read).await;
    assert_eq!(h.api.read_calls(), vec![cid("c1")]);

    h.deliver(&server, read_ack("c1", &["m1"])).await;
    let messages = h.engine.messages(&cid("c1"));
    assert!(messages[0].is_read);
    assert!(messages[0].is_delivered, "read implies delivered");
    assert_eq!(h.engine.receipt_state(&cid("c1")), ReceiptState::Acked);
}

// ===========================================================================
// Conversation list
// ===========================================================================

#[tokio::test]
async fn conversation_list_loads_from_api() {
    let mut h = Harness::new(vec![
        conversation("c1", None, 0),
        conversation("c2", Some(ChannelKey::Shop), 4),
    ]);
    assert!(h.engine.conversations().is_empty());

    h.load().await;
    assert_eq!(h.engine.conversations().len(), 2);
    assert_eq!(h.engine.unread_count(&cid("c2")), 4);
    assert!(h.drain_events().contains(&EngineEvent::ConversationsChanged));
}

#[tokio::test]
async fn failed_list_load_notifies_and_keeps_list() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.drain_events();

    h.api.fail_conversations("list unavailable");
    h.load().await;

    assert_eq!(h.engine.conversations().len(), 1);
    assert!(
        h.drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Notification(text) if text.contains("list unavailable")))
    );
}

#[tokio::test]
async fn message_for_other_conversation_updates_list_only() {
    let mut h = Harness::loaded(vec![
        conversation("c1", None, 0),
        conversation("c2", None, 1),
    ])
    .await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.drain_events();

    let outcome = h
        .deliver(&server, push(message("c2", "x1", 5_000, "customer")))
        .await;

    assert_eq!(outcome, DispatchOutcome::ListOnly);
    assert_eq!(h.engine.unread_count(&cid("c2")), 2);
    assert!(h.engine.messages(&cid("c2")).is_empty());
    assert!(h.engine.messages(&cid("c1")).is_empty());
    let c2 = h.engine.conversation(&cid("c2")).unwrap();
    assert_eq!(c2.last_message.as_ref().unwrap().id, MessageId::new("x1"));
    assert_eq!(h.engine.conversations()[0].id, cid("c2"), "newest activity first");
    assert!(h.drain_events().contains(&EngineEvent::ConversationsChanged));
}

#[tokio::test]
async fn repeated_push_counts_unread_once() {
    let mut h = Harness::loaded(vec![
        conversation("c1", None, 0),
        conversation("c2", None, 0),
    ])
    .await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    let m = message("c2", "x1", 5_000, "customer");
    assert_eq!(h.deliver(&server, push(m.clone())).await, DispatchOutcome::ListOnly);
    assert_eq!(h.deliver(&server, push(m)).await, DispatchOutcome::Ignored);
    assert_eq!(h.engine.unread_count(&cid("c2")), 1);
}

#[tokio::test]
async fn own_message_elsewhere_is_not_unread() {
    let mut h = Harness::loaded(vec![
        conversation("c1", None, 0),
        conversation("c2", None, 0),
    ])
    .await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    let outcome = h
        .deliver(&server, push(message("c2", "x1", 5_000, AGENT)))
        .await;

    assert_eq!(outcome, DispatchOutcome::ListOnly);
    assert_eq!(h.engine.unread_count(&cid("c2")), 0);
}

#[tokio::test]
async fn push_for_unlisted_conversation_refreshes_list() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.api.add_conversation(conversation("c9", None, 1));

    let outcome = h
        .deliver(&server, push(message("c9", "n1", 5_000, "customer")))
        .await;
    assert_eq!(outcome, DispatchOutcome::Ignored);
    assert!(h.engine.conversation(&cid("c9")).is_none());

    h.step_until(is_conversations).await;
    assert!(h.engine.conversation(&cid("c9")).is_some());
    assert!(h.engine.messages(&cid("c9")).is_empty());
}

// ===========================================================================
// Message log
// ===========================================================================

#[tokio::test]
async fn duplicate_push_is_ignored_and_flags_only_promote() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    let m1 = message("c1", "m1", 1_000, "customer");
    assert_eq!(h.deliver(&server, push(m1.clone())).await, DispatchOutcome::Applied);
    assert_eq!(h.deliver(&server, push(m1.clone())).await, DispatchOutcome::Ignored);

    let mut delivered = m1.clone();
    delivered.is_delivered = true;
    assert_eq!(h.deliver(&server, push(delivered)).await, DispatchOutcome::Applied);

    // A later copy without the flag must not clear it.
    assert_eq!(h.deliver(&server, push(m1)).await, DispatchOutcome::Ignored);

    let messages = h.engine.messages(&cid("c1"));
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_delivered);
}

#[tokio::test]
async fn out_of_order_pushes_are_sorted() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    for (id, at) in [("t3", 3_000), ("t1", 1_000), ("t2", 2_000)] {
        h.deliver(&server, push(message("c1", id, at, "customer"))).await;
    }

    assert_eq!(h.message_ids("c1"), ["t1", "t2", "t3"]);
}

#[tokio::test]
async fn history_and_live_messages_merge_without_duplicates() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.api.set_messages(
        &cid("c1"),
        vec![
            message("c1", "m1", 1_000, "customer"),
            message("c1", "m2", 2_000, AGENT),
        ],
    );
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    let outcome = h
        .deliver(&server, push(message("c1", "m2", 2_000, AGENT)))
        .await;
    assert_eq!(outcome, DispatchOutcome::Ignored);
    h.deliver(&server, push(message("c1", "m3", 3_000, "customer")))
        .await;

    assert_eq!(h.message_ids("c1"), ["m1", "m2", "m3"]);
    let c1 = h.engine.conversation(&cid("c1")).unwrap();
    assert_eq!(c1.last_message.as_ref().unwrap().id, MessageId::new("m3"));
}

// ===========================================================================
// Pagination
// ===========================================================================

#[tokio::test]
async fn older_pages_load_until_start_is_reached() {
    let mut h = Harness::with_config(vec![conversation("c1", None, 0)], paged_config(2));
    h.load().await;
    h.api.set_messages(
        &cid("c1"),
        (1..=5)
            .map(|i| message("c1", &format!("m{i}"), i * 100, "customer"))
            .collect(),
    );

    h.open("c1").await;
    assert_eq!(h.message_ids("c1"), ["m4", "m5"]);
    assert!(h.engine.has_more_history(&cid("c1")));

    assert!(h.engine.load_older_messages().unwrap());
    assert!(
        !h.engine.load_older_messages().unwrap(),
        "one older page at a time"
    );
    h.step_until(is_history).await;
    assert_eq!(h.message_ids("c1"), ["m2", "m3", "m4", "m5"]);
    let (_, query) = h.api.message_queries().pop().unwrap();
    assert_eq!(query.before, Some(MessageId::new("m4")));

    assert!(h.engine.load_older_messages().unwrap());
    h.step_until(is_history).await;
    assert_eq!(h.message_ids("c1"), ["m1", "m2", "m3", "m4", "m5"]);
    assert!(!h.engine.has_more_history(&cid("c1")));

    assert!(!h.engine.load_older_messages().unwrap());
}

#[tokio::test]
async fn load_older_without_open_conversation_fails() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    assert_eq!(
        h.engine.load_older_messages(),
        Err(EngineError::NoActiveConversation)
    );
}

// ===========================================================================
// Sending
// ===========================================================================

#[tokio::test]
async fn sent_message_appears_only_when_echoed() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    server.next_client_event().await.unwrap();

    h.engine.send_message("hello", Vec::new()).await.unwrap();
    assert_eq!(
        server.next_client_event().await.unwrap(),
        ClientEvent::SendMessage(SendMessage {
            conversation_id: cid("c1"),
            message: "hello".to_string(),
            attachments: Vec::new(),
        })
    );
    assert!(h.engine.messages(&cid("c1")).is_empty());

    let mut echo = message("c1", "srv-1", 9_000, AGENT);
    echo.text = Some("hello".to_string());
    h.deliver(&server, push(echo)).await;

    let messages = h.engine.messages(&cid("c1"));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender_id, UserId::new(AGENT));
    assert_eq!(h.engine.unread_count(&cid("c1")), 0);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    assert_eq!(
        h.engine.send_message("hi", Vec::new()).await,
        Err(EngineError::NoActiveConversation)
    );

    h.open("c1").await;
    assert_eq!(
        h.engine.send_message("   ", Vec::new()).await,
        Err(EngineError::EmptyMessage)
    );
}
