//! Integration tests for results that outlive their conversation.
//!
//! A history page, typing event or presence event that arrives after the
//! user switched away must never touch the conversation now open. Failed
//! history loads are recorded without disturbing what is already shown.
//!
//! Verification command: `cargo test --test stale_results`

mod common;

use chatsync::chat::dispatch::DispatchOutcome;
use chatsync::chat::{EngineError, EngineEvent, HistoryStatus};
use chatsync::transport::registry::ConnectionState;

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::ClientEvent;
use chatsync_proto::message::UserId;

use common::{
    Harness, cid, conversation, is_history, is_history_for, message, presence, push, read_ack,
    test_config, typing,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn two_conversations() -> Harness {
    Harness::loaded(vec![conversation("a", None, 0), conversation("b", None, 0)]).await
}

// ===========================================================================
// History generations
// ===========================================================================

#[tokio::test]
async fn history_of_abandoned_conversation_is_discarded() {
    let mut h = two_conversations().await;
    h.api
        .set_messages(&cid("a"), vec![message("a", "a1", 1_000, "customer")]);
    let gate = h.api.hold_messages(&cid("a"));

    h.engine.select_conversation(&cid("a")).await.unwrap();
    h.engine.select_conversation(&cid("b")).await.unwrap();
    assert_eq!(
        h.step_until(is_history_for("b")).await,
        DispatchOutcome::Applied
    );

    gate.release();
    assert_eq!(
        h.step_until(is_history_for("a")).await,
        DispatchOutcome::StaleDropped
    );
    assert!(h.engine.messages(&cid("a")).is_empty());
    assert_eq!(h.engine.active().unwrap().id, cid("b"));
}

#[tokio::test]
async fn reselecting_drops_the_earlier_generation() {
    let mut h = two_conversations().await;
    h.api
        .set_messages(&cid("a"), vec![message("a", "a1", 1_000, "customer")]);
    let gate = h.api.hold_messages(&cid("a"));

    h.engine.select_conversation(&cid("a")).await.unwrap();
    let first = h.engine.active().unwrap().generation;
    h.engine.select_conversation(&cid("b")).await.unwrap();
    h.engine.select_conversation(&cid("a")).await.unwrap();
    assert!(h.engine.active().unwrap().generation > first);

    // The second fetch is not held and lands first.
    assert_eq!(
        h.step_until(is_history_for("a")).await,
        DispatchOutcome::Applied
    );
    gate.release();
    assert_eq!(
        h.step_until(is_history_for("a")).await,
        DispatchOutcome::StaleDropped
    );
    assert_eq!(h.message_ids("a"), ["a1"]);
}

#[tokio::test]
async fn selecting_the_open_conversation_is_a_no_op() {
    let mut h = two_conversations().await;
    h.open("a").await;
    let generation = h.engine.active().unwrap().generation;
    let queries = h.api.message_queries().len();

    h.engine.select_conversation(&cid("a")).await.unwrap();

    assert_eq!(h.engine.active().unwrap().generation, generation);
    assert_eq!(h.api.message_queries().len(), queries);
}

#[tokio::test]
async fn unknown_conversation_cannot_be_selected() {
    let mut h = two_conversations().await;
    h.open("a").await;

    let result = h.engine.select_conversation(&cid("ghost")).await;

    assert_eq!(result, Err(EngineError::UnknownConversation(cid("ghost"))));
    assert_eq!(h.engine.active().unwrap().id, cid("a"));
}

// ===========================================================================
// Room membership
// ===========================================================================

#[tokio::test]
async fn switching_leaves_the_old_room_but_keeps_the_connection() {
    let mut h = two_conversations().await;
    h.open("a").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.open("b").await;

    assert_eq!(
        server.drain_client_events().await,
        vec![
            ClientEvent::join(cid("a")),
            ClientEvent::leave(cid("a")),
            ClientEvent::join(cid("b")),
        ]
    );
    assert_eq!(h.engine.room_refs(ChannelKey::Admin, &cid("a")), 0);
    assert_eq!(h.engine.room_refs(ChannelKey::Admin, &cid("b")), 1);
    assert_eq!(
        h.engine.connection_state(ChannelKey::Admin),
        ConnectionState::Connected
    );
    assert_eq!(h.connector.dial_count(ChannelKey::Admin), 1);
}

#[tokio::test]
async fn conversations_on_different_channels_use_separate_connections() {
    let mut h = Harness::loaded(vec![
        conversation("a", None, 0),
        conversation("s", Some(ChannelKey::Shop), 0),
    ])
    .await;
    h.open("a").await;
    h.open("s").await;

    assert_eq!(h.connector.dial_count(ChannelKey::Admin), 1);
    assert_eq!(h.connector.dial_count(ChannelKey::Shop), 1);
    let shop = h.connector.wait_server(ChannelKey::Shop).await;
    assert_eq!(
        shop.next_client_event().await.unwrap(),
        ClientEvent::join(cid("s"))
    );
    assert_eq!(h.engine.active().unwrap().channel, ChannelKey::Shop);
}

// ===========================================================================
// Late live events
// ===========================================================================

#[tokio::test]
async fn typing_and_presence_for_closed_conversation_are_dropped() {
    let mut h = two_conversations().await;
    h.open("a").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.open("b").await;

    assert_eq!(
        h.deliver(&server, typing("a", "customer", true)).await,
        DispatchOutcome::StaleDropped
    );
    assert_eq!(
        h.deliver(&server, presence("a", "customer", true)).await,
        DispatchOutcome::StaleDropped
    );

    let customer = UserId::new("customer");
    assert!(!h.engine.is_typing(&cid("a"), &customer));
    assert!(!h.engine.is_online(&cid("a"), &customer));
    assert!(h.engine.typing_users(&cid("b")).is_empty());
    assert_eq!(h.engine.pending_typing_timers(), 0);
}

#[tokio::test]
async fn read_ack_for_closed_conversation_still_applies() {
    let mut h = Harness::loaded(vec![conversation("a", None, 3), conversation("b", None, 0)])
        .await;
    h.open("b").await;
    let server = h.connector.wait_server(ChannelKey::Admin).await;

    assert_eq!(
        h.deliver(&server, read_ack("a", &[])).await,
        DispatchOutcome::Applied
    );
    assert_eq!(h.engine.unread_count(&cid("a")), 0);
}

// ===========================================================================
// History failures
// ===========================================================================

#[tokio::test]
async fn failed_first_page_is_recorded_and_retried() {
    let mut h = two_conversations().await;
    h.api
        .set_messages(&cid("a"), vec![message("a", "a1", 1_000, "customer")]);
    h.api.fail_messages(&cid("a"), "history unavailable");

    h.open("a").await;
    assert!(matches!(
        h.engine.history_status(&cid("a")),
        HistoryStatus::Failed(_)
    ));
    assert!(matches!(
        h.engine.history_error(&cid("a")),
        Some(EngineError::HistoryFetchFailed { conversation, reason })
            if conversation == cid("a") && reason.contains("history unavailable")
    ));
    assert!(
        h.drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::HistoryFetchFailed { conversation_id, .. } if *conversation_id == cid("a")))
    );

    // Live delivery keeps working while history is missing.
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    h.deliver(&server, push(message("a", "a2", 2_000, "customer")))
        .await;
    assert_eq!(h.message_ids("a"), ["a2"]);

    assert!(h.engine.retry_history().unwrap());
    assert_eq!(h.engine.history_status(&cid("a")), HistoryStatus::Loading);
    h.step_until(is_history).await;

    assert_eq!(h.engine.history_status(&cid("a")), HistoryStatus::Loaded);
    assert!(h.engine.history_error(&cid("a")).is_none());
    assert_eq!(h.message_ids("a"), ["a1", "a2"]);
    assert!(!h.engine.retry_history().unwrap(), "nothing left to retry");
}

#[tokio::test]
async fn failed_older_page_keeps_loaded_messages() {
    let mut config = test_config();
    config.page_size = 2;
    let mut h = Harness::with_config(vec![conversation("a", None, 0)], config);
    h.load().await;
    h.api.set_messages(
        &cid("a"),
        (1..=3)
            .map(|i| message("a", &format!("m{i}"), i * 100, "customer"))
            .collect(),
    );
    h.open("a").await;
    assert_eq!(h.message_ids("a"), ["m2", "m3"]);

    h.api.fail_messages(&cid("a"), "page unavailable");
    assert!(h.engine.load_older_messages().unwrap());
    h.step_until(is_history).await;

    assert_eq!(h.message_ids("a"), ["m2", "m3"]);
    assert_eq!(h.engine.history_status(&cid("a")), HistoryStatus::Loaded);
    assert!(h.engine.has_more_history(&cid("a")));

    assert!(h.engine.load_older_messages().unwrap(), "older page can be retried");
    h.step_until(is_history).await;
    assert_eq!(h.message_ids("a"), ["m1", "m2", "m3"]);
}
