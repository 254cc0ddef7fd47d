//! Integration tests for connection loss and recovery.
//!
//! A dropped channel is redialed with exponential backoff; on success
//! every open room is joined again and missed state is refetched. When
//! the attempts run out the channel reports itself disconnected until a
//! manual reconnect. Sends on a dead channel fail immediately and are
//! never queued.
//!
//! Verification command: `cargo test --test reconnect`

mod common;

use std::time::Duration;

use chatsync::chat::dispatch::DispatchOutcome;
use chatsync::chat::{EngineError, EngineEvent, HistoryStatus, Inbound};
use chatsync::transport::registry::{ConnectionEvent, ConnectionState};

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::ClientEvent;
use chatsync_proto::message::UserId;

use common::{Harness, Item, cid, conversation, is_history, message, presence};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_reconnected(item: &Item) -> bool {
    matches!(item, Inbound::Connection(ConnectionEvent::Reconnected { .. }))
}

fn is_closed(item: &Item) -> bool {
    matches!(item, Inbound::Connection(ConnectionEvent::Closed { .. }))
}

fn is_exhausted(item: &Item) -> bool {
    matches!(item, Inbound::Connection(ConnectionEvent::Exhausted { .. }))
}

fn notified_unavailable(events: &[EngineEvent], channel: ChannelKey) -> bool {
    let expected = EngineError::TransportUnavailable(channel).to_string();
    events
        .iter()
        .any(|e| matches!(e, EngineEvent::Notification(text) if *text == expected))
}

// ===========================================================================
// Recovery
// ===========================================================================

#[tokio::test]
async fn severed_channel_reconnects_and_rejoins_room() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let first = h.connector.wait_server(ChannelKey::Admin).await;
    assert_eq!(
        first.next_client_event().await.unwrap(),
        ClientEvent::join(cid("c1"))
    );
    h.drain_events();

    first.sever();
    assert_eq!(
        h.step_until(is_reconnected).await,
        DispatchOutcome::Applied
    );

    let second = h.connector.wait_server(ChannelKey::Admin).await;
    assert_eq!(
        second.next_client_event().await.unwrap(),
        ClientEvent::join(cid("c1"))
    );
    assert_eq!(
        h.engine.connection_state(ChannelKey::Admin),
        ConnectionState::Connected
    );
    assert_eq!(h.connector.dial_count(ChannelKey::Admin), 2);
    assert_eq!(h.engine.room_refs(ChannelKey::Admin, &cid("c1")), 1);

    let events = h.drain_events();
    assert!(events.contains(&EngineEvent::ConnectionStatus {
        channel: ChannelKey::Admin,
        connected: false,
    }));
    assert!(events.contains(&EngineEvent::Reconnecting {
        channel: ChannelKey::Admin,
        attempt: 1,
        delay: Duration::from_millis(10),
    }));
    assert!(events.contains(&EngineEvent::ConnectionStatus {
        channel: ChannelKey::Admin,
        connected: true,
    }));
}

#[tokio::test]
async fn missed_messages_are_fetched_after_reconnect() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.api
        .set_messages(&cid("c1"), vec![message("c1", "m1", 1_000, "customer")]);
    h.open("c1").await;
    let first = h.connector.wait_server(ChannelKey::Admin).await;

    first.sever();
    // Sent while the channel was down.
    h.api.set_messages(
        &cid("c1"),
        vec![
            message("c1", "m1", 1_000, "customer"),
            message("c1", "m2", 2_000, "customer"),
        ],
    );
    h.step_until(is_reconnected).await;
    h.step_until(is_history).await;

    assert_eq!(h.message_ids("c1"), ["m1", "m2"]);
    assert_eq!(h.engine.history_status(&cid("c1")), HistoryStatus::Loaded);
}

#[tokio::test]
async fn dropped_connection_forgets_presence() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let first = h.connector.wait_server(ChannelKey::Admin).await;
    let customer = UserId::new("customer");
    h.deliver(&first, presence("c1", "customer", true)).await;
    assert!(h.engine.is_online(&cid("c1"), &customer));
    h.drain_events();

    first.sever();
    assert_eq!(h.step_until(is_closed).await, DispatchOutcome::Applied);

    assert!(!h.engine.is_online(&cid("c1"), &customer));
    assert!(h.drain_events().contains(&EngineEvent::PresenceChanged {
        conversation_id: cid("c1"),
        user_id: customer.clone(),
        online: false,
    }));

    h.step_until(is_reconnected).await;
    assert!(!h.engine.is_online(&cid("c1"), &customer));
}

#[tokio::test]
async fn failed_first_dial_joins_once_connected() {
    let mut h = Harness::loaded(vec![conversation("s1", Some(ChannelKey::Shop), 0)]).await;
    h.connector.fail_next(ChannelKey::Shop, 1);

    h.engine.select_conversation(&cid("s1")).await.unwrap();
    assert!(notified_unavailable(&h.drain_events(), ChannelKey::Shop));
    assert!(matches!(
        h.engine.connection_state(ChannelKey::Shop),
        ConnectionState::Reconnecting { .. }
    ));
    assert_eq!(h.engine.room_refs(ChannelKey::Shop, &cid("s1")), 1);

    h.step_until(is_reconnected).await;
    let server = h.connector.wait_server(ChannelKey::Shop).await;
    assert_eq!(
        server.next_client_event().await.unwrap(),
        ClientEvent::join(cid("s1"))
    );
}

// ===========================================================================
// Dead channels
// ===========================================================================

#[tokio::test]
async fn send_while_disconnected_fails_and_is_not_queued() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let first = h.connector.wait_server(ChannelKey::Admin).await;
    h.drain_events();

    first.sever();
    let result = h.engine.send_message("lost", Vec::new()).await;

    assert_eq!(result, Err(EngineError::TransportUnavailable(ChannelKey::Admin)));
    assert!(notified_unavailable(&h.drain_events(), ChannelKey::Admin));
    assert!(h.engine.messages(&cid("c1")).is_empty());

    h.step_until(is_reconnected).await;
    let second = h.connector.wait_server(ChannelKey::Admin).await;
    assert_eq!(
        second.next_client_event().await.unwrap(),
        ClientEvent::join(cid("c1"))
    );
    assert!(second.drain_client_events().await.is_empty());
}

#[tokio::test]
async fn exhausted_reconnect_reports_disconnected_until_retried() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;
    let first = h.connector.wait_server(ChannelKey::Admin).await;
    h.drain_events();

    h.connector.fail_next(ChannelKey::Admin, 3);
    first.sever();
    assert_eq!(h.step_until(is_exhausted).await, DispatchOutcome::Applied);

    assert_eq!(h.connector.dial_count(ChannelKey::Admin), 4);
    assert_eq!(
        h.engine.connection_state(ChannelKey::Admin),
        ConnectionState::Disconnected
    );
    assert_eq!(
        h.engine.connection_error(ChannelKey::Admin),
        Some(EngineError::ReconnectExhausted {
            channel: ChannelKey::Admin,
            attempts: 3,
        })
    );
    assert!(h.drain_events().contains(&EngineEvent::Disconnected {
        channel: ChannelKey::Admin,
        attempts: 3,
    }));
    assert_eq!(
        h.engine.send_message("still down", Vec::new()).await,
        Err(EngineError::TransportUnavailable(ChannelKey::Admin))
    );

    assert!(h.engine.reconnect(ChannelKey::Admin));
    assert!(!h.engine.reconnect(ChannelKey::Admin), "already retrying");
    h.step_until(is_reconnected).await;

    assert!(h.engine.connection_error(ChannelKey::Admin).is_none());
    let server = h.connector.wait_server(ChannelKey::Admin).await;
    assert_eq!(
        server.next_client_event().await.unwrap(),
        ClientEvent::join(cid("c1"))
    );
}

#[tokio::test]
async fn connected_channel_needs_no_manual_reconnect() {
    let mut h = Harness::loaded(vec![conversation("c1", None, 0)]).await;
    h.open("c1").await;

    assert!(!h.engine.reconnect(ChannelKey::Admin));
    assert_eq!(h.connector.dial_count(ChannelKey::Admin), 1);
}
