//! `chatsync`: real-time chat synchronization engine.
//!
//! Keeps a client's view of conversations, messages, typing indicators,
//! presence and read receipts consistent while events arrive from a
//! multiplexed socket per channel and from paginated REST history.

pub mod api;
pub mod chat;
pub mod config;
pub mod engine;
pub mod transport;
