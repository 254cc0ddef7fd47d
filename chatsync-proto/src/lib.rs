//! Shared data model and socket protocol for the chat synchronization engine.

pub mod codec;
pub mod conversation;
pub mod event;
pub mod message;
pub mod presence;
pub mod typing;
