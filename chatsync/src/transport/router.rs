//! Channel routing for conversations.

use chatsync_proto::conversation::{ChannelKey, Conversation};

/// Resolve which channel's connection serves `conversation`.
///
/// Missing or unrecognized tags route to [`ChannelKey::Admin`].
#[must_use]
pub fn route_channel(conversation: &Conversation) -> ChannelKey {
    route_tag(conversation.channel.as_deref())
}

/// Resolve a raw channel tag, defaulting to [`ChannelKey::Admin`].
#[must_use]
pub fn route_tag(tag: Option<&str>) -> ChannelKey {
    tag.and_then(|t| t.parse().ok()).unwrap_or(ChannelKey::Admin)
}
