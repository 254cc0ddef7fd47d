//! HTTP implementation of [`ChatApi`].

use chatsync_proto::conversation::Conversation;
use chatsync_proto::message::{ConversationId, Message};
use url::Url;

use super::{ApiError, ChatApi, ConversationQuery, MessageQuery};

/// Longest error body kept in [`ApiError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// JSON REST client.
///
/// Endpoints, relative to the base URL:
/// - `GET conversations?channel=&search=`
/// - `GET conversations/{id}/messages?before=&limit=`
/// - `POST conversations/{id}/read`
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpChatApi {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if `base_url` does not parse.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url)?;
        // Keep the last path segment when joining relative paths.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            token,
        })
    }

    /// URL of the conversation list.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if the path cannot be joined.
    pub fn conversations_url(&self, query: &ConversationQuery) -> Result<Url, ApiError> {
        let mut url = self.base.join("conversations")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(channel) = query.channel {
                pairs.append_pair("channel", channel.as_str());
            }
            if let Some(search) = &query.search {
                pairs.append_pair("search", search);
            }
        }
        strip_empty_query(&mut url);
        Ok(url)
    }

    /// URL of a history page.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if the path cannot be joined.
    pub fn messages_url(
        &self,
        conversation: &ConversationId,
        query: &MessageQuery,
    ) -> Result<Url, ApiError> {
        let mut url = self.conversation_url(conversation, "messages")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(before) = &query.before {
                pairs.append_pair("before", before.as_str());
            }
            pairs.append_pair("limit", &query.limit.to_string());
        }
        Ok(url)
    }

    /// URL of the mark-read endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if the path cannot be joined.
    pub fn read_url(&self, conversation: &ConversationId) -> Result<Url, ApiError> {
        self.conversation_url(conversation, "read")
    }

    fn conversation_url(&self, conversation: &ConversationId, leaf: &str) -> Result<Url, ApiError> {
        let mut url = self.base.join("conversations/")?;
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(conversation.as_str())
            .push(leaf);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl ChatApi for HttpChatApi {
    async fn list_conversations(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Conversation>, ApiError> {
        let url = self.conversations_url(query)?;
        tracing::debug!(%url, "listing conversations");
        let response = self.authorized(self.client.get(url)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, ApiError> {
        let url = self.messages_url(conversation, query)?;
        tracing::debug!(%url, "fetching history page");
        let response = self.authorized(self.client.get(url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(conversation.clone()));
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn mark_conversation_read(&self, conversation: &ConversationId) -> Result<(), ApiError> {
        let url = self.read_url(conversation)?;
        let response = self.authorized(self.client.post(url)).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}

fn strip_empty_query(url: &mut Url) {
    if url.query() == Some("") {
        url.set_query(None);
    }
}
