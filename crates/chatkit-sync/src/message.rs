//! Chat message model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a conversation (chat room).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier assigned to a message by the authoritative log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signed-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub uid: String,
    pub display_name: String,
}

impl Author {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
        }
    }
}

/// A message that has not been confirmed by the authoritative log.
///
/// Carries no timestamp: the log assigns one when it accepts the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub author_id: String,
    pub author_display_name: String,
    pub text: String,
}

impl MessageDraft {
    pub fn new(conversation_id: ConversationId, author: &Author, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            author_id: author.uid.clone(),
            author_display_name: author.display_name.clone(),
            text: text.into(),
        }
    }
}

/// A chat message.
///
/// `server_timestamp` is the ordering source of truth once set. Until then the message is
/// provisional and ordered by `local_enqueue_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub author_id: String,
    pub author_display_name: String,
    pub text: String,
    /// Milliseconds since the Unix epoch, assigned by the log.
    pub server_timestamp: Option<u64>,
    /// Milliseconds since the Unix epoch, assigned when queued locally.
    pub local_enqueue_timestamp: Option<u64>,
}

impl Message {
    /// A message confirmed by the log.
    pub fn confirmed(draft: MessageDraft, id: MessageId, server_timestamp: u64) -> Self {
        Self {
            id: Some(id),
            conversation_id: draft.conversation_id,
            author_id: draft.author_id,
            author_display_name: draft.author_display_name,
            text: draft.text,
            server_timestamp: Some(server_timestamp),
            local_enqueue_timestamp: None,
        }
    }

    /// A message waiting in the outbox.
    pub fn provisional(draft: MessageDraft, local_enqueue_timestamp: u64) -> Self {
        Self {
            id: None,
            conversation_id: draft.conversation_id,
            author_id: draft.author_id,
            author_display_name: draft.author_display_name,
            text: draft.text,
            server_timestamp: None,
            local_enqueue_timestamp: Some(local_enqueue_timestamp),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.server_timestamp.is_some()
    }

    /// The timestamp the message is currently ordered by.
    pub fn order_key(&self) -> Option<u64> {
        self.server_timestamp.or(self.local_enqueue_timestamp)
    }
}
