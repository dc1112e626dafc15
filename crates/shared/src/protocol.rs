use serde::{Deserialize, Serialize};

use crate::domain::{Conversation, ConversationKind, Username};

pub const EVENT_PRIVATE_MESSAGE: &str = "private_message";
pub const EVENT_DIRECT_MESSAGE: &str = "direct_message";
pub const EVENT_ROOM_MESSAGE: &str = "room_message";
pub const EVENT_GROUP_MESSAGE: &str = "group_message";

/// Inbound push-channel envelope.
///
/// `data` stays untyped until the event kind is known so unknown kinds can be
/// skipped without failing to decode the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Message shape shared by push events and history responses.
///
/// Every field is optional on the wire; required-field validation happens
/// when the payload is turned into a timeline record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(
        default,
        alias = "id",
        alias = "server_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<String>,
    #[serde(default, alias = "username")]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl MessagePayload {
    /// Room name for group messages, peer username for direct messages.
    pub fn target(&self) -> Option<&str> {
        self.room.as_deref().or(self.receiver.as_deref())
    }
}

/// Locally authored message, used both as the push-channel frame and as the
/// persist request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Private {
        sender: String,
        receiver: String,
        text: String,
        timestamp: String,
        correlation_id: String,
    },
    Room {
        sender: String,
        room: String,
        text: String,
        timestamp: String,
        correlation_id: String,
    },
}

impl OutboundMessage {
    pub fn for_conversation(
        conversation: &Conversation,
        sender: impl Into<String>,
        text: impl Into<String>,
        timestamp: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        match conversation.kind {
            ConversationKind::Direct => Self::Private {
                sender: sender.into(),
                receiver: conversation.id.0.clone(),
                text: text.into(),
                timestamp: timestamp.into(),
                correlation_id: correlation_id.into(),
            },
            ConversationKind::Group => Self::Room {
                sender: sender.into(),
                room: conversation.id.0.clone(),
                text: text.into(),
                timestamp: timestamp.into(),
                correlation_id: correlation_id.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistAck {
    #[serde(
        default,
        alias = "id",
        alias = "message_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: Username,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendSummary {
    pub from_user: Username,
    pub to_user: Username,
    #[serde(default)]
    pub accepted: bool,
}

impl FriendSummary {
    /// The other side of the friendship as seen by `me`.
    pub fn peer_of(&self, me: &str) -> &Username {
        if self.from_user.as_str() == me {
            &self.to_user
        } else {
            &self.from_user
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub from_user: Username,
    pub to_user: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub name: String,
    #[serde(default)]
    pub members: Vec<Username>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
