//! Conversation synchronization engine.
//!
//! Merges history fetches, optimistic local sends and push-channel events
//! into one ordered, deduplicated timeline for the active conversation.

use shared::domain::Conversation;

pub mod backend;
pub mod config;
pub mod connection;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod message;
pub mod retry;
pub mod router;
pub mod session;
pub mod timeline;

pub use backend::{ChatBackend, HttpChatBackend};
pub use config::{load_settings, ClientSettings};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, InboundHandler, PushChannel,
    PushConnector, WebSocketConnector,
};
pub use controller::{
    ConversationController, ConversationDirectory, ConversationSummary, SelectOutcome,
    SendOutcome, SendRejection,
};
pub use conversation::{ConversationPreview, ConversationState, SharedConversationState};
pub use message::{CorrelationId, MessageOrigin, MessageRecord, RecordError};
pub use router::{EventKind, EventRouter, RouteOutcome};
pub use session::Session;
pub use timeline::{day_label, DayGroup, InsertOutcome, TimelineEntry, TimelineStore};

/// Notifications for renderers. Receivers re-read state through the
/// controller; events carry no timeline contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    TimelineUpdated {
        conversation: Conversation,
    },
    PreviewUpdated {
        conversation: Conversation,
        preview: ConversationPreview,
    },
    HistoryFailed {
        conversation: Conversation,
        reason: String,
    },
    PersistFailed {
        conversation: Conversation,
        correlation_id: CorrelationId,
        reason: String,
    },
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
