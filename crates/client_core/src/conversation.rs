//! Active-conversation pointer together with the timeline it owns.
//!
//! Both live behind one lock so the router can check the active id and
//! mutate the store in a single critical section.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::Conversation;
use tokio::sync::Mutex;

use crate::{message::MessageRecord, timeline::TimelineStore};

pub type SharedConversationState = Arc<Mutex<ConversationState>>;

/// Recent deliveries remembered per conversation for preview dedup.
const RECENT_PER_CONVERSATION: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConversation {
    pub conversation: Conversation,
    /// Bumped on every switch; captured by in-flight work to detect staleness.
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPreview {
    pub last_sender: Option<String>,
    pub last_text: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub unread: u32,
}

#[derive(Debug)]
pub struct ConversationState {
    active: Option<ActiveConversation>,
    epoch: u64,
    store: TimelineStore,
    previews: HashMap<Conversation, ConversationPreview>,
    recent: HashMap<Conversation, VecDeque<MessageRecord>>,
}

impl ConversationState {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            active: None,
            epoch: 0,
            store: TimelineStore::new(dedup_window),
            previews: HashMap::new(),
            recent: HashMap::new(),
        }
    }

    pub fn shared(dedup_window: Duration) -> SharedConversationState {
        Arc::new(Mutex::new(Self::new(dedup_window)))
    }

    pub fn active(&self) -> Option<&ActiveConversation> {
        self.active.as_ref()
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().map(|active| &active.conversation)
    }

    /// True while `epoch` still identifies the active conversation.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.active.as_ref().map(|active| active.epoch) == Some(epoch)
    }

    /// Makes `conversation` active with an empty store and returns the new
    /// epoch.
    pub fn activate(&mut self, conversation: Conversation) -> u64 {
        self.epoch += 1;
        self.store.reset();
        if let Some(preview) = self.previews.get_mut(&conversation) {
            preview.unread = 0;
        }
        self.active = Some(ActiveConversation {
            conversation,
            epoch: self.epoch,
        });
        self.epoch
    }

    pub fn store(&self) -> &TimelineStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TimelineStore {
        &mut self.store
    }

    pub fn preview(&self, conversation: &Conversation) -> Option<&ConversationPreview> {
        self.previews.get(conversation)
    }

    /// Folds `record` into the preview of `conversation`. Unread only grows
    /// for inactive conversations and for messages authored by others.
    ///
    /// Returns `None` when `record` is a re-delivery of a message already
    /// seen for this conversation; the preview is left untouched.
    pub fn record_preview(
        &mut self,
        conversation: Conversation,
        record: &MessageRecord,
        from_self: bool,
    ) -> Option<ConversationPreview> {
        let window = self.store.dedup_window();
        let recent = self.recent.entry(conversation.clone()).or_default();
        if recent.iter().any(|seen| record.is_duplicate_of(seen, window)) {
            return None;
        }
        if recent.len() == RECENT_PER_CONVERSATION {
            recent.pop_front();
        }
        recent.push_back(record.clone());

        let is_active = self.active_conversation() == Some(&conversation);
        let preview = self.previews.entry(conversation).or_default();
        if preview
            .last_timestamp
            .map_or(true, |last| record.timestamp >= last)
        {
            preview.last_sender = Some(record.sender.clone());
            preview.last_text = Some(record.text.clone());
            preview.last_timestamp = Some(record.timestamp);
        }
        if !is_active && !from_self {
            preview.unread += 1;
        }
        Some(preview.clone())
    }
}
