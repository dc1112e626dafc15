//! Conversation selection, history loading and the optimistic send pipeline.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{NaiveDate, TimeZone, Utc};
use shared::{
    domain::{Conversation, ConversationKind},
    protocol::{OutboundMessage, PendingRequest},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    backend::ChatBackend,
    connection::ConnectionManager,
    conversation::{ActiveConversation, ConversationPreview, SharedConversationState},
    error::SyncError,
    message::{
        format_timestamp, parse_timestamp, CorrelationId, MessageDraft, MessageOrigin,
        MessageRecord,
    },
    timeline::{DayGroup, InsertOutcome},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Loaded {
        inserted: usize,
        duplicates: usize,
        rejected: usize,
    },
    /// Another conversation became active before history arrived.
    Superseded,
    FetchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejection {
    EmptyText,
    NoActiveConversation,
    NotActiveConversation,
    ConnectionNotOpen,
    InvalidMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Rejected(SendRejection),
    Confirmed {
        correlation_id: CorrelationId,
        server_id: Option<String>,
    },
    PersistFailed {
        correlation_id: CorrelationId,
    },
    /// The conversation was switched before the persist call returned.
    Superseded {
        correlation_id: CorrelationId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub preview: ConversationPreview,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationDirectory {
    pub conversations: Vec<ConversationSummary>,
    pub pending_requests: Vec<PendingRequest>,
}

pub struct ConversationController {
    identity: String,
    backend: Arc<dyn ChatBackend>,
    connection: Arc<ConnectionManager>,
    state: SharedConversationState,
    events: broadcast::Sender<ClientEvent>,
    request_timeout: Duration,
}

impl ConversationController {
    pub fn new(
        identity: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        connection: Arc<ConnectionManager>,
        state: SharedConversationState,
        events: broadcast::Sender<ClientEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            identity: identity.into(),
            backend,
            connection,
            state,
            events,
            request_timeout,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn active_conversation(&self) -> Option<ActiveConversation> {
        self.state.lock().await.active().cloned()
    }

    /// Makes `conversation` active and loads its history.
    ///
    /// The store is reset before the fetch starts, so records of the previous
    /// conversation are never visible under the new one.
    pub async fn select_conversation(&self, conversation: Conversation) -> SelectOutcome {
        let epoch = self.state.lock().await.activate(conversation.clone());
        info!(conversation = %conversation, epoch, "controller: conversation selected");
        let _ = self.events.send(ClientEvent::TimelineUpdated {
            conversation: conversation.clone(),
        });

        let fetched = self
            .bounded("history fetch", self.backend.fetch_history(&conversation, &self.identity))
            .await;
        let payloads = match fetched {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(conversation = %conversation, error = %err, "controller: history fetch failed");
                let _ = self.events.send(ClientEvent::HistoryFailed {
                    conversation,
                    reason: err.to_string(),
                });
                return SelectOutcome::FetchFailed;
            }
        };

        let (mut inserted, mut duplicates, mut rejected) = (0, 0, 0);
        {
            let mut state = self.state.lock().await;
            if !state.is_current(epoch) {
                debug!(conversation = %conversation, epoch, "controller: discarding superseded history");
                return SelectOutcome::Superseded;
            }
            for payload in &payloads {
                let outcome = match MessageRecord::from_payload(payload, MessageOrigin::Confirmed) {
                    Ok(record) => state.store_mut().insert_confirmed(record),
                    Err(err) => InsertOutcome::Rejected(err),
                };
                match outcome {
                    InsertOutcome::Inserted | InsertOutcome::Confirmed => inserted += 1,
                    InsertOutcome::Duplicate => duplicates += 1,
                    InsertOutcome::Rejected(err) => {
                        rejected += 1;
                        warn!(conversation = %conversation, error = %err, "controller: skipped malformed history record");
                    }
                }
            }
        }

        debug!(conversation = %conversation, inserted, duplicates, rejected, "controller: history applied");
        let _ = self
            .events
            .send(ClientEvent::TimelineUpdated { conversation });
        SelectOutcome::Loaded {
            inserted,
            duplicates,
            rejected,
        }
    }

    /// Optimistically appends `text`, pushes it on the connection and
    /// persists it.
    pub async fn send_message(&self, conversation: &Conversation, text: &str) -> SendOutcome {
        if text.trim().is_empty() {
            return SendOutcome::Rejected(SendRejection::EmptyText);
        }

        let (epoch, correlation_id, outbound) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.active().cloned() else {
                debug!("controller: send without an active conversation");
                return SendOutcome::Rejected(SendRejection::NoActiveConversation);
            };
            if &active.conversation != conversation {
                debug!(conversation = %conversation, active = %active.conversation, "controller: send to inactive conversation");
                return SendOutcome::Rejected(SendRejection::NotActiveConversation);
            }
            if !self.connection.is_open() {
                warn!(conversation = %conversation, "controller: push channel not open; send rejected");
                return SendOutcome::Rejected(SendRejection::ConnectionNotOpen);
            }

            let timestamp = Utc::now();
            let draft = MessageDraft {
                sender: self.identity.clone(),
                target: conversation.id.as_str().to_string(),
                text: text.to_string(),
                timestamp,
            };
            let Some(correlation_id) = state.store_mut().insert_optimistic(draft) else {
                return SendOutcome::Rejected(SendRejection::InvalidMessage);
            };
            let outbound = OutboundMessage::for_conversation(
                conversation,
                self.identity.clone(),
                text,
                format_timestamp(&timestamp),
                correlation_id.as_str(),
            );
            (active.epoch, correlation_id, outbound)
        };
        let _ = self.events.send(ClientEvent::TimelineUpdated {
            conversation: conversation.clone(),
        });

        if !self.connection.send(&outbound) {
            debug!(correlation_id = %correlation_id, "controller: push frame not sent; persisting anyway");
        }

        let persisted = self
            .bounded("persist", self.backend.persist_message(&outbound))
            .await;

        let mut state = self.state.lock().await;
        if !state.is_current(epoch) {
            debug!(correlation_id = %correlation_id, "controller: skipping reconciliation for superseded conversation");
            return SendOutcome::Superseded { correlation_id };
        }

        match persisted {
            Ok(ack) => {
                let server_record = MessageRecord {
                    sender: self.identity.clone(),
                    target: conversation.id.as_str().to_string(),
                    text: text.to_string(),
                    timestamp: ack
                        .timestamp
                        .as_deref()
                        .and_then(|raw| parse_timestamp(raw).ok())
                        .unwrap_or_else(Utc::now),
                    origin: MessageOrigin::Confirmed,
                    correlation_id: Some(correlation_id.clone()),
                    server_id: ack.server_id.clone(),
                    persist_failed: false,
                };
                let outcome = state.store_mut().reconcile(&correlation_id, server_record);
                drop(state);
                debug!(correlation_id = %correlation_id, ?outcome, "controller: message confirmed");
                if outcome.changed_store() {
                    let _ = self.events.send(ClientEvent::TimelineUpdated {
                        conversation: conversation.clone(),
                    });
                }
                SendOutcome::Confirmed {
                    correlation_id,
                    server_id: ack.server_id,
                }
            }
            Err(err) => {
                state.store_mut().mark_failed(&correlation_id);
                drop(state);
                warn!(conversation = %conversation, correlation_id = %correlation_id, error = %err, "controller: persist failed");
                let _ = self.events.send(ClientEvent::PersistFailed {
                    conversation: conversation.clone(),
                    correlation_id: correlation_id.clone(),
                    reason: err.to_string(),
                });
                SendOutcome::PersistFailed { correlation_id }
            }
        }
    }

    /// Friends and rooms merged into one list with their previews. Only the
    /// friend list is required; rooms and pending requests degrade to empty.
    pub async fn conversation_list(&self) -> Result<ConversationDirectory> {
        let friends = self
            .bounded("friend list", self.backend.list_friends(&self.identity))
            .await?;
        let rooms = match self
            .bounded("room list", self.backend.list_rooms(&self.identity))
            .await
        {
            Ok(rooms) => rooms,
            Err(err) => {
                warn!(error = %err, "controller: room list unavailable");
                Vec::new()
            }
        };
        let pending_requests = match self
            .bounded(
                "pending requests",
                self.backend.list_pending_requests(&self.identity),
            )
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "controller: pending requests unavailable");
                Vec::new()
            }
        };

        let state = self.state.lock().await;
        let mut conversations: Vec<ConversationSummary> = Vec::new();
        let direct = friends
            .iter()
            .filter(|friend| friend.accepted)
            .map(|friend| Conversation::direct(friend.peer_of(&self.identity).as_str()));
        let group = rooms.iter().map(|room| Conversation::group(room.name.clone()));
        for conversation in direct.chain(group) {
            if conversations
                .iter()
                .any(|summary| summary.conversation == conversation)
            {
                continue;
            }
            let preview = state.preview(&conversation).cloned().unwrap_or_default();
            conversations.push(ConversationSummary {
                conversation,
                preview,
            });
        }
        conversations.sort_by(|a, b| {
            b.preview
                .last_timestamp
                .cmp(&a.preview.last_timestamp)
                .then_with(|| kind_rank(a.conversation.kind).cmp(&kind_rank(b.conversation.kind)))
                .then_with(|| a.conversation.id.cmp(&b.conversation.id))
        });

        Ok(ConversationDirectory {
            conversations,
            pending_requests,
        })
    }

    /// Copy of the active timeline in display order.
    pub async fn timeline_snapshot(&self) -> Vec<MessageRecord> {
        self.state.lock().await.store().ordered().cloned().collect()
    }

    /// Active timeline partitioned by calendar day in `tz`.
    pub async fn timeline_days<Tz: TimeZone>(&self, tz: Tz) -> Vec<(NaiveDate, Vec<MessageRecord>)> {
        let state = self.state.lock().await;
        state
            .store()
            .day_groups(tz)
            .into_iter()
            .map(|DayGroup { date, records }| (date, records.into_iter().cloned().collect()))
            .collect()
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                operation,
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
            .into()),
        }
    }
}

fn kind_rank(kind: ConversationKind) -> u8 {
    match kind {
        ConversationKind::Direct => 0,
        ConversationKind::Group => 1,
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
