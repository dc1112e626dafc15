//! Dispatches inbound push frames to the active conversation's timeline.

use async_trait::async_trait;
use shared::{
    domain::{Conversation, ConversationKind},
    protocol::{
        MessagePayload, PushEvent, EVENT_DIRECT_MESSAGE, EVENT_GROUP_MESSAGE,
        EVENT_PRIVATE_MESSAGE, EVENT_ROOM_MESSAGE,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    connection::InboundHandler,
    conversation::SharedConversationState,
    message::{MessageOrigin, MessageRecord},
    timeline::InsertOutcome,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DirectMessage,
    GroupMessage,
    Other,
}

impl EventKind {
    pub fn classify(event: &str) -> Self {
        match event {
            EVENT_PRIVATE_MESSAGE | EVENT_DIRECT_MESSAGE => Self::DirectMessage,
            EVENT_ROOM_MESSAGE | EVENT_GROUP_MESSAGE => Self::GroupMessage,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied(InsertOutcome),
    /// A valid message for a conversation that is not active.
    NotActive,
    Ignored,
    Malformed,
}

pub struct EventRouter {
    identity: String,
    state: SharedConversationState,
    events: broadcast::Sender<ClientEvent>,
}

impl EventRouter {
    pub fn new(
        identity: impl Into<String>,
        state: SharedConversationState,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            identity: identity.into(),
            state,
            events,
        }
    }

    pub async fn route_frame(&self, frame: &str) -> RouteOutcome {
        match serde_json::from_str::<PushEvent>(frame) {
            Ok(event) => self.route_event(event).await,
            Err(err) => {
                warn!(error = %err, "router: dropping undecodable push frame");
                RouteOutcome::Malformed
            }
        }
    }

    pub async fn route_event(&self, event: PushEvent) -> RouteOutcome {
        let kind = EventKind::classify(&event.event);
        if kind == EventKind::Other {
            debug!(event = %event.event, "router: ignoring non-message event");
            return RouteOutcome::Ignored;
        }

        let payload: MessagePayload = match serde_json::from_value(event.data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event = %event.event, error = %err, "router: dropping undecodable message payload");
                return RouteOutcome::Malformed;
            }
        };
        let record = match MessageRecord::from_payload(&payload, MessageOrigin::Remote) {
            Ok(record) => record,
            Err(err) => {
                warn!(event = %event.event, error = %err, "router: dropping malformed message");
                return RouteOutcome::Malformed;
            }
        };

        let conversation = self.conversation_for(kind, &record);
        let from_self = record.sender == self.identity;
        let (outcome, preview) = {
            let mut state = self.state.lock().await;
            let preview = state.record_preview(conversation.clone(), &record, from_self);
            let outcome = if routes_to(kind, &record, state.active_conversation()) {
                RouteOutcome::Applied(state.store_mut().insert_remote(record))
            } else {
                RouteOutcome::NotActive
            };
            (outcome, preview)
        };

        if let Some(preview) = preview {
            let _ = self.events.send(ClientEvent::PreviewUpdated {
                conversation: conversation.clone(),
                preview,
            });
        }
        if let RouteOutcome::Applied(insert) = &outcome {
            if insert.changed_store() {
                let _ = self
                    .events
                    .send(ClientEvent::TimelineUpdated { conversation });
            }
        }
        outcome
    }

    fn conversation_for(&self, kind: EventKind, record: &MessageRecord) -> Conversation {
        match kind {
            EventKind::GroupMessage => Conversation::group(record.target.clone()),
            _ if record.sender == self.identity => Conversation::direct(record.target.clone()),
            _ => Conversation::direct(record.sender.clone()),
        }
    }
}

fn routes_to(kind: EventKind, record: &MessageRecord, active: Option<&Conversation>) -> bool {
    let Some(active) = active else {
        return false;
    };
    match (kind, active.kind) {
        (EventKind::DirectMessage, ConversationKind::Direct) => {
            record.sender == active.id.as_str() || record.target == active.id.as_str()
        }
        (EventKind::GroupMessage, ConversationKind::Group) => {
            record.target == active.id.as_str()
        }
        _ => false,
    }
}

#[async_trait]
impl InboundHandler for EventRouter {
    async fn handle_frame(&self, frame: String) {
        self.route_frame(&frame).await;
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
