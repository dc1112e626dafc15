use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::Conversation,
    protocol::{
        FriendSummary, MessagePayload, OutboundMessage, PendingRequest, PersistAck, RoomSummary,
        UserSummary,
    },
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    backend::ChatBackend,
    config::ClientSettings,
    connection::{PushChannel, PushConnector},
};

struct Link {
    inbound: Option<mpsc::UnboundedSender<String>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
struct ConnectorState {
    fail_next: u32,
    identities: Vec<String>,
    links: Vec<Link>,
    sent: Vec<String>,
}

/// Push connector backed by in-process channels.
#[derive(Default)]
pub(crate) struct InMemoryConnector {
    state: Mutex<ConnectorState>,
}

impl InMemoryConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next(&self, attempts: u32) {
        self.state.lock().expect("connector lock").fail_next = attempts;
    }

    /// Every connect attempt, failed ones included.
    pub(crate) fn connect_count(&self) -> usize {
        self.state.lock().expect("connector lock").identities.len()
    }

    pub(crate) fn identities(&self) -> Vec<String> {
        self.state.lock().expect("connector lock").identities.clone()
    }

    /// Delivers `frame` on the most recent link.
    pub(crate) fn push(&self, frame: impl Into<String>) -> bool {
        let state = self.state.lock().expect("connector lock");
        match state.links.last().and_then(|link| link.inbound.as_ref()) {
            Some(inbound) => inbound.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Simulates the server dropping the most recent link.
    pub(crate) fn drop_link(&self) {
        let mut state = self.state.lock().expect("connector lock");
        if let Some(link) = state.links.last_mut() {
            link.inbound = None;
        }
    }

    /// Frames written by the client on any link so far.
    pub(crate) fn sent(&self) -> Vec<String> {
        let mut state = self.state.lock().expect("connector lock");
        let mut drained = Vec::new();
        for link in state.links.iter_mut() {
            while let Ok(frame) = link.outbound.try_recv() {
                drained.push(frame);
            }
        }
        state.sent.extend(drained);
        state.sent.clone()
    }

    /// True once the client side of link `index` dropped its outbound queue.
    pub(crate) fn link_released(&self, index: usize) -> bool {
        let mut state = self.state.lock().expect("connector lock");
        let Some(link) = state.links.get_mut(index) else {
            return false;
        };
        let mut drained = Vec::new();
        let released = loop {
            match link.outbound.try_recv() {
                Ok(frame) => drained.push(frame),
                Err(mpsc::error::TryRecvError::Empty) => break false,
                Err(mpsc::error::TryRecvError::Disconnected) => break true,
            }
        };
        state.sent.extend(drained);
        released
    }
}

#[async_trait]
impl PushConnector for InMemoryConnector {
    async fn connect(&self, identity: &str) -> Result<PushChannel> {
        let mut state = self.state.lock().expect("connector lock");
        state.identities.push(identity.to_string());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(anyhow!("connection refused"));
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        state.links.push(Link {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        });
        Ok(PushChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Backend with canned responses and optional gates to hold calls in flight.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    history: Mutex<HashMap<Conversation, Vec<MessagePayload>>>,
    history_gates: Mutex<HashMap<Conversation, oneshot::Receiver<()>>>,
    failing_history: Mutex<HashSet<Conversation>>,
    persist_results: Mutex<VecDeque<Result<PersistAck, String>>>,
    persist_gate: Mutex<Option<oneshot::Receiver<()>>>,
    persisted: Mutex<Vec<OutboundMessage>>,
    friends: Mutex<Vec<FriendSummary>>,
    rooms: Mutex<Vec<RoomSummary>>,
    rooms_missing: Mutex<bool>,
    pending: Mutex<Vec<PendingRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_history(&self, conversation: Conversation, messages: Vec<MessagePayload>) {
        self.history
            .lock()
            .expect("history lock")
            .insert(conversation, messages);
    }

    /// Holds the next history fetch for `conversation` until the returned
    /// sender fires.
    pub(crate) fn gate_history(&self, conversation: Conversation) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.history_gates
            .lock()
            .expect("gate lock")
            .insert(conversation, rx);
        tx
    }

    pub(crate) fn fail_history(&self, conversation: Conversation) {
        self.failing_history
            .lock()
            .expect("failing lock")
            .insert(conversation);
    }

    pub(crate) fn queue_persist(&self, result: Result<PersistAck, String>) {
        self.persist_results
            .lock()
            .expect("persist lock")
            .push_back(result);
    }

    pub(crate) fn gate_persist(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.persist_gate.lock().expect("gate lock") = Some(rx);
        tx
    }

    pub(crate) fn persisted(&self) -> Vec<OutboundMessage> {
        self.persisted.lock().expect("persisted lock").clone()
    }

    pub(crate) fn set_friends(&self, friends: Vec<FriendSummary>) {
        *self.friends.lock().expect("friends lock") = friends;
    }

    pub(crate) fn set_rooms(&self, rooms: Vec<RoomSummary>) {
        *self.rooms.lock().expect("rooms lock") = rooms;
    }

    /// Makes the room listing fail as if the route did not exist.
    pub(crate) fn remove_room_route(&self) {
        *self.rooms_missing.lock().expect("rooms lock") = true;
    }

    pub(crate) fn set_pending(&self, pending: Vec<PendingRequest>) {
        *self.pending.lock().expect("pending lock") = pending;
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn login(&self, username: &str) -> Result<UserSummary> {
        Ok(UserSummary {
            username: shared::domain::Username::new(username),
        })
    }

    async fn fetch_history(
        &self,
        conversation: &Conversation,
        _requesting_user: &str,
    ) -> Result<Vec<MessagePayload>> {
        let gate = self
            .history_gates
            .lock()
            .expect("gate lock")
            .remove(conversation);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self
            .failing_history
            .lock()
            .expect("failing lock")
            .contains(conversation)
        {
            return Err(anyhow!("history unavailable"));
        }
        Ok(self
            .history
            .lock()
            .expect("history lock")
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_message(&self, message: &OutboundMessage) -> Result<PersistAck> {
        self.persisted
            .lock()
            .expect("persisted lock")
            .push(message.clone());
        let gate = self.persist_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let next = self
            .persist_results
            .lock()
            .expect("persist lock")
            .pop_front();
        match next {
            Some(Ok(ack)) => Ok(ack),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(PersistAck::default()),
        }
    }

    async fn list_friends(&self, _username: &str) -> Result<Vec<FriendSummary>> {
        Ok(self.friends.lock().expect("friends lock").clone())
    }

    async fn list_pending_requests(&self, _username: &str) -> Result<Vec<PendingRequest>> {
        Ok(self.pending.lock().expect("pending lock").clone())
    }

    async fn list_rooms(&self, _username: &str) -> Result<Vec<RoomSummary>> {
        if *self.rooms_missing.lock().expect("rooms lock") {
            return Err(anyhow!("404 Not Found"));
        }
        Ok(self.rooms.lock().expect("rooms lock").clone())
    }
}

pub(crate) fn fast_settings() -> ClientSettings {
    ClientSettings {
        request_timeout_ms: 2_000,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 40,
        reconnect_max_attempts: 5,
        ..ClientSettings::default()
    }
}

pub(crate) fn direct_payload(sender: &str, receiver: &str, text: &str, timestamp: &str) -> MessagePayload {
    MessagePayload {
        sender: sender.to_string(),
        receiver: Some(receiver.to_string()),
        text: text.to_string(),
        timestamp: Some(timestamp.to_string()),
        ..MessagePayload::default()
    }
}

pub(crate) fn room_payload(sender: &str, room: &str, text: &str, timestamp: &str) -> MessagePayload {
    MessagePayload {
        sender: sender.to_string(),
        room: Some(room.to_string()),
        text: text.to_string(),
        timestamp: Some(timestamp.to_string()),
        ..MessagePayload::default()
    }
}

pub(crate) fn push_frame(event: &str, payload: &MessagePayload) -> String {
    serde_json::json!({ "event": event, "data": payload }).to_string()
}

/// Polls `condition` until it holds or roughly two seconds pass.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
