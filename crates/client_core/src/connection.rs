//! Lifecycle of the single push-channel connection.
//!
//! One [`ConnectionManager`] exists per authenticated session. Every `open`
//! starts a fresh connection instance (a new generation); late results from a
//! superseded generation are discarded. Inbound frames go to exactly one
//! registered [`InboundHandler`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Closed)
                | (Closed, Connecting)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        generation: u64,
    },
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
        generation: u64,
    },
    ReconnectExhausted {
        generation: u64,
    },
}

/// Both directions of an established push channel.
pub struct PushChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<PushChannel>;
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_frame(&self, frame: String);
}

pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    retry: RetryPolicy,
    inner: Mutex<ConnectionInner>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct ConnectionInner {
    state: ConnectionState,
    identity: Option<String>,
    generation: u64,
    retry_count: u32,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn PushConnector>, retry: RetryPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            connector,
            retry,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Idle,
                identity: None,
                generation: 0,
                retry_count: 0,
                outbound: None,
                reader_task: None,
                reconnect_task: None,
            }),
            handler: RwLock::new(None),
            events,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn identity(&self) -> Option<String> {
        self.lock_inner().identity.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock_inner().generation
    }

    pub fn retry_count(&self) -> u32 {
        self.lock_inner().retry_count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Installs the single inbound consumer, dropping any previous one.
    pub fn on_event(&self, handler: Arc<dyn InboundHandler>) {
        let previous = self
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handler);
        if previous.is_some() {
            debug!("connection: replaced inbound handler");
        }
    }

    /// Opens a push channel scoped to `identity`.
    ///
    /// Any existing connection is released first. Failures land in `Closed`
    /// and are only logged.
    pub async fn open(self: &Arc<Self>, identity: &str) {
        let generation = {
            let mut guard = self.lock_inner();
            self.release(&mut guard);
            guard.generation += 1;
            guard.identity = Some(identity.to_string());
            guard.retry_count = 0;
            self.transition(&mut guard, ConnectionState::Connecting);
            guard.generation
        };
        info!(identity, generation, "connection: opening push channel");
        self.establish(identity, generation).await;
    }

    /// Releases the connection. Safe to call in any state.
    pub fn close(&self) {
        let mut guard = self.lock_inner();
        self.release(&mut guard);
        guard.generation += 1;
        if let Some(identity) = guard.identity.take() {
            info!(identity, "connection: push channel released");
        }
    }

    /// Enqueues `event` on the open connection. Returns `false` (and logs)
    /// when the connection is not open.
    pub fn send<T: Serialize>(&self, event: &T) -> bool {
        let guard = self.lock_inner();
        if guard.state != ConnectionState::Open {
            warn!(state = ?guard.state, "connection: push channel not open; dropping outbound event");
            return false;
        }
        let Some(outbound) = guard.outbound.as_ref() else {
            warn!("connection: open state without outbound queue; dropping outbound event");
            return false;
        };
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "connection: failed to encode outbound event");
                return false;
            }
        };
        if outbound.send(frame).is_err() {
            warn!("connection: outbound queue closed; dropping outbound event");
            return false;
        }
        true
    }

    fn lock_inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn establish(self: &Arc<Self>, identity: &str, generation: u64) -> bool {
        let result = self.connector.connect(identity).await;

        let mut guard = self.lock_inner();
        if guard.generation != generation {
            debug!(identity, generation, "connection: discarding superseded connect result");
            return false;
        }
        match result {
            Ok(channel) => {
                guard.outbound = Some(channel.outbound);
                guard.reader_task = Some(self.spawn_reader(channel.inbound, generation));
                guard.retry_count = 0;
                self.transition(&mut guard, ConnectionState::Open);
                info!(identity, generation, "connection: push channel open");
                true
            }
            Err(err) => {
                warn!(identity, generation, error = %err, "connection: failed to open push channel");
                self.transition(&mut guard, ConnectionState::Closed);
                false
            }
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        generation: u64,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.dispatch(frame).await;
            }
            if let Some(manager) = manager.upgrade() {
                manager.handle_disconnect(generation);
            }
        })
    }

    async fn dispatch(&self, frame: String) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler.handle_frame(frame).await,
            None => debug!("connection: no inbound handler registered; dropping frame"),
        }
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        let mut guard = self.lock_inner();
        if guard.generation != generation || guard.state != ConnectionState::Open {
            return;
        }
        warn!(generation, "connection: push channel dropped");
        guard.outbound = None;
        // The reader task is the caller; detach its handle instead of aborting.
        guard.reader_task = None;
        self.transition(&mut guard, ConnectionState::Closed);

        if !self.retry.is_enabled() {
            return;
        }
        if let Some(identity) = guard.identity.clone() {
            guard.reconnect_task = Some(self.spawn_reconnect(identity, generation));
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, identity: String, generation: u64) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let retry = self.retry;
        tokio::spawn(async move {
            for attempt in 0..retry.max_attempts() {
                let delay = retry.delay_for_attempt(attempt);
                match manager.upgrade() {
                    Some(manager) => {
                        let _ = manager.events.send(ConnectionEvent::ReconnectScheduled {
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                            generation,
                        });
                    }
                    None => return,
                }
                tokio::time::sleep(delay).await;

                let Some(manager) = manager.upgrade() else {
                    return;
                };
                {
                    let mut guard = manager.lock_inner();
                    if guard.generation != generation {
                        return;
                    }
                    guard.retry_count = attempt + 1;
                    manager.transition(&mut guard, ConnectionState::Connecting);
                }
                info!(identity = %identity, generation, attempt = attempt + 1, "connection: reconnecting");
                if manager.establish(&identity, generation).await {
                    manager.lock_inner().reconnect_task = None;
                    return;
                }
            }

            if let Some(manager) = manager.upgrade() {
                warn!(identity = %identity, generation, "connection: reconnect attempts exhausted");
                manager.lock_inner().reconnect_task = None;
                let _ = manager
                    .events
                    .send(ConnectionEvent::ReconnectExhausted { generation });
            }
        })
    }

    fn release(&self, guard: &mut ConnectionInner) {
        if let Some(task) = guard.reader_task.take() {
            task.abort();
        }
        if let Some(task) = guard.reconnect_task.take() {
            task.abort();
        }
        guard.outbound = None;
        if matches!(
            guard.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            self.transition(guard, ConnectionState::Closed);
        }
    }

    fn transition(&self, guard: &mut ConnectionInner, next: ConnectionState) {
        let from = guard.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            warn!(?from, to = ?next, "connection: rejected invalid state transition");
            return;
        }
        guard.state = next;
        let _ = self.events.send(ConnectionEvent::StateChanged {
            from,
            to: next,
            generation: guard.generation,
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }
        if let Some(task) = inner.reconnect_task.take() {
            task.abort();
        }
        inner.outbound = None;
    }
}

/// Production [`PushConnector`] speaking JSON text frames over a websocket at
/// `{websocket_url}/ws/{identity}`.
pub struct WebSocketConnector {
    websocket_url: String,
}

impl WebSocketConnector {
    pub fn new(websocket_url: impl Into<String>) -> Self {
        Self {
            websocket_url: websocket_url.into(),
        }
    }

    pub fn push_url(&self, identity: &str) -> Result<Url> {
        let mut url = Url::parse(&self.websocket_url)
            .with_context(|| format!("invalid websocket url: {}", self.websocket_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("websocket url cannot carry a path: {}", self.websocket_url))?
            .pop_if_empty()
            .push("ws")
            .push(identity);
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, identity: &str) -> Result<PushChannel> {
        let url = self.push_url(identity)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(frame)).await {
                    warn!(error = %err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(PushChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
