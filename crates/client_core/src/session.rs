//! Session-scoped wiring of connection, router and controller.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    backend::{ChatBackend, HttpChatBackend},
    config::ClientSettings,
    connection::{ConnectionManager, PushConnector, WebSocketConnector},
    controller::ConversationController,
    conversation::{ConversationState, SharedConversationState},
    router::EventRouter,
    ClientEvent,
};

/// Everything owned by one authenticated identity.
///
/// A different identity needs a new `Session`; dropping a session closes its
/// connection.
pub struct Session {
    identity: String,
    connection: Arc<ConnectionManager>,
    controller: ConversationController,
    state: SharedConversationState,
}

impl Session {
    /// Wires the engine for `identity` and opens its push channel.
    pub async fn start(
        settings: &ClientSettings,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn PushConnector>,
        identity: &str,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let state = ConversationState::shared(settings.dedup_window());
        let connection = ConnectionManager::new(connector, settings.retry_policy());
        connection.on_event(Arc::new(EventRouter::new(
            identity,
            state.clone(),
            events.clone(),
        )));
        let controller = ConversationController::new(
            identity,
            backend,
            connection.clone(),
            state.clone(),
            events,
            settings.request_timeout(),
        );

        connection.open(identity).await;
        info!(identity, state = ?connection.state(), "session: started");

        Self {
            identity: identity.to_string(),
            connection,
            controller,
            state,
        }
    }

    /// Logs in through `backend` and starts a session for the returned user.
    pub async fn login(
        settings: &ClientSettings,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn PushConnector>,
        username: &str,
    ) -> Result<Self> {
        let user = backend
            .login(username)
            .await
            .with_context(|| format!("login failed for {username}"))?;
        Ok(Self::start(settings, backend, connector, user.username.as_str()).await)
    }

    /// Production wiring: HTTP backend and websocket push channel.
    pub async fn connect(settings: &ClientSettings, username: &str) -> Result<Self> {
        let websocket_url = settings
            .resolved_websocket_url()
            .context("invalid websocket configuration")?;
        let backend = Arc::new(HttpChatBackend::new(settings.backend_url.clone()));
        let connector = Arc::new(WebSocketConnector::new(websocket_url));
        Self::login(settings, backend, connector, username).await
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn state(&self) -> &SharedConversationState {
        &self.state
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.controller.subscribe_events()
    }

    pub fn logout(self) {
        info!(identity = %self.identity, "session: logging out");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
