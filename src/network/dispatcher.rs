//! Protocol Dispatcher
//!
//! Per-connection state machine. The transport layer feeds it four kinds
//! of events through [`ConnectionHandler`]; everything else (auth gate,
//! registry bookkeeping, routing, replies) happens here.
//!
//! ```text
//! Connecting ──auth ok──▶ Authenticated ──close/error──▶ Closed
//!      │                     ▲      │
//!      └──auth failed──▶ Closed     └─ each frame handled independently
//! ```

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::game::command::{CommandRequest, CompanionId};
use crate::game::handoff::{CommandHandoff, HandoffError};
use crate::network::auth::{SessionAuthenticator, UpgradeParams};
use crate::network::protocol::{
    ClientMessage, CommandMessage, ServerMessage, AUTH_FAILED_MESSAGE, SKIN_FAILED_MESSAGE,
    SKIN_UPDATED_MESSAGE,
};
use crate::network::registry::ClientRegistry;
use crate::network::session::{ClientId, ClientSession, SessionState};
use crate::network::transport::CLOSE_POLICY_VIOLATION;

/// Name of the skin change command.
pub const SKIN_COMMAND: &str = "skin";

/// Connection lifecycle events, delivered in order for one connection.
#[allow(async_fn_in_trait)]
pub trait ConnectionHandler {
    /// Transport opened. Returns the state after authentication.
    async fn on_connect(&mut self, params: &UpgradeParams) -> SessionState;

    /// One text frame arrived.
    async fn on_message(&mut self, text: &str);

    /// Peer or server closed the connection.
    async fn on_close(&mut self, code: u16, reason: &str);

    /// Transport failed.
    async fn on_error(&mut self, error: &(dyn std::error::Error + Send + Sync));
}

/// Command processing errors, reported as `success: false`.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A required parameter is empty.
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),
    /// The simulation thread did not accept the command.
    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Shared collaborators every connection needs.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Authentication gate.
    pub authenticator: SessionAuthenticator,
    /// Registry of authenticated clients.
    pub registry: ClientRegistry,
    /// Queue into the simulation thread.
    pub handoff: CommandHandoff,
}

/// Validate a skin change and hand it to the simulation thread.
///
/// `Ok` means the command was queued. The outcome on the simulation side
/// is never reported back.
pub fn handle_skin_command(
    handoff: &CommandHandoff,
    companion_id: &str,
    skin_type: &str,
    skin_path: &str,
) -> Result<(), CommandError> {
    if companion_id.is_empty() {
        return Err(CommandError::EmptyField("companionId"));
    }
    if skin_type.is_empty() {
        return Err(CommandError::EmptyField("skinType"));
    }

    handoff.submit(CommandRequest::skin(
        CompanionId::new(companion_id),
        skin_type,
        skin_path,
    ))?;
    Ok(())
}

/// One client connection.
pub struct Connection {
    session: ClientSession,
    state: SessionState,
    ctx: DispatchContext,
}

impl Connection {
    /// Wrap a freshly opened session.
    pub fn new(session: ClientSession, ctx: DispatchContext) -> Self {
        Self {
            session,
            state: SessionState::Connecting,
            ctx,
        }
    }

    /// Client identity.
    pub fn client_id(&self) -> ClientId {
        self.session.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Build the reply for one inbound frame.
    ///
    /// Never fails: every problem becomes an `error` or `command_result`
    /// envelope and the connection stays usable.
    pub fn dispatch(&self, text: &str) -> ServerMessage {
        match ClientMessage::from_json(text) {
            Ok(ClientMessage::Ping) => ServerMessage::pong_now(),
            Ok(ClientMessage::Command(cmd)) => self.handle_command(cmd),
            Err(e) => {
                warn!(client = %self.client_id(), error = %e, "Rejected message");
                ServerMessage::error(e.client_message())
            }
        }
    }

    fn handle_command(&self, cmd: CommandMessage) -> ServerMessage {
        info!(client = %self.client_id(), command = %cmd.command, "Command received");

        if cmd.command == SKIN_COMMAND {
            if let (Some(companion_id), Some(skin_type)) =
                (cmd.str_field("companionId"), cmd.str_field("skinType"))
            {
                let skin_path = cmd.str_field("skinPath").unwrap_or_default();
                let success = match handle_skin_command(&self.ctx.handoff, companion_id, skin_type, skin_path) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(client = %self.client_id(), error = %e, "Skin command failed");
                        false
                    }
                };
                let message = if success { SKIN_UPDATED_MESSAGE } else { SKIN_FAILED_MESSAGE };
                return ServerMessage::command_result(cmd.command, success, message);
            }
        }

        ServerMessage::command_ack(cmd.command)
    }

    /// Move to `Closed`, unregistering on the first call only.
    async fn shut_down(&mut self) {
        if self.state == SessionState::Closed {
            debug!(client = %self.client_id(), "Connection already closed");
            return;
        }

        let was_authenticated = self.state == SessionState::Authenticated;
        self.state = SessionState::Closed;
        if was_authenticated {
            self.ctx.registry.remove(&self.client_id()).await;
        }
    }
}

impl ConnectionHandler for Connection {
    async fn on_connect(&mut self, params: &UpgradeParams) -> SessionState {
        if self.state != SessionState::Connecting {
            warn!(client = %self.client_id(), state = ?self.state, "Duplicate connect event ignored");
            return self.state;
        }

        if !self.ctx.authenticator.authenticate(params) {
            self.session.send(&ServerMessage::error(AUTH_FAILED_MESSAGE)).await;
            self.session.close(CLOSE_POLICY_VIOLATION, AUTH_FAILED_MESSAGE).await;
            self.state = SessionState::Closed;
            info!(client = %self.client_id(), "Unauthenticated connection rejected");
            return self.state;
        }

        self.session.mark_authenticated();
        self.ctx
            .registry
            .add(self.client_id(), self.session.handle())
            .await;
        self.state = SessionState::Authenticated;
        self.session.send(&ServerMessage::connection(self.client_id())).await;

        info!(client = %self.client_id(), "Client connected");
        self.state
    }

    async fn on_message(&mut self, text: &str) {
        if self.state != SessionState::Authenticated {
            debug!(client = %self.client_id(), state = ?self.state, "Message outside authenticated state ignored");
            return;
        }

        let reply = self.dispatch(text);
        self.session.send(&reply).await;
    }

    async fn on_close(&mut self, code: u16, reason: &str) {
        info!(client = %self.client_id(), code, reason, "Connection closed");
        self.shut_down().await;
    }

    async fn on_error(&mut self, error: &(dyn std::error::Error + Send + Sync)) {
        error!(client = %self.client_id(), error = %error, "Connection error");
        self.shut_down().await;
    }
}
