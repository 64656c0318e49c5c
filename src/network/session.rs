//! Client Sessions
//!
//! The live state of one connected client. A session exists for exactly
//! one transport connection and is never persisted.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::network::protocol::ServerMessage;
use crate::network::transport::{Transport, TransportError};

/// Unique client identifier, assigned at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, credential not yet checked.
    Connecting,
    /// Credential accepted; frames are dispatched.
    Authenticated,
    /// Terminal.
    Closed,
}

/// Handle through which other components reach a client.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("open", &self.transport.is_open())
            .finish()
    }
}

impl ClientHandle {
    /// Client this handle belongs to.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether the underlying connection still accepts frames.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Serialize and write one envelope, waiting for buffer space.
    pub async fn send(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let text = msg.to_json()?;
        self.transport.send_text(text).await
    }
}

/// One connected client.
pub struct ClientSession {
    handle: ClientHandle,
    authenticated: bool,
    created_at: DateTime<Utc>,
}

impl ClientSession {
    /// Create an unauthenticated session with a fresh id.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_id(ClientId::new_v4(), transport)
    }

    /// Create an unauthenticated session with a known id.
    pub fn with_id(id: ClientId, transport: Arc<dyn Transport>) -> Self {
        Self {
            handle: ClientHandle { id, transport },
            authenticated: false,
            created_at: Utc::now(),
        }
    }

    /// Client identity.
    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    /// Handle for registry use.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Whether the credential was accepted.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record a successful authentication.
    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// When the connection was accepted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Write one envelope, logging failures.
    ///
    /// Returns whether the write succeeded. A failed write does not close
    /// the session; transport close/error events do that.
    pub async fn send(&self, msg: &ServerMessage) -> bool {
        match self.handle.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                error!(client = %self.id(), error = %e, "Failed to send message");
                false
            }
        }
    }

    /// Close the transport, logging failures.
    pub async fn close(&self, code: u16, reason: &str) {
        if let Err(e) = self.handle.transport.close(code, reason).await {
            error!(client = %self.id(), error = %e, "Failed to close connection");
        }
    }
}
