//! Connection Transport
//!
//! The send/close capability of a single connection. The dispatcher only
//! sees [`Transport`]; the server backs it with a channel drained by a
//! per-connection writer task.

use std::sync::atomic::{AtomicBool, Ordering};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

/// WebSocket close code for policy violations (RFC 6455).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Transport errors. Logged by callers, never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection already closed.
    #[error("connection closed")]
    Closed,
    /// Envelope could not be serialized.
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Send/close capability of one connection.
///
/// Writes wait while the connection's outbound buffer is full, so frames
/// are never dropped and keep the order they were written in.
pub trait Transport: Send + Sync {
    /// Write one text frame.
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Close with a status code and reason. Further sends fail.
    fn close(&self, code: u16, reason: &str) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Whether the connection still accepts frames.
    fn is_open(&self) -> bool;
}

/// Frames queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Close frame; the writer stops after sending it.
    Close {
        /// Status code.
        code: u16,
        /// Reason string.
        reason: String,
    },
}

/// Channel-backed transport.
///
/// The channel is bounded; a full channel makes the writer wait for the
/// socket task instead of failing. Only a closed channel is an error.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer task drains.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    async fn push(&self, frame: Outbound) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

impl Transport for ChannelTransport {
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            self.push(Outbound::Text(text)).await
        })
    }

    fn close(&self, code: u16, reason: &str) -> BoxFuture<'_, Result<(), TransportError>> {
        let frame = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.push(frame).await
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}
