//! # Companion Link Server
//!
//! Real-time channel between the companion simulation and its browser
//! control surface.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  COMPANION LINK SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/          - Connection tasks (one per client)       │
//! │  ├── server.rs     - Accept loop, WebSocket upgrade          │
//! │  ├── auth.rs       - Token gate on the upgrade request       │
//! │  ├── dispatcher.rs - Per-connection state machine, routing   │
//! │  ├── registry.rs   - Authenticated client directory          │
//! │  ├── session.rs    - Client identity and send handle         │
//! │  ├── transport.rs  - Send/close capability                   │
//! │  └── protocol.rs   - Envelope parsing and encoding           │
//! │                                                              │
//! │  game/             - Authoritative side                      │
//! │  ├── command.rs    - Entity commands                         │
//! │  ├── handoff.rs    - Queue onto the simulation thread        │
//! │  └── world.rs      - Companion state                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! Connection tasks run in parallel and never touch companion state.
//! Every mutation is queued through [`game::CommandHandoff`] and applied
//! on the single simulation thread, in submission order. Submitting is
//! fire-and-forget: a successful `command_result` means "queued".

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::{CommandHandoff, CommandRequest, CompanionId, CompanionWorld, spawn_simulation};
pub use network::{BridgeServer, ClientRegistry, ServerConfig, ServerMessage, SessionAuthenticator};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
