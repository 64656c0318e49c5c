//! Network Layer
//!
//! WebSocket server for the companion control surface.
//! Nothing here mutates simulation state directly; commands go through
//! `game::handoff`.

pub mod auth;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use auth::{
    AuthConfig, AuthError, JwtValidator, SessionAuthenticator, TokenClaims, TokenValidator,
    UpgradeParams,
};
pub use dispatcher::{
    handle_skin_command, CommandError, Connection, ConnectionHandler, DispatchContext,
};
pub use protocol::{AckStatus, ClientMessage, CommandMessage, ProtocolError, ServerMessage};
pub use registry::ClientRegistry;
pub use server::{BridgeServer, ServerConfig, ServerError};
pub use session::{ClientHandle, ClientId, ClientSession, SessionState};
pub use transport::{ChannelTransport, Outbound, Transport, TransportError, CLOSE_POLICY_VIOLATION};
