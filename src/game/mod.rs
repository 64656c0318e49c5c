//! Game Side
//!
//! Everything that runs on, or feeds, the authoritative simulation thread.
//!
//! ## Module Structure
//!
//! - `command`: Commands addressed to companion entities
//! - `handoff`: Cross-thread submission onto the simulation thread
//! - `world`: Default in-memory companion state

pub mod command;
pub mod handoff;
pub mod world;

// Re-export key types
pub use command::{CommandRequest, CompanionId, EntityCommand, SkinChange};
pub use handoff::{
    command_channel, spawn_simulation, CommandExecutor, CommandHandoff, CommandQueue,
    HandoffError, SimulationThread,
};
pub use world::{CompanionState, CompanionWorld, WorldStats};
