//! Entity Commands
//!
//! Work items produced by the network layer and executed on the
//! authoritative simulation thread.

/// Identity of a companion entity, as sent by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompanionId(pub String);

impl CompanionId {
    /// Create a companion id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CompanionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Skin change parameters.
///
/// Both values travel as complete strings; the simulation side decides
/// what a skin type means and how the path is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkinChange {
    /// Skin type ("default", "custom", ...).
    pub skin_type: String,
    /// Path to a skin file. Empty when not supplied.
    pub skin_path: String,
}

/// Commands understood by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityCommand {
    /// Change a companion's skin.
    Skin(SkinChange),
}

impl EntityCommand {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            EntityCommand::Skin(_) => "skin",
        }
    }
}

/// A command addressed to one companion.
///
/// Consumed by value on submission; nothing keeps it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Target entity.
    pub companion_id: CompanionId,
    /// What to do with it.
    pub command: EntityCommand,
}

impl CommandRequest {
    /// Build a skin change request.
    pub fn skin(
        companion_id: CompanionId,
        skin_type: impl Into<String>,
        skin_path: impl Into<String>,
    ) -> Self {
        Self {
            companion_id,
            command: EntityCommand::Skin(SkinChange {
                skin_type: skin_type.into(),
                skin_path: skin_path.into(),
            }),
        }
    }

    /// Wire name of the carried command.
    pub fn name(&self) -> &'static str {
        self.command.name()
    }
}
