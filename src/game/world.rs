//! Companion World
//!
//! Minimal authoritative companion state. Owned by the simulation thread
//! and mutated only through [`CommandExecutor::execute`].

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::game::command::{CommandRequest, CompanionId, EntityCommand, SkinChange};
use crate::game::handoff::CommandExecutor;

/// Skin type that requires a file path.
pub const CUSTOM_SKIN_TYPE: &str = "custom";

/// Per-companion state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionState {
    /// Currently applied skin.
    pub skin: SkinChange,
    /// When the skin last changed.
    pub skin_changed_at: Option<DateTime<Utc>>,
}

impl Default for CompanionState {
    fn default() -> Self {
        Self {
            skin: SkinChange {
                skin_type: "default".to_string(),
                skin_path: String::new(),
            },
            skin_changed_at: None,
        }
    }
}

/// Outcome counters, useful for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldStats {
    /// Commands that changed state.
    pub applied: u64,
    /// Commands dropped (unknown companion, invalid parameters).
    pub rejected: u64,
}

/// All companions known to the simulation.
#[derive(Debug, Default)]
pub struct CompanionWorld {
    companions: BTreeMap<CompanionId, CompanionState>,
    stats: WorldStats,
}

impl CompanionWorld {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a world with the given companions in their default state.
    pub fn with_companions<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = CompanionId>,
    {
        let mut world = Self::new();
        for id in ids {
            world.spawn(id);
        }
        world
    }

    /// Add a companion. Returns false if it already existed.
    pub fn spawn(&mut self, id: CompanionId) -> bool {
        if self.companions.contains_key(&id) {
            return false;
        }
        self.companions.insert(id, CompanionState::default());
        true
    }

    /// Look up a companion.
    pub fn companion(&self, id: &CompanionId) -> Option<&CompanionState> {
        self.companions.get(id)
    }

    /// Number of companions.
    pub fn companion_count(&self) -> usize {
        self.companions.len()
    }

    /// Outcome counters.
    pub fn stats(&self) -> WorldStats {
        self.stats
    }

    fn apply_skin(&mut self, id: &CompanionId, change: SkinChange) -> bool {
        let Some(companion) = self.companions.get_mut(id) else {
            warn!(companion = %id, "Skin change for unknown companion ignored");
            return false;
        };

        if change.skin_type == CUSTOM_SKIN_TYPE && change.skin_path.is_empty() {
            warn!(companion = %id, "Custom skin without a path ignored");
            return false;
        }

        info!(
            companion = %id,
            skin_type = %change.skin_type,
            skin_path = %change.skin_path,
            "Companion skin changed"
        );
        companion.skin = change;
        companion.skin_changed_at = Some(Utc::now());
        true
    }
}

impl CommandExecutor for CompanionWorld {
    fn execute(&mut self, request: CommandRequest) {
        let applied = match request.command {
            EntityCommand::Skin(change) => self.apply_skin(&request.companion_id, change),
        };

        if applied {
            self.stats.applied += 1;
        } else {
            self.stats.rejected += 1;
        }
    }
}
