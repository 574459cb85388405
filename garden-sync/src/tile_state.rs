//! Synchronization states of a tile

use serde::{Deserialize, Serialize};

/// What the gardener knows about one tile, or what the user asked for it.
///
/// The three `Mark*` variants are selections overlaid on an assessed state,
/// not states of the local data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileSyncState {
    /// Outside the world box, or an unrecognized code
    Unusable,
    /// Usable but not yet classified
    Unknown,
    /// Classification failed on a local IO error
    Error,
    /// No local trace of the tile
    Orphan,
    /// Data files present but no manifest to date them
    Populated,
    /// Manifest older than four gaps
    Fresh1,
    /// Manifest younger than four gaps
    Fresh2,
    /// Manifest younger than two gaps
    Fresh3,
    /// Manifest younger than one gap
    Fresh4,
    MarkClear,
    MarkSync,
    MarkLoad,
}

impl TileSyncState {
    /// Stable numeric code of the state
    pub fn code(self) -> i8 {
        match self {
            TileSyncState::Unusable => -1,
            TileSyncState::Unknown => 0,
            TileSyncState::Error => 1,
            TileSyncState::Orphan => 2,
            TileSyncState::Populated => 4,
            TileSyncState::Fresh1 => 5,
            TileSyncState::Fresh2 => 6,
            TileSyncState::Fresh3 => 7,
            TileSyncState::Fresh4 => 8,
            TileSyncState::MarkClear => 20,
            TileSyncState::MarkSync => 21,
            TileSyncState::MarkLoad => 22,
        }
    }

    /// State for a numeric code. Unrecognized codes map to `Unusable`.
    pub fn from_code(code: i8) -> Self {
        match code {
            0 => TileSyncState::Unknown,
            1 => TileSyncState::Error,
            2 => TileSyncState::Orphan,
            4 => TileSyncState::Populated,
            5 => TileSyncState::Fresh1,
            6 => TileSyncState::Fresh2,
            7 => TileSyncState::Fresh3,
            8 => TileSyncState::Fresh4,
            20 => TileSyncState::MarkClear,
            21 => TileSyncState::MarkSync,
            22 => TileSyncState::MarkLoad,
            _ => TileSyncState::Unusable,
        }
    }

    /// `FreshN` for a rank in 1..=4
    pub fn fresh(rank: u8) -> Self {
        match rank {
            1 => TileSyncState::Fresh1,
            2 => TileSyncState::Fresh2,
            3 => TileSyncState::Fresh3,
            4 => TileSyncState::Fresh4,
            _ => TileSyncState::Unusable,
        }
    }

    /// Freshness rank, for states carrying one
    pub fn freshness_rank(self) -> Option<u8> {
        match self {
            TileSyncState::Fresh1 => Some(1),
            TileSyncState::Fresh2 => Some(2),
            TileSyncState::Fresh3 => Some(3),
            TileSyncState::Fresh4 => Some(4),
            _ => None,
        }
    }

    pub fn is_fresh(self) -> bool {
        self.freshness_rank().is_some()
    }

    pub fn is_mark(self) -> bool {
        matches!(
            self,
            TileSyncState::MarkClear | TileSyncState::MarkSync | TileSyncState::MarkLoad
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TileSyncState::Unusable => "unusable",
            TileSyncState::Unknown => "unknown",
            TileSyncState::Error => "error",
            TileSyncState::Orphan => "orphan",
            TileSyncState::Populated => "populated",
            TileSyncState::Fresh1 => "fresh-1",
            TileSyncState::Fresh2 => "fresh-2",
            TileSyncState::Fresh3 => "fresh-3",
            TileSyncState::Fresh4 => "fresh-4",
            TileSyncState::MarkClear => "to-clear",
            TileSyncState::MarkSync => "to-sync",
            TileSyncState::MarkLoad => "to-load",
        }
    }
}

impl Default for TileSyncState {
    fn default() -> Self {
        TileSyncState::Unknown
    }
}

impl std::fmt::Display for TileSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
