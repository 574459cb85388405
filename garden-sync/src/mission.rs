//! Missions and their results
//!
//! A mission is bound at dispatch time to a snapshot of the user's marks and
//! a local/remote root pair. The engine folds one [`TileOutcome`] per handled
//! tile into a [`MissionReport`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::addressing::RegionContext;
use crate::grid::MarkSnapshot;
use crate::tile_state::TileSyncState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mission {
    /// Download everything for tiles marked to load
    LoadAll,
    /// Load tiles marked to load, refresh outdated files of tiles marked to sync
    SyncAll,
    /// Refresh objects of tiles whose terrain is current
    SyncObjects,
    /// Delete local terrain and objects of tiles marked to clear
    Clear,
}

impl Mission {
    pub fn label(self) -> &'static str {
        match self {
            Mission::LoadAll => "LOAD ALL",
            Mission::SyncAll => "SYNC ALL",
            Mission::SyncObjects => "SYNC OBJECTS",
            Mission::Clear => "CLEAR",
        }
    }

    /// Whether a tile carrying `mark` is handled by this mission
    pub fn handles(self, mark: TileSyncState) -> bool {
        match self {
            Mission::LoadAll => mark == TileSyncState::MarkLoad,
            Mission::SyncAll => matches!(mark, TileSyncState::MarkLoad | TileSyncState::MarkSync),
            Mission::SyncObjects => mark == TileSyncState::MarkSync,
            Mission::Clear => mark == TileSyncState::MarkClear,
        }
    }

    /// Mark applied when the user picks a tile whose last assessment is
    /// `assessed`; `None` when the tile cannot take part.
    pub fn pick_mark(self, assessed: TileSyncState) -> Option<TileSyncState> {
        if assessed == TileSyncState::Unusable {
            return None;
        }
        match self {
            Mission::SyncAll if assessed == TileSyncState::Orphan => Some(TileSyncState::MarkLoad),
            Mission::SyncAll => Some(TileSyncState::MarkSync),
            Mission::LoadAll => Some(TileSyncState::MarkLoad),
            Mission::SyncObjects => assessed.is_fresh().then_some(TileSyncState::MarkSync),
            Mission::Clear => Some(TileSyncState::MarkClear),
        }
    }

    /// Clearing is purely local
    pub fn needs_remote(self) -> bool {
        self != Mission::Clear
    }
}

impl std::fmt::Display for Mission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// How a mission ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionOutcome {
    Completed,
    Aborted,
    Crashed,
}

/// Aggregate counters of one mission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionReport {
    /// Tiles handled
    pub scanned: usize,
    /// Files written or deleted, folders removed and terrain stamps written
    pub updated: usize,
    /// Files downloaded
    pub downloads: usize,
    /// Remote or local failures absorbed while transferring
    pub errors: usize,
    /// Files or folders a clear could not remove
    pub incidents: usize,
    /// Tiles skipped without any transfer
    pub skipped: usize,
}

impl MissionReport {
    /// Fold one tile's result into the totals
    pub fn absorb(&mut self, outcome: &TileOutcome) {
        self.scanned += 1;
        match outcome {
            TileOutcome::Done(tally) => self.add(tally),
            TileOutcome::Skipped(_) => self.skipped += 1,
            TileOutcome::Failed { tally, .. } => {
                self.add(tally);
                self.errors += 1;
            }
        }
    }

    fn add(&mut self, tally: &TileTally) {
        self.updated += tally.updated;
        self.downloads += tally.downloads;
        self.errors += tally.errors;
        self.incidents += tally.incidents;
    }
}

/// Counters of one tile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileTally {
    pub updated: usize,
    pub downloads: usize,
    pub errors: usize,
    pub incidents: usize,
}

impl TileTally {
    pub fn merge(&mut self, other: TileTally) {
        self.updated += other.updated;
        self.downloads += other.downloads;
        self.errors += other.errors;
        self.incidents += other.incidents;
    }
}

/// Why a tile was passed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The tile does not exist on the mirror
    NotOnMirror,
    /// Terrain manifest missing, empty or malformed
    NoTerrain,
    /// Objects manifest missing, empty or malformed
    NoObjects,
    /// Terrain must be synced before its objects
    TerrainNotCurrent,
    /// Objects already match the mirror
    ObjectsCurrent,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::NotOnMirror => "not on mirror",
            SkipReason::NoTerrain => "no usable terrain manifest",
            SkipReason::NoObjects => "no usable objects manifest",
            SkipReason::TerrainNotCurrent => "terrain needs a global sync first",
            SkipReason::ObjectsCurrent => "objects up to date",
        };
        f.write_str(text)
    }
}

/// Result of handling one tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileOutcome {
    Done(TileTally),
    Skipped(SkipReason),
    /// Stopped by an error after `tally` was achieved
    Failed { tally: TileTally, error: String },
}

impl TileOutcome {
    pub fn updated(&self) -> usize {
        match self {
            TileOutcome::Done(tally) | TileOutcome::Failed { tally, .. } => tally.updated,
            TileOutcome::Skipped(_) => 0,
        }
    }

    /// Errors as counted into the report; a failed tile adds one of its own
    pub fn errors(&self) -> usize {
        match self {
            TileOutcome::Done(tally) => tally.errors,
            TileOutcome::Failed { tally, .. } => tally.errors + 1,
            TileOutcome::Skipped(_) => 0,
        }
    }
}

/// Everything the worker needs to run one mission
#[derive(Debug, Clone)]
pub struct MissionOrder {
    pub id: Uuid,
    pub mission: Mission,
    pub marks: MarkSnapshot,
    pub context: RegionContext,
    pub local_root: PathBuf,
    pub remote_root: Url,
}

impl MissionOrder {
    pub fn new(
        mission: Mission,
        marks: MarkSnapshot,
        context: RegionContext,
        local_root: impl Into<PathBuf>,
        remote_root: Url,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission,
            marks,
            context,
            local_root: local_root.into(),
            remote_root,
        }
    }

    /// Number of tiles this order will handle
    pub fn target_count(&self) -> usize {
        self.marks
            .marked()
            .filter(|(_, mark)| self.mission.handles(*mark))
            .count()
    }
}
