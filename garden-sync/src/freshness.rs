//! Freshness assessment of local tile folders
//!
//! A tile folder is classified from what it holds: nothing relevant
//! (orphan), data files without a manifest (populated), or a manifest whose
//! age ranks the tile from `Fresh1` (stale) to `Fresh4`.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::tile_state::TileSyncState;

pub const DEFAULT_GAP_DAYS: u32 = 90;
pub const MIN_GAP_DAYS: u32 = 10;

/// Terrain data files whose presence marks a folder as populated
pub const DATA_FILE_PATTERN: &str = "*.btg.gz";

/// Rank a manifest of `age_days` against `gap_days`.
///
/// Younger than one gap gives 4, than two gaps 3, than four gaps 2;
/// anything older is 1.
pub fn rank(age_days: i64, gap_days: u32) -> u8 {
    let mut threshold = gap_days as i64;
    for rank in (2..=4u8).rev() {
        if age_days < threshold {
            return rank;
        }
        threshold = threshold.saturating_mul(2);
    }
    1
}

/// Parse a configured gap. Values below the floor are raised to it;
/// anything unparsable gives the default.
pub fn parse_gap(raw: &str) -> u32 {
    match raw.trim().parse::<i64>() {
        Ok(days) if days > MIN_GAP_DAYS as i64 => days.min(u32::MAX as i64) as u32,
        Ok(_) => MIN_GAP_DAYS,
        Err(_) => DEFAULT_GAP_DAYS,
    }
}

/// Whole days elapsed between `modified` and `now`, never negative
pub fn age_in_days(modified: SystemTime, now: DateTime<Utc>) -> i64 {
    let modified: DateTime<Utc> = modified.into();
    (now - modified).num_days().max(0)
}

/// Classifies tile folders below a category root
#[derive(Debug, Clone)]
pub struct FreshnessAssessor {
    gap_days: u32,
    manifest_name: String,
    data_files: GlobSet,
}

impl FreshnessAssessor {
    pub fn new(gap_days: u32, manifest_name: impl Into<String>) -> Result<Self> {
        let glob = Glob::new(DATA_FILE_PATTERN)
            .map_err(|e| SyncError::Config(format!("invalid data file pattern: {}", e)))?;
        let data_files = GlobSetBuilder::new()
            .add(glob)
            .build()
            .map_err(|e| SyncError::Config(format!("invalid data file pattern: {}", e)))?;

        Ok(Self {
            gap_days,
            manifest_name: manifest_name.into(),
            data_files,
        })
    }

    pub fn gap_days(&self) -> u32 {
        self.gap_days
    }

    pub fn is_data_file(&self, file_name: &str) -> bool {
        self.data_files.is_match(file_name)
    }

    /// Classify `<root>/<hecto>/<tile>`.
    ///
    /// Missing folders are not errors; any other IO failure is returned so
    /// the caller can flag the tile.
    pub async fn assess_tile(
        &self,
        root: &Path,
        hecto: &str,
        tile: &str,
        now: DateTime<Utc>,
    ) -> std::io::Result<TileSyncState> {
        let hecto_dir = root.join(hecto);
        if !is_dir(&hecto_dir).await? {
            return Ok(TileSyncState::Orphan);
        }

        let tile_dir = hecto_dir.join(tile);
        if !is_dir(&tile_dir).await? {
            return Ok(TileSyncState::Orphan);
        }

        let manifest = tile_dir.join(&self.manifest_name);
        match fs::metadata(&manifest).await {
            Ok(meta) if meta.is_file() => {
                let age = age_in_days(meta.modified()?, now);
                let state = TileSyncState::fresh(rank(age, self.gap_days));
                debug!(tile, age, %state, "Assessed tile from manifest age");
                Ok(state)
            }
            Ok(_) => self.assess_residues(&tile_dir).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.assess_residues(&tile_dir).await
            }
            Err(e) => Err(e),
        }
    }

    async fn assess_residues(&self, tile_dir: &Path) -> std::io::Result<TileSyncState> {
        let mut entries = fs::read_dir(tile_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if self.is_data_file(name) {
                    return Ok(TileSyncState::Populated);
                }
            }
        }
        Ok(TileSyncState::Orphan)
    }
}

async fn is_dir(path: &Path) -> std::io::Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
