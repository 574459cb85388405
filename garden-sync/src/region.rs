//! The active region and the user's selection on it
//!
//! At most one region is active at a time. Picking a tile applies the rule
//! of the pending mission to the tile's last assessment and toggles the
//! resulting mark.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use url::Url;

use crate::addressing::{GridCell, RegionBox, RegionContext};
use crate::engine::TERRAIN_DIR;
use crate::error::{Result, SyncError};
use crate::freshness::FreshnessAssessor;
use crate::grid::TileStateGrid;
use crate::manifest::airport_code;
use crate::mission::{Mission, MissionOrder};
use crate::tile_state::TileSyncState;

/// Result of the first scan of a local root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialScan {
    /// No Terrain folder yet; every tile stays `Unknown`
    FreshRepository,
    /// Every tile was assessed; `errors` of them failed
    Scanned { errors: usize },
}

pub struct RegionSession {
    dim: usize,
    board_pixels: u32,
    pending: Mission,
    grid: Option<TileStateGrid>,
}

impl RegionSession {
    pub fn new(dim: usize, board_pixels: u32) -> Self {
        Self {
            dim,
            board_pixels,
            pending: Mission::SyncAll,
            grid: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.grid.is_some()
    }

    /// Make `region` the active region with empty state and mark matrices
    pub fn activate(&mut self, region: RegionBox) -> Result<&RegionContext> {
        if self.grid.is_some() {
            return Err(SyncError::Region(
                "a region is already active; passivate it first".to_string(),
            ));
        }
        let context = RegionContext::for_board(region, self.dim, self.board_pixels)?;
        info!(
            "Activated region {}..{} x {}..{}",
            region.left, region.right, region.bottom, region.top
        );
        let grid = self.grid.insert(TileStateGrid::new(context));
        Ok(grid.context())
    }

    pub fn passivate(&mut self) {
        if self.grid.take().is_some() {
            debug!("Region passivated");
        }
    }

    pub fn grid(&self) -> Result<&TileStateGrid> {
        self.grid.as_ref().ok_or_else(no_region)
    }

    fn grid_mut(&mut self) -> Result<&mut TileStateGrid> {
        self.grid.as_mut().ok_or_else(no_region)
    }

    pub fn context(&self) -> Result<&RegionContext> {
        Ok(self.grid()?.context())
    }

    /// Assess every tile of the region from `<root>/Terrain`
    pub async fn initial_scan(
        &mut self,
        root: &Path,
        assessor: &FreshnessAssessor,
    ) -> Result<InitialScan> {
        let terrain = root.join(TERRAIN_DIR);
        let grid = self.grid_mut()?;

        match fs::metadata(&terrain).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SyncError::Config(format!(
                    "{} is not a directory",
                    terrain.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No terrain below {}: fresh repository", root.display());
                grid.reset_all();
                return Ok(InitialScan::FreshRepository);
            }
            Err(e) => return Err(SyncError::local_io(&terrain, e)),
        }

        grid.reset_all();
        let errors = grid.scan(&terrain, assessor).await;
        Ok(InitialScan::Scanned { errors })
    }

    pub fn pending(&self) -> Mission {
        self.pending
    }

    /// Choose the mission the next picks prepare. Switching drops the
    /// current selection.
    pub fn set_pending(&mut self, mission: Mission) {
        if mission != self.pending {
            if let Some(grid) = self.grid.as_mut() {
                grid.reset_marks();
            }
            self.pending = mission;
        }
    }

    /// Toggle the pending mission's mark on `cell`. Returns the cell's mark
    /// afterwards, or `None` when the tile cannot take part.
    pub fn pick(&mut self, cell: GridCell) -> Result<Option<TileSyncState>> {
        let pending = self.pending;
        let grid = self.grid_mut()?;
        if !grid.context().contains(cell) {
            return Err(SyncError::addressing(format!(
                "cell {} is outside the active region",
                cell
            )));
        }

        let Some(mark) = pending.pick_mark(grid.state(cell)) else {
            debug!("Tile {} ({}) cannot be picked for {}", cell, grid.state(cell), pending);
            return Ok(None);
        };
        Ok(Some(grid.toggle_mark(cell, mark)))
    }

    /// [`RegionSession::pick`] by board pixel
    pub fn pick_at(&mut self, u: f64, v: f64) -> Result<Option<TileSyncState>> {
        let cell = self.context()?.cell_at_screen(u, v)?;
        self.pick(cell)
    }

    pub fn clear_selection(&mut self) -> Result<()> {
        self.grid_mut()?.reset_marks();
        Ok(())
    }

    /// Marked tiles with their coordinates and folder names
    pub fn selection(&self) -> Result<Vec<(GridCell, TileSyncState, String)>> {
        let grid = self.grid()?;
        let context = grid.context();
        Ok(grid
            .snapshot_marks()
            .marked()
            .filter_map(|(cell, mark)| {
                let subpath = context.url_subpath(cell).ok()?;
                Some((cell, mark, subpath))
            })
            .collect())
    }

    pub fn log_selection(&self) -> Result<()> {
        let context = self.context()?;
        let selection = self.selection()?;
        info!("{} targets for {}", selection.len(), self.pending);
        for (cell, mark, subpath) in selection {
            let (lon, lat) = context.lon_lat(cell);
            info!("  {} at ({}, {}) lon {} lat {} -> {}", mark, cell.i, cell.j, lon, lat, subpath);
        }
        Ok(())
    }

    /// ICAO codes of the airport meshes in the tile's terrain folder
    pub async fn airports_in_tile(&self, root: &Path, cell: GridCell) -> Result<Vec<String>> {
        let grid = self.grid()?;
        if grid.state(cell) == TileSyncState::Orphan {
            return Ok(Vec::new());
        }
        let context = grid.context();
        let folder: PathBuf = root
            .join(TERRAIN_DIR)
            .join(context.hecto_name(cell)?)
            .join(context.tile_name(cell)?);

        let mut entries = match fs::read_dir(&folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::local_io(&folder, e)),
        };

        let mut codes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::local_io(&folder, e))?
        {
            if let Some(code) = entry.file_name().to_str().and_then(airport_code) {
                codes.push(code.to_string());
            }
        }
        codes.sort();
        Ok(codes)
    }

    /// Bind the current marks to a mission
    pub fn order(
        &self,
        mission: Mission,
        local_root: impl Into<PathBuf>,
        remote_root: Url,
    ) -> Result<MissionOrder> {
        let grid = self.grid()?;
        Ok(MissionOrder::new(
            mission,
            grid.snapshot_marks(),
            *grid.context(),
            local_root,
            remote_root,
        ))
    }
}

fn no_region() -> SyncError {
    SyncError::Region("no active region".to_string())
}
