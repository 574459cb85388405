//! Per-region matrix of tile states
//!
//! Two matrices of the same dimension: the assessed state of every tile,
//! written by [`TileStateGrid::scan`], and the user's marks. Resetting the
//! marks never touches the last scan.

use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::addressing::{GridCell, RegionContext};
use crate::freshness::FreshnessAssessor;
use crate::tile_state::TileSyncState;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Matrix {
    dim: usize,
    cells: Vec<TileSyncState>,
}

impl Matrix {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            cells: vec![TileSyncState::Unknown; dim * dim],
        }
    }

    fn index(&self, cell: GridCell) -> Option<usize> {
        (cell.i < self.dim && cell.j < self.dim).then(|| cell.i * self.dim + cell.j)
    }

    fn get(&self, cell: GridCell) -> TileSyncState {
        self.index(cell)
            .map(|idx| self.cells[idx])
            .unwrap_or(TileSyncState::Unusable)
    }

    fn set(&mut self, cell: GridCell, state: TileSyncState) -> bool {
        match self.index(cell) {
            Some(idx) => {
                self.cells[idx] = state;
                true
            }
            None => false,
        }
    }

    fn fill(&mut self, state: TileSyncState) {
        self.cells.iter_mut().for_each(|c| *c = state);
    }
}

/// Read-only copy of the marks, handed to a mission at dispatch time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkSnapshot {
    matrix: Matrix,
}

impl MarkSnapshot {
    pub fn dim(&self) -> usize {
        self.matrix.dim
    }

    pub fn get(&self, cell: GridCell) -> TileSyncState {
        self.matrix.get(cell)
    }

    /// Marked cells in row-major order
    pub fn marked(&self) -> impl Iterator<Item = (GridCell, TileSyncState)> + '_ {
        let dim = self.matrix.dim;
        (0..dim)
            .flat_map(move |i| (0..dim).map(move |j| GridCell::new(i, j)))
            .map(|cell| (cell, self.get(cell)))
            .filter(|(_, state)| state.is_mark())
    }

    pub fn count(&self, mark: TileSyncState) -> usize {
        self.matrix.cells.iter().filter(|s| **s == mark).count()
    }
}

/// Assessed states and marks of every tile in the active region
#[derive(Debug, Clone)]
pub struct TileStateGrid {
    context: RegionContext,
    assessed: Matrix,
    marks: Matrix,
}

impl TileStateGrid {
    pub fn new(context: RegionContext) -> Self {
        let dim = context.dim();
        Self {
            context,
            assessed: Matrix::new(dim),
            marks: Matrix::new(dim),
        }
    }

    pub fn context(&self) -> &RegionContext {
        &self.context
    }

    pub fn dim(&self) -> usize {
        self.context.dim()
    }

    /// Assessed state of a cell; `Unusable` outside the grid
    pub fn state(&self, cell: GridCell) -> TileSyncState {
        self.assessed.get(cell)
    }

    pub fn set_state(&mut self, cell: GridCell, state: TileSyncState) {
        self.assessed.set(cell, state);
    }

    /// Current mark of a cell; `Unknown` when unmarked
    pub fn mark_of(&self, cell: GridCell) -> TileSyncState {
        self.marks.get(cell)
    }

    /// Classify every tile below `base` (a category root such as
    /// `<root>/Terrain`) and return the number of tiles that failed.
    ///
    /// A failing tile is set to `Error`; scanning always covers the whole
    /// region.
    pub async fn scan(&mut self, base: &Path, assessor: &FreshnessAssessor) -> usize {
        let now = Utc::now();
        let mut error_count = 0;

        for cell in self.context.cells() {
            let names = self
                .context
                .hecto_name(cell)
                .and_then(|hecto| Ok((hecto, self.context.tile_name(cell)?)));
            let (hecto, tile) = match names {
                Ok(names) => names,
                Err(_) => {
                    // Beyond the date line or a pole: no such tile.
                    self.assessed.set(cell, TileSyncState::Unusable);
                    continue;
                }
            };

            let state = match assessor.assess_tile(base, &hecto, &tile, now).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Failed to assess {}/{}: {}", hecto, tile, e);
                    error_count += 1;
                    TileSyncState::Error
                }
            };
            self.assessed.set(cell, state);
        }

        info!(
            "Scanned {} tiles below {} ({} errors)",
            self.dim() * self.dim(),
            base.display(),
            error_count
        );
        error_count
    }

    /// Set a mark unconditionally
    pub fn mark(&mut self, cell: GridCell, mark: TileSyncState) {
        self.marks.set(cell, mark);
    }

    /// Set `mark` on a cell, or clear it if the cell already carries it.
    /// Returns the resulting mark.
    pub fn toggle_mark(&mut self, cell: GridCell, mark: TileSyncState) -> TileSyncState {
        let next = if self.marks.get(cell) == mark {
            TileSyncState::Unknown
        } else {
            mark
        };
        if self.marks.set(cell, next) {
            debug!("Tile {} now {}", cell, next);
            next
        } else {
            TileSyncState::Unusable
        }
    }

    pub fn reset_marks(&mut self) {
        self.marks.fill(TileSyncState::Unknown);
    }

    pub fn reset_all(&mut self) {
        self.assessed.fill(TileSyncState::Unknown);
        self.marks.fill(TileSyncState::Unknown);
    }

    pub fn snapshot_marks(&self) -> MarkSnapshot {
        MarkSnapshot {
            matrix: self.marks.clone(),
        }
    }

    /// Number of cells holding `state` in the assessed matrix
    pub fn count(&self, state: TileSyncState) -> usize {
        self.assessed.cells.iter().filter(|s| **s == state).count()
    }
}
