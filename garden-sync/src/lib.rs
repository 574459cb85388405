//! TerraSync tile gardener library
//!
//! Keeps a local copy of TerraSync scenery in step with a remote mirror,
//! one 1x1 degree tile at a time:
//! - Tile addressing on a square region grid
//! - Freshness assessment of local tile folders
//! - Remote manifests and content stamps
//! - Load, sync, object sync and clear missions
//! - A single background worker driven over channels

pub mod addressing;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod grid;
pub mod manifest;
pub mod mission;
pub mod progress;
pub mod region;
pub mod stamper;
pub mod tile_state;

// Re-export main types and functions
pub use addressing::{GridCell, RegionBox, RegionContext};
pub use config::GardenConfig;
pub use coordinator::{WorkerCoordinator, WorkerSettings, WorkerState};
pub use engine::{EngineOptions, MissionResult, SyncEngine};
pub use error::{Result, SyncError};
pub use freshness::FreshnessAssessor;
pub use grid::{MarkSnapshot, TileStateGrid};
pub use manifest::{Manifest, ManifestClient, ManifestEntry};
pub use mission::{Mission, MissionOrder, MissionOutcome, MissionReport};
pub use progress::{ProgressChannel, ProgressReporter, WorkerEvent};
pub use region::{InitialScan, RegionSession};
pub use stamper::{ContentStamper, Currency};
pub use tile_state::TileSyncState;

// Test modules
#[cfg(test)]
mod test_support;
#[cfg(test)]
mod engine_tests;
