//! Mission execution
//!
//! The engine walks the marked tiles of a [`MissionOrder`] in row-major
//! order and handles each one to completion before looking at the interrupt
//! check. Per-file and per-tile failures are absorbed into the mission
//! report; nothing short of an interrupt stops the walk.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;

use crate::addressing::{subpath_to_local, GridCell};
use crate::error::{Result, SyncError};
use crate::manifest::{airport_code, join_url, Manifest, ManifestClient, MANIFEST_FILE_NAME};
use crate::mission::{
    Mission, MissionOrder, MissionOutcome, MissionReport, SkipReason, TileOutcome, TileTally,
};
use crate::progress::ProgressReporter;
use crate::stamper::{
    file_is_current, ContentStamper, Currency, LOAD_FAILED_SENTINEL, SYNC_FAILED_SENTINEL,
};
use crate::tile_state::TileSyncState;

pub const TERRAIN_DIR: &str = "Terrain";
pub const OBJECTS_DIR: &str = "Objects";
pub const AIRPORTS_DIR: &str = "Airports";

/// Engine settings taken from the configuration
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub manifest_file_name: String,
    pub path_separator: char,
    /// Also delete the airports referenced by a cleared terrain folder
    pub clear_airports: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            manifest_file_name: MANIFEST_FILE_NAME.to_string(),
            path_separator: std::path::MAIN_SEPARATOR,
            clear_airports: false,
        }
    }
}

/// How a mission ended, with its counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionResult {
    pub outcome: MissionOutcome,
    pub report: MissionReport,
    pub notice: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    /// Download every listed file
    All,
    /// Skip files whose size and hash already match
    OutdatedOnly,
}

impl Transfer {
    fn failure_sentinel(self) -> &'static str {
        match self {
            Transfer::All => LOAD_FAILED_SENTINEL,
            Transfer::OutdatedOnly => SYNC_FAILED_SENTINEL,
        }
    }
}

/// Result of transferring one folder
#[derive(Debug, Default)]
struct Stage {
    tally: TileTally,
    failures: usize,
}

impl Stage {
    fn is_complete(&self) -> bool {
        self.failures == 0
    }
}

/// Remote and local locations of one tile
#[derive(Debug, Clone)]
struct TileSite {
    cell: GridCell,
    tile: String,
    url_subpath: String,
    local_subpath: PathBuf,
}

impl TileSite {
    fn locate(order: &MissionOrder, cell: GridCell, separator: char) -> Result<Self> {
        let tile = order.context.tile_name(cell)?;
        let url_subpath = order.context.url_subpath(cell)?;
        let local = subpath_to_local(&url_subpath, separator);
        Ok(Self {
            cell,
            tile,
            local_subpath: PathBuf::from(local.trim_start_matches(separator)),
            url_subpath,
        })
    }

    fn remote_folder(&self, root: &Url, category: &str) -> Result<Url> {
        join_url(root, &format!("{}{}", category, self.url_subpath))
    }

    fn local_folder(&self, root: &Path, category: &str) -> PathBuf {
        root.join(category).join(&self.local_subpath)
    }
}

/// `Airports/I/C/A` for the airport `ICAO`
fn airport_subpath(code: &str) -> Option<Vec<String>> {
    let chars: Vec<char> = code.chars().take(3).collect();
    (chars.len() == 3).then(|| chars.iter().map(|c| c.to_string()).collect())
}

/// Runs missions against one mirror
pub struct SyncEngine {
    client: ManifestClient,
    stamper: ContentStamper,
    options: EngineOptions,
    reporter: Option<ProgressReporter>,
}

impl SyncEngine {
    pub fn new(client: ManifestClient, stamper: ContentStamper, options: EngineOptions) -> Self {
        Self {
            client,
            stamper,
            options,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Execute `order`. `interrupted` is consulted after every handled tile;
    /// returning `true` ends the mission as aborted.
    pub async fn run<F>(&self, order: &MissionOrder, mut interrupted: F) -> MissionResult
    where
        F: FnMut() -> bool,
    {
        let mission = order.mission;
        let targets = order.target_count();
        info!(
            mission_id = %order.id,
            "Entering {} on {} tiles, {} <- {}",
            mission,
            targets,
            order.local_root.display(),
            order.remote_root
        );
        if let Some(reporter) = &self.reporter {
            deliver(reporter.mission_started(order.id, mission, targets).await);
        }

        let mut report = MissionReport::default();
        let mut aborted = false;

        for (cell, mark) in order.marks.marked() {
            if !mission.handles(mark) {
                continue;
            }
            let site = match TileSite::locate(order, cell, self.options.path_separator) {
                Ok(site) => site,
                Err(e) => {
                    debug!("Skipping cell {}: {}", cell, e);
                    continue;
                }
            };

            let outcome = self.handle_tile(order, &site, mark).await;
            match &outcome {
                TileOutcome::Done(tally) => debug!(
                    tile = %site.tile,
                    "Tile done: {} updates, {} downloads, {} errors",
                    tally.updated,
                    tally.downloads,
                    tally.errors
                ),
                TileOutcome::Skipped(reason) => info!(tile = %site.tile, "Tile skipped: {}", reason),
                TileOutcome::Failed { error, .. } => warn!(tile = %site.tile, "Tile failed: {}", error),
            }
            report.absorb(&outcome);
            if let Some(reporter) = &self.reporter {
                deliver(reporter
                    .tile_finished(&site.tile, outcome.updated(), outcome.errors())
                    .await);
            }

            if interrupted() {
                info!("Abort requested after tile {} ({}), returning", site.tile, site.cell);
                aborted = true;
                break;
            }
        }

        let outcome = if aborted {
            MissionOutcome::Aborted
        } else {
            match mission {
                Mission::LoadAll | Mission::SyncAll if report.updated == 0 => MissionOutcome::Crashed,
                _ => MissionOutcome::Completed,
            }
        };
        let notice = notice_for(mission, outcome, &report);
        info!(mission_id = %order.id, "Exiting {}: {}", mission, notice);

        if let Some(reporter) = &self.reporter {
            deliver(
                reporter
                    .mission_finished(mission, outcome, report.clone(), notice.clone())
                    .await,
            );
        }

        MissionResult {
            outcome,
            report,
            notice,
        }
    }

    async fn handle_tile(&self, order: &MissionOrder, site: &TileSite, mark: TileSyncState) -> TileOutcome {
        match (order.mission, mark) {
            (Mission::Clear, _) => {
                info!("Goal: CLEAR data for tile at {}", site.url_subpath);
                self.clear_tile(&order.local_root, site).await
            }
            (Mission::SyncObjects, _) => {
                info!("Goal: SYNC objects for tile at {}", site.url_subpath);
                self.sync_objects_tile(order, site).await
            }
            (_, TileSyncState::MarkLoad) => {
                info!("Goal: LOAD data for tile at {}", site.url_subpath);
                self.transfer_tile(order, site, Transfer::All).await
            }
            _ => {
                info!("Goal: SYNC data for tile at {}", site.url_subpath);
                self.transfer_tile(order, site, Transfer::OutdatedOnly).await
            }
        }
    }

    /// Terrain, then the airports it references, then objects
    async fn transfer_tile(&self, order: &MissionOrder, site: &TileSite, transfer: Transfer) -> TileOutcome {
        let mut tally = TileTally::default();

        let terrain_url = match site.remote_folder(&order.remote_root, TERRAIN_DIR) {
            Ok(url) => url,
            Err(e) => return failed(tally, e),
        };
        let terrain_dir = site.local_folder(&order.local_root, TERRAIN_DIR);
        let terrain = match self.fetch_usable_manifest(&terrain_url).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return TileOutcome::Skipped(SkipReason::NoTerrain),
            Err(e) if e.is_not_found() => return TileOutcome::Skipped(SkipReason::NotOnMirror),
            Err(e) => return failed(tally, e),
        };

        let stage = match self
            .transfer_folder(&terrain, &terrain_url, &terrain_dir, transfer)
            .await
        {
            Ok(stage) => stage,
            Err(e) => return failed(tally, e),
        };
        tally.merge(stage.tally);
        let terrain_complete = stage.is_complete();
        if !terrain_complete && transfer == Transfer::All {
            warn!(
                tile = %site.tile,
                "Terrain load incomplete ({} failures); airports and objects not loaded",
                stage.failures
            );
            return TileOutcome::Done(tally);
        }

        tally.merge(self.transfer_airports(order, &terrain, transfer).await);
        tally.merge(self.transfer_objects(order, site, transfer).await);

        let hash = if terrain_complete {
            terrain.signature()
        } else {
            transfer.failure_sentinel().to_string()
        };
        match self.stamper.write_stamp(&terrain_dir, &hash).await {
            Ok(()) if terrain_complete => {
                debug!(tile = %site.tile, "Terrain stamp updated");
                tally.updated += 1;
            }
            Ok(()) => warn!(tile = %site.tile, "Terrain sync incomplete; stamp left as witness"),
            Err(e) => {
                warn!(tile = %site.tile, "Unable to write terrain stamp: {}", e);
                tally.errors += 1;
            }
        }

        TileOutcome::Done(tally)
    }

    async fn transfer_objects(&self, order: &MissionOrder, site: &TileSite, transfer: Transfer) -> TileTally {
        let mut tally = TileTally::default();

        let objects_url = match site.remote_folder(&order.remote_root, OBJECTS_DIR) {
            Ok(url) => url,
            Err(e) => {
                warn!("Objects location: {}", e);
                tally.errors += 1;
                return tally;
            }
        };
        let manifest = match self.fetch_usable_manifest(&objects_url).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!(tile = %site.tile, "No usable objects manifest; objects skipped");
                return tally;
            }
            Err(e) if e.is_not_found() => {
                debug!(tile = %site.tile, "No objects on mirror");
                return tally;
            }
            Err(e) => {
                warn!(tile = %site.tile, "Objects manifest: {}", e);
                tally.errors += 1;
                return tally;
            }
        };

        let objects_dir = site.local_folder(&order.local_root, OBJECTS_DIR);
        match self
            .transfer_folder(&manifest, &objects_url, &objects_dir, transfer)
            .await
        {
            Ok(stage) => {
                tally.merge(stage.tally);
                let hash = if stage.is_complete() {
                    manifest.signature()
                } else {
                    warn!(tile = %site.tile, "Objects transfer incomplete ({} failures)", stage.failures);
                    transfer.failure_sentinel().to_string()
                };
                if let Err(e) = self.stamper.write_stamp(&objects_dir, &hash).await {
                    warn!(tile = %site.tile, "Unable to write objects stamp: {}", e);
                    tally.errors += 1;
                }
            }
            Err(e) => {
                warn!(tile = %site.tile, "Objects transfer: {}", e);
                tally.errors += 1;
            }
        }
        tally
    }

    /// Files of every airport whose mesh the terrain manifest lists
    async fn transfer_airports(&self, order: &MissionOrder, terrain: &Manifest, transfer: Transfer) -> TileTally {
        let mut tally = TileTally::default();

        for code in terrain.airport_codes() {
            let Some(parts) = airport_subpath(&code) else {
                continue;
            };
            let folder_url = match join_url(
                &order.remote_root,
                &format!("{}/{}", AIRPORTS_DIR, parts.join("/")),
            ) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Airport {} location: {}", code, e);
                    tally.errors += 1;
                    continue;
                }
            };
            let dest = parts
                .iter()
                .fold(order.local_root.join(AIRPORTS_DIR), |path, part| path.join(part));

            let manifest = match self.fetch_usable_manifest(&folder_url).await {
                Ok(Some(manifest)) => manifest,
                Ok(None) => {
                    debug!("No usable airport manifest at {}", folder_url);
                    continue;
                }
                Err(e) => {
                    warn!("Airport {} manifest: {}", code, e);
                    if !e.is_not_found() {
                        tally.errors += 1;
                    }
                    continue;
                }
            };

            if let Err(e) = fs::create_dir_all(&dest).await {
                warn!("Unable to create {}: {}", dest.display(), e);
                tally.errors += 1;
                continue;
            }

            let mut fetched = 0;
            for entry in manifest.files().iter().filter(|e| e.name.starts_with(&code)) {
                let target = dest.join(&entry.name);
                if transfer == Transfer::OutdatedOnly
                    && file_is_current(&target, entry.size().unwrap_or_default(), &entry.hash).await
                {
                    continue;
                }
                match self.download(&folder_url, &entry.name, &target).await {
                    Ok(_) => {
                        tally.downloads += 1;
                        tally.updated += 1;
                        fetched += 1;
                    }
                    Err(e) => {
                        warn!("Airport file {}: {}", entry.name, e);
                        tally.errors += 1;
                    }
                }
            }
            debug!("Airport {}: {} files downloaded", code, fetched);
        }
        tally
    }

    /// Download the files of `manifest` into `dest`, then keep a local copy
    /// of the manifest itself
    async fn transfer_folder(
        &self,
        manifest: &Manifest,
        folder_url: &Url,
        dest: &Path,
        transfer: Transfer,
    ) -> Result<Stage> {
        fs::create_dir_all(dest)
            .await
            .map_err(|e| SyncError::local_io(dest, e))?;

        let mut stage = Stage::default();
        let mut bytes = 0u64;
        let files = manifest.files();
        for entry in &files {
            let target = dest.join(&entry.name);
            if transfer == Transfer::OutdatedOnly
                && file_is_current(&target, entry.size().unwrap_or_default(), &entry.hash).await
            {
                continue;
            }
            match self.download(folder_url, &entry.name, &target).await {
                Ok(written) => {
                    bytes += written;
                    stage.tally.downloads += 1;
                    stage.tally.updated += 1;
                }
                Err(e) => {
                    warn!("Failed to fetch {}: {}", entry.name, e);
                    stage.tally.errors += 1;
                    stage.failures += 1;
                }
            }
        }

        let local_manifest = dest.join(&self.options.manifest_file_name);
        if let Err(e) = fs::write(&local_manifest, manifest.to_text()).await {
            warn!("Unable to write {}: {}", local_manifest.display(), e);
            stage.tally.errors += 1;
            stage.failures += 1;
        }

        debug!(
            "{} of {} files, {} bytes, copied to {}",
            stage.tally.downloads,
            files.len(),
            bytes,
            dest.display()
        );
        Ok(stage)
    }

    async fn download(&self, folder_url: &Url, name: &str, target: &Path) -> Result<u64> {
        let url = join_url(folder_url, name)?;
        let written = self.client.fetch_file(&url, target).await?;
        debug!("Downloaded {} ({} bytes)", name, written);
        if let Some(reporter) = &self.reporter {
            deliver(reporter.file_transferred(name).await);
        }
        Ok(written)
    }

    async fn fetch_usable_manifest(&self, folder_url: &Url) -> Result<Option<Manifest>> {
        let url = join_url(folder_url, &self.options.manifest_file_name)?;
        let manifest = self.client.fetch_manifest(&url).await?;
        if manifest.is_usable() {
            Ok(Some(manifest))
        } else {
            debug!("Unusable manifest at {}", url);
            Ok(None)
        }
    }

    /// Refresh objects of a tile whose terrain matches the mirror
    async fn sync_objects_tile(&self, order: &MissionOrder, site: &TileSite) -> TileOutcome {
        let tally = TileTally::default();

        let terrain_url = match site.remote_folder(&order.remote_root, TERRAIN_DIR) {
            Ok(url) => url,
            Err(e) => return failed(tally, e),
        };
        let terrain = match self.fetch_usable_manifest(&terrain_url).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return TileOutcome::Skipped(SkipReason::NoTerrain),
            Err(e) if e.is_not_found() => return TileOutcome::Skipped(SkipReason::NotOnMirror),
            Err(e) => return failed(tally, e),
        };
        let terrain_dir = site.local_folder(&order.local_root, TERRAIN_DIR);
        if self.stamper.check_currency(&terrain, &terrain_dir).await != Currency::Current {
            return TileOutcome::Skipped(SkipReason::TerrainNotCurrent);
        }

        let objects_url = match site.remote_folder(&order.remote_root, OBJECTS_DIR) {
            Ok(url) => url,
            Err(e) => return failed(tally, e),
        };
        let objects = match self.fetch_usable_manifest(&objects_url).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return TileOutcome::Skipped(SkipReason::NoObjects),
            Err(e) if e.is_not_found() => return TileOutcome::Skipped(SkipReason::NoObjects),
            Err(e) => return failed(tally, e),
        };
        let objects_dir = site.local_folder(&order.local_root, OBJECTS_DIR);
        if self.stamper.check_currency(&objects, &objects_dir).await == Currency::Current {
            return TileOutcome::Skipped(SkipReason::ObjectsCurrent);
        }

        let mut stage = match self
            .transfer_folder(&objects, &objects_url, &objects_dir, Transfer::OutdatedOnly)
            .await
        {
            Ok(stage) => stage,
            Err(e) => return failed(tally, e),
        };
        let hash = if stage.is_complete() {
            objects.signature()
        } else {
            SYNC_FAILED_SENTINEL.to_string()
        };
        if let Err(e) = self.stamper.write_stamp(&objects_dir, &hash).await {
            warn!(tile = %site.tile, "Unable to write objects stamp: {}", e);
            stage.tally.errors += 1;
        }
        if stage.tally.downloads == 0 {
            debug!(tile = %site.tile, "All {} object files up to date", objects.files().len());
        }
        TileOutcome::Done(stage.tally)
    }

    /// Delete local terrain and objects of a tile
    async fn clear_tile(&self, local_root: &Path, site: &TileSite) -> TileOutcome {
        let mut tally = TileTally::default();
        tally.merge(
            self.clear_folder(
                local_root,
                &site.local_folder(local_root, TERRAIN_DIR),
                self.options.clear_airports,
            )
            .await,
        );
        tally.merge(
            self.clear_folder(local_root, &site.local_folder(local_root, OBJECTS_DIR), false)
                .await,
        );
        TileOutcome::Done(tally)
    }

    /// Delete the regular files of `folder`, then the folder itself if
    /// nothing is left in it. Subfolders are never touched.
    async fn clear_folder(&self, local_root: &Path, folder: &Path, airports_too: bool) -> TileTally {
        let mut tally = TileTally::default();

        let (files, subfolders) = match list_folder(folder).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Nothing to clear at {}", folder.display());
                return tally;
            }
            Err(e) => {
                warn!("Unable to list {}: {}", folder.display(), e);
                tally.incidents += 1;
                return tally;
            }
        };

        let mut left_behind = subfolders;
        for path in files {
            if airports_too {
                let code = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(airport_code)
                    .map(str::to_string);
                if let Some(code) = code {
                    tally.merge(clear_airport(local_root, &code).await);
                }
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    tally.updated += 1;
                }
                Err(e) => {
                    warn!("Unable to delete {}: {}", path.display(), e);
                    left_behind += 1;
                    tally.incidents += 1;
                }
            }
        }

        if left_behind == 0 {
            match fs::remove_dir(folder).await {
                Ok(()) => {
                    debug!("Deleted folder {}", folder.display());
                    tally.updated += 1;
                }
                Err(e) => {
                    warn!("Unable to delete folder {}: {}", folder.display(), e);
                    tally.incidents += 1;
                }
            }
        }
        tally
    }
}

/// Regular files and number of subfolders in `folder`
async fn list_folder(folder: &Path) -> std::io::Result<(Vec<PathBuf>, usize)> {
    let mut files = Vec::new();
    let mut subfolders = 0;
    let mut entries = fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            subfolders += 1;
        } else {
            files.push(entry.path());
        }
    }
    Ok((files, subfolders))
}

/// Delete the files of airport `code` below `Airports/I/C/A`
async fn clear_airport(local_root: &Path, code: &str) -> TileTally {
    let mut tally = TileTally::default();
    let Some(parts) = airport_subpath(code) else {
        return tally;
    };
    let folder = parts
        .iter()
        .fold(local_root.join(AIRPORTS_DIR), |path, part| path.join(part));

    let (files, _) = match list_folder(&folder).await {
        Ok(listing) => listing,
        Err(e) => {
            debug!("No airport data for {}: {}", code, e);
            return tally;
        }
    };
    for path in files {
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(code));
        if !matches {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => tally.updated += 1,
            Err(e) => {
                warn!("Unable to delete airport file {}: {}", path.display(), e);
                tally.incidents += 1;
            }
        }
    }
    tally
}

fn failed(tally: TileTally, error: SyncError) -> TileOutcome {
    TileOutcome::Failed {
        tally,
        error: error.to_string(),
    }
}

fn deliver(result: Result<()>) {
    if let Err(e) = result {
        debug!("Progress not delivered: {}", e);
    }
}

fn notice_for(mission: Mission, outcome: MissionOutcome, report: &MissionReport) -> String {
    match (outcome, mission) {
        (MissionOutcome::Aborted, _) => format!(
            "{} aborted after {} tiles ({} updates)",
            mission, report.scanned, report.updated
        ),
        (_, Mission::Clear) if report.incidents > 0 => format!(
            "Clear completed with {} problems; see the log for details",
            report.incidents
        ),
        (_, Mission::Clear) => "Clear completed without problems".to_string(),
        (_, Mission::SyncObjects) if report.updated > 0 => {
            format!("Completed: {} object files updated", report.updated)
        }
        (_, Mission::SyncObjects) => "Completed: no object files needed an update".to_string(),
        (MissionOutcome::Crashed, _) => format!(
            "{} updated nothing on {} tiles ({} errors)",
            mission, report.scanned, report.errors
        ),
        _ => format!(
            "{} completed: {} updates on {} tiles ({} errors)",
            mission, report.updated, report.scanned, report.errors
        ),
    }
}
