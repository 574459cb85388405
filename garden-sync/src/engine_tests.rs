//! Mission scenarios against a scripted mirror

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use url::Url;

use crate::addressing::{GridCell, RegionBox, RegionContext};
use crate::engine::{EngineOptions, SyncEngine};
use crate::grid::TileStateGrid;
use crate::manifest::{Manifest, ManifestClient};
use crate::mission::{Mission, MissionOrder, MissionOutcome};
use crate::progress::{ProgressChannel, WorkerEvent};
use crate::stamper::{ContentStamper, Currency};
use crate::test_support::{manifest_text, ScriptedMirror};
use crate::tile_state::TileSyncState;

const ROOT: &str = "http://mirror.test/ws2";

/// Cell of w012n45 in a region anchored at (-20, 40)
const W012N45: GridCell = GridCell { i: 8, j: 5 };
/// Cell of w011n45
const W011N45: GridCell = GridCell { i: 9, j: 5 };

fn context() -> RegionContext {
    RegionContext::new(RegionBox::square(-20, 40, 46), 46, 16.0).unwrap()
}

fn engine(mirror: &Arc<ScriptedMirror>) -> SyncEngine {
    let client =
        ManifestClient::new(mirror.clone()).with_retry_delays(vec![Duration::from_millis(1); 3]);
    SyncEngine::new(client, ContentStamper::default(), EngineOptions::default())
}

fn order(mission: Mission, marks: &[(GridCell, TileSyncState)], root: &Path) -> MissionOrder {
    let mut grid = TileStateGrid::new(context());
    for (cell, mark) in marks {
        grid.mark(*cell, *mark);
    }
    MissionOrder::new(
        mission,
        grid.snapshot_marks(),
        context(),
        root,
        Url::parse(ROOT).unwrap(),
    )
}

/// Serve a manifest for `folder_path` (e.g. `Terrain/w020n40/w012n45`)
fn serve_manifest(mirror: &ScriptedMirror, folder_path: &str, files: &[(&str, &[u8])]) -> Manifest {
    let name = folder_path.rsplit('/').next().unwrap();
    let text = manifest_text(name, files);
    mirror.serve(&format!("{}/{}/.dirindex", ROOT, folder_path), text.clone());
    Manifest::from_text(&text)
}

fn serve_files(mirror: &ScriptedMirror, folder_path: &str, files: &[(&str, &[u8])]) {
    for (name, content) in files {
        mirror.serve(&format!("{}/{}/{}", ROOT, folder_path, name), content.to_vec());
    }
}

fn serve_folder(mirror: &ScriptedMirror, folder_path: &str, files: &[(&str, &[u8])]) -> Manifest {
    serve_files(mirror, folder_path, files);
    serve_manifest(mirror, folder_path, files)
}

fn local(root: &Path, folder_path: &str) -> PathBuf {
    folder_path
        .split('/')
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

fn write_local(root: &Path, folder_path: &str, files: &[(&str, &[u8])]) {
    let dir = local(root, folder_path);
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
}

const TERRAIN: &str = "Terrain/w020n40/w012n45";
const OBJECTS: &str = "Objects/w020n40/w012n45";

#[test_log::test(tokio::test)]
async fn test_load_all_fetches_terrain_airports_and_objects() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    let terrain_files: &[(&str, &[u8])] = &[
        ("3088961.btg.gz", b"mesh"),
        ("3088961.stg", b"stg"),
        ("EGLL.btg.gz", b"airport mesh"),
    ];
    let terrain = serve_folder(&mirror, TERRAIN, terrain_files);
    serve_files(
        &mirror,
        "Airports/E/G/L",
        &[("EGLL.ils.xml", b"ils"), ("EGLL.threshold.xml", b"thr")],
    );
    // EGLX shares the folder but is not referenced by this tile
    serve_manifest(
        &mirror,
        "Airports/E/G/L",
        &[
            ("EGLL.ils.xml", b"ils"),
            ("EGLL.threshold.xml", b"thr"),
            ("EGLX.twr.xml", b"twr"),
        ],
    );
    let objects = serve_folder(&mirror, OBJECTS, &[("church.xml", b"obj")]);

    let order = order(Mission::LoadAll, &[(W012N45, TileSyncState::MarkLoad)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.outcome, MissionOutcome::Completed);
    assert_eq!(result.report.scanned, 1);
    assert_eq!(result.report.downloads, 6);
    // Six files plus the terrain stamp
    assert_eq!(result.report.updated, 7);
    assert_eq!(result.report.errors, 0);

    let terrain_dir = local(temp.path(), TERRAIN);
    assert_eq!(std::fs::read(terrain_dir.join("3088961.btg.gz")).unwrap(), b"mesh");
    assert!(terrain_dir.join(".dirindex").is_file());
    assert!(local(temp.path(), "Airports/E/G/L/EGLL.ils.xml").is_file());
    assert!(!local(temp.path(), "Airports/E/G/L/EGLX.twr.xml").exists());
    assert_eq!(mirror.request_count(&format!("{}/Airports/E/G/L/EGLX.twr.xml", ROOT)), 0);

    let stamper = ContentStamper::default();
    assert_eq!(stamper.check_currency(&terrain, &terrain_dir).await, Currency::Current);
    assert_eq!(
        stamper.check_currency(&objects, &local(temp.path(), OBJECTS)).await,
        Currency::Current
    );
}

#[tokio::test]
async fn test_sync_all_with_current_files_only_restamps() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    let files: &[(&str, &[u8])] = &[
        ("3088961.btg.gz", b"one"),
        ("3088962.btg.gz", b"two"),
        ("3088963.btg.gz", b"three"),
    ];
    let terrain = serve_folder(&mirror, TERRAIN, files);
    write_local(temp.path(), TERRAIN, files);

    let order = order(Mission::SyncAll, &[(W012N45, TileSyncState::MarkSync)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.downloads, 0);
    assert_eq!(result.report.updated, 1);
    assert_eq!(result.outcome, MissionOutcome::Completed);
    assert!(mirror
        .requests()
        .iter()
        .all(|url| url.ends_with("/.dirindex")));

    let stamper = ContentStamper::default();
    assert_eq!(
        stamper.check_currency(&terrain, &local(temp.path(), TERRAIN)).await,
        Currency::Current
    );
}

#[tokio::test]
async fn test_sync_all_replaces_outdated_files() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    serve_folder(
        &mirror,
        TERRAIN,
        &[("3088961.btg.gz", b"new content"), ("3088962.btg.gz", b"same")],
    );
    write_local(
        temp.path(),
        TERRAIN,
        &[("3088961.btg.gz", b"old content"), ("3088962.btg.gz", b"same")],
    );

    let order = order(Mission::SyncAll, &[(W012N45, TileSyncState::MarkSync)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.downloads, 1);
    assert_eq!(result.report.updated, 2);
    assert_eq!(
        std::fs::read(local(temp.path(), TERRAIN).join("3088961.btg.gz")).unwrap(),
        b"new content"
    );
    assert_eq!(mirror.request_count(&format!("{}/{}/3088962.btg.gz", ROOT, TERRAIN)), 0);
}

#[tokio::test]
async fn test_load_all_terrain_not_found_skips_tile() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());
    serve_folder(&mirror, OBJECTS, &[("church.xml", b"obj")]);

    let order = order(Mission::LoadAll, &[(W012N45, TileSyncState::MarkLoad)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.updated, 0);
    assert_eq!(result.report.skipped, 1);
    assert_eq!(result.outcome, MissionOutcome::Crashed);
    assert!(mirror
        .requests()
        .iter()
        .all(|url| url.contains("/Terrain/")));
    assert!(!local(temp.path(), OBJECTS).exists());
}

#[tokio::test]
async fn test_load_all_unusable_terrain_skips_tile() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());
    mirror.serve(&format!("{}/{}/.dirindex", ROOT, TERRAIN), "path:w012n45\n");

    let order = order(Mission::LoadAll, &[(W012N45, TileSyncState::MarkLoad)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.updated, 0);
    assert_eq!(result.outcome, MissionOutcome::Crashed);
    assert_eq!(mirror.requests().len(), 1);
}

#[tokio::test]
async fn test_load_all_incomplete_terrain_stops_tile() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    serve_manifest(
        &mirror,
        TERRAIN,
        &[("3088961.btg.gz", b"mesh"), ("3088962.btg.gz", b"gone")],
    );
    serve_files(&mirror, TERRAIN, &[("3088961.btg.gz", b"mesh")]);
    serve_folder(&mirror, OBJECTS, &[("church.xml", b"obj")]);

    let order = order(Mission::LoadAll, &[(W012N45, TileSyncState::MarkLoad)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.downloads, 1);
    assert_eq!(result.report.updated, 1);
    assert_eq!(result.report.errors, 1);
    assert_eq!(result.outcome, MissionOutcome::Completed);
    assert!(!mirror.requests().iter().any(|url| url.contains("/Objects/")));
    assert!(!local(temp.path(), TERRAIN).join(".ZsyncStamp").exists());
}

#[tokio::test]
async fn test_sync_all_incomplete_objects_leave_sentinel() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    serve_folder(&mirror, TERRAIN, &[("3088961.btg.gz", b"mesh")]);
    let objects = serve_manifest(&mirror, OBJECTS, &[("church.xml", b"obj")]);

    let order = order(Mission::SyncAll, &[(W012N45, TileSyncState::MarkSync)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.errors, 1);
    assert_eq!(result.report.updated, 2);

    let objects_dir = local(temp.path(), OBJECTS);
    let stamp = std::fs::read_to_string(objects_dir.join(".ZsyncStamp")).unwrap();
    assert!(stamp.contains("<SYNC did not SUCCEED>"));
    assert_eq!(
        ContentStamper::default()
            .check_currency(&objects, &objects_dir)
            .await,
        Currency::Absent
    );
}

#[tokio::test]
async fn test_sync_objects_requires_current_terrain() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    serve_folder(&mirror, TERRAIN, &[("3088961.btg.gz", b"mesh")]);
    serve_folder(&mirror, OBJECTS, &[("church.xml", b"obj")]);

    let order = order(Mission::SyncObjects, &[(W012N45, TileSyncState::MarkSync)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.outcome, MissionOutcome::Completed);
    assert_eq!(result.report.scanned, 1);
    assert_eq!(result.report.skipped, 1);
    assert_eq!(result.report.updated, 0);
    assert!(!mirror.requests().iter().any(|url| url.contains("/Objects/")));
}

#[tokio::test]
async fn test_sync_objects_refreshes_then_skips() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    let terrain = serve_folder(&mirror, TERRAIN, &[("3088961.btg.gz", b"mesh")]);
    serve_folder(
        &mirror,
        OBJECTS,
        &[("church.xml", b"obj"), ("tower.xml", b"tower")],
    );
    write_local(temp.path(), OBJECTS, &[("tower.xml", b"tower")]);

    std::fs::create_dir_all(local(temp.path(), TERRAIN)).unwrap();
    ContentStamper::default()
        .write_stamp(&local(temp.path(), TERRAIN), &terrain.signature())
        .await
        .unwrap();

    let engine = engine(&mirror);
    let order = order(Mission::SyncObjects, &[(W012N45, TileSyncState::MarkSync)], temp.path());

    let first = engine.run(&order, || false).await;
    assert_eq!(first.outcome, MissionOutcome::Completed);
    assert_eq!(first.report.downloads, 1);
    assert_eq!(first.report.updated, 1);
    assert_eq!(mirror.request_count(&format!("{}/{}/tower.xml", ROOT, OBJECTS)), 0);

    let second = engine.run(&order, || false).await;
    assert_eq!(second.outcome, MissionOutcome::Completed);
    assert_eq!(second.report.skipped, 1);
    assert_eq!(second.report.downloads, 0);
    assert!(second.notice.contains("no object files"));
}

#[tokio::test]
async fn test_clear_removes_files_and_folders() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    write_local(
        temp.path(),
        TERRAIN,
        &[("3088961.btg.gz", b"mesh"), (".dirindex", b"x"), (".ZsyncStamp", b"y")],
    );
    write_local(temp.path(), OBJECTS, &[("church.xml", b"obj")]);
    write_local(temp.path(), "Airports/E/G/L", &[("EGLL.ils.xml", b"ils")]);

    let order = order(
        Mission::Clear,
        &[
            (W012N45, TileSyncState::MarkClear),
            (W011N45, TileSyncState::MarkClear),
        ],
        temp.path(),
    );
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.outcome, MissionOutcome::Completed);
    assert_eq!(result.report.scanned, 2);
    // Four files and two folders
    assert_eq!(result.report.updated, 6);
    assert_eq!(result.report.incidents, 0);
    assert!(!local(temp.path(), TERRAIN).exists());
    assert!(!local(temp.path(), OBJECTS).exists());
    assert!(local(temp.path(), "Terrain/w020n40").is_dir());
    assert!(local(temp.path(), "Airports/E/G/L/EGLL.ils.xml").exists());
    assert!(mirror.requests().is_empty());
}

#[tokio::test]
async fn test_clear_keeps_folder_with_subfolders() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    write_local(temp.path(), TERRAIN, &[("3088961.btg.gz", b"mesh")]);
    std::fs::create_dir_all(local(temp.path(), TERRAIN).join("extra")).unwrap();

    let order = order(Mission::Clear, &[(W012N45, TileSyncState::MarkClear)], temp.path());
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.updated, 1);
    assert_eq!(result.report.incidents, 0);
    assert!(local(temp.path(), TERRAIN).join("extra").is_dir());
}

#[tokio::test]
async fn test_clear_airports_when_enabled() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    write_local(temp.path(), TERRAIN, &[("EGLL.btg.gz", b"mesh")]);
    write_local(
        temp.path(),
        "Airports/E/G/L",
        &[("EGLL.ils.xml", b"ils"), ("EGLX.twr.xml", b"twr")],
    );

    let client =
        ManifestClient::new(mirror.clone()).with_retry_delays(vec![Duration::from_millis(1); 3]);
    let engine = SyncEngine::new(
        client,
        ContentStamper::default(),
        EngineOptions {
            clear_airports: true,
            ..EngineOptions::default()
        },
    );
    let order = order(Mission::Clear, &[(W012N45, TileSyncState::MarkClear)], temp.path());
    let result = engine.run(&order, || false).await;

    assert_eq!(result.report.incidents, 0);
    assert!(!local(temp.path(), "Airports/E/G/L/EGLL.ils.xml").exists());
    assert!(local(temp.path(), "Airports/E/G/L/EGLX.twr.xml").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_clear_with_undeletable_file_continues() {
    use std::os::unix::fs::PermissionsExt;

    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    write_local(temp.path(), TERRAIN, &[("3088961.btg.gz", b"mesh")]);
    write_local(temp.path(), "Terrain/w020n40/w011n45", &[("3088970.btg.gz", b"mesh")]);
    let locked = local(temp.path(), TERRAIN);
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

    let order = order(
        Mission::Clear,
        &[
            (W012N45, TileSyncState::MarkClear),
            (W011N45, TileSyncState::MarkClear),
        ],
        temp.path(),
    );
    let result = engine(&mirror).run(&order, || false).await;
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(result.outcome, MissionOutcome::Completed);
    assert!(result.report.incidents > 0);
    assert!(locked.join("3088961.btg.gz").exists());
    assert!(!local(temp.path(), "Terrain/w020n40/w011n45").exists());
    assert!(result.notice.contains("problems"));
}

#[tokio::test]
async fn test_abort_stops_after_current_tile() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    // (3, 3) and (3, 4) are w017n43 and w017n44
    write_local(temp.path(), "Terrain/w020n40/w017n43", &[("a.btg.gz", b"a")]);
    write_local(temp.path(), "Terrain/w020n40/w017n44", &[("b.btg.gz", b"b")]);

    let order = order(
        Mission::Clear,
        &[
            (GridCell::new(3, 3), TileSyncState::MarkClear),
            (GridCell::new(3, 4), TileSyncState::MarkClear),
        ],
        temp.path(),
    );

    let mut checks = 0;
    let result = engine(&mirror)
        .run(&order, || {
            checks += 1;
            true
        })
        .await;

    assert_eq!(checks, 1);
    assert_eq!(result.outcome, MissionOutcome::Aborted);
    assert_eq!(result.report.scanned, 1);
    assert_eq!(result.report.updated, 2);
    assert!(!local(temp.path(), "Terrain/w020n40/w017n43").exists());
    assert!(local(temp.path(), "Terrain/w020n40/w017n44/b.btg.gz").exists());
}

#[tokio::test]
async fn test_unmatched_and_unusable_cells_are_ignored() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());

    let east = RegionContext::new(RegionBox::square(144, 0, 46), 46, 16.0).unwrap();
    let mut grid = TileStateGrid::new(east);
    // lon 180 does not exist
    grid.mark(GridCell::new(36, 0), TileSyncState::MarkClear);
    // wrong mark for this mission
    grid.mark(GridCell::new(0, 0), TileSyncState::MarkLoad);

    let order = MissionOrder::new(
        Mission::Clear,
        grid.snapshot_marks(),
        east,
        temp.path(),
        Url::parse(ROOT).unwrap(),
    );
    let result = engine(&mirror).run(&order, || false).await;

    assert_eq!(result.report.scanned, 0);
    assert_eq!(result.outcome, MissionOutcome::Completed);
}

#[tokio::test]
async fn test_progress_events() {
    let temp = TempDir::new().unwrap();
    let mirror = Arc::new(ScriptedMirror::new());
    serve_folder(&mirror, TERRAIN, &[("3088961.btg.gz", b"mesh")]);

    let (reporter, mut channel) = ProgressChannel::new();
    let engine = engine(&mirror).with_reporter(reporter);
    let order = order(Mission::LoadAll, &[(W012N45, TileSyncState::MarkLoad)], temp.path());
    let result = engine.run(&order, || false).await;
    drop(engine);

    let mut events = Vec::new();
    while let Some(event) = channel.recv().await {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(WorkerEvent::MissionStarted { targets: 1, .. })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkerEvent::Progress { transferred: 1, .. })));
    match events.last() {
        Some(WorkerEvent::MissionFinished {
            mission_id,
            outcome,
            report,
            ..
        }) => {
            assert_eq!(*mission_id, order.id);
            assert_eq!(*outcome, result.outcome);
            assert_eq!(report, &result.report);
        }
        other => panic!("Expected MissionFinished, got {:?}", other),
    }
}
