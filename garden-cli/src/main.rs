use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use garden_core::{FixedSource, MirrorClientBuilder, SourceDiscovery};
use garden_sync::addressing::{hecto_name, parse_tile_name, tile_name, url_subpath};
use garden_sync::manifest::join_url;
use garden_sync::{
    ContentStamper, FreshnessAssessor, GardenConfig, InitialScan, ManifestClient, Mission,
    MissionOutcome, RegionBox, RegionSession, SyncEngine, TileSyncState, WorkerCoordinator,
    WorkerEvent,
};
use tracing::{info, warn};
use url::Url;

mod logging;

#[derive(Parser)]
#[command(name = "gardener")]
#[command(about = "Keep a local TerraSync scenery tree in step with a mirror")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assess the local tiles of a region
    Scan {
        #[command(flatten)]
        region: RegionArgs,
    },
    /// Run a mission on the given tiles
    Run {
        #[arg(value_enum)]
        mission: MissionArg,
        #[command(flatten)]
        region: RegionArgs,
        /// Tile to pick, e.g. w012n45; repeat for more
        #[arg(short, long = "tile", required = true)]
        tiles: Vec<String>,
        /// Mirror base URL, overriding the configuration
        #[arg(long)]
        server: Option<String>,
        /// Print worker events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the folder names of the tile at a coordinate
    Names {
        #[arg(long, allow_negative_numbers = true)]
        lon: i32,
        #[arg(long, allow_negative_numbers = true)]
        lat: i32,
    },
    /// List a remote folder, e.g. Terrain/w020n40/w012n45
    Browse {
        subpath: String,
        #[arg(long)]
        server: Option<String>,
    },
    /// Write a configuration file with every default spelled out
    InitConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RegionArgs {
    /// Local TerraSync root
    #[arg(short, long)]
    root: PathBuf,
    /// West edge of the region; centred on the first tile when omitted
    #[arg(long, allow_negative_numbers = true)]
    left: Option<i32>,
    /// South edge of the region
    #[arg(long, allow_negative_numbers = true)]
    bottom: Option<i32>,
}

impl RegionArgs {
    fn region(&self, dim: usize, anchor: Option<(i32, i32)>) -> Result<RegionBox> {
        let span = dim as i32;
        let (left, bottom) = match (self.left, self.bottom, anchor) {
            (Some(left), Some(bottom), _) => (left, bottom),
            (left, bottom, Some((lon, lat))) => (
                left.unwrap_or_else(|| (lon - span / 2).clamp(-190, 190 - span)),
                bottom.unwrap_or_else(|| (lat - span / 2).clamp(-90, 90 - span)),
            ),
            _ => bail!("--left and --bottom are required"),
        };
        Ok(RegionBox::square(left, bottom, dim))
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MissionArg {
    Load,
    Sync,
    SyncObjects,
    Clear,
}

impl From<MissionArg> for Mission {
    fn from(arg: MissionArg) -> Self {
        match arg {
            MissionArg::Load => Mission::LoadAll,
            MissionArg::Sync => Mission::SyncAll,
            MissionArg::SyncObjects => Mission::SyncObjects,
            MissionArg::Clear => Mission::Clear,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(GardenConfig::default_path);
    let config = GardenConfig::load(&config_path)
        .await
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    config.validate()?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.log_level);
    let _guard = logging::init_logging(log_level, config.logging.log_dir.as_deref())?;

    match cli.command {
        Commands::Scan { region } => scan(&config, region).await,
        Commands::Run {
            mission,
            region,
            tiles,
            server,
            json,
        } => run(&config, mission.into(), region, tiles, server, json).await,
        Commands::Names { lon, lat } => {
            println!("tile:    {}", tile_name(lon, lat)?);
            println!("folder:  {}", hecto_name(lon, lat)?);
            println!("subpath: {}", url_subpath(lon, lat)?);
            Ok(())
        }
        Commands::Browse { subpath, server } => browse(&config, &subpath, server.as_deref()).await,
        Commands::InitConfig { output } => {
            let path = output.unwrap_or(config_path);
            config.save(&path).await?;
            println!("✅ Configuration written to {}", path.display());
            Ok(())
        }
    }
}

async fn scan(config: &GardenConfig, region: RegionArgs) -> Result<()> {
    let mut session = RegionSession::new(config.region.region_dim, config.region.board_pixels);
    session.activate(region.region(config.region.region_dim, None)?)?;
    let assessor = FreshnessAssessor::new(config.gap_days(), &config.tiles.manifest_file_name)?;

    match session.initial_scan(&region.root, &assessor).await? {
        InitialScan::FreshRepository => {
            println!("No terrain below {}: fresh repository", region.root.display());
            return Ok(());
        }
        InitialScan::Scanned { errors } if errors > 0 => {
            warn!("{} tiles could not be assessed", errors);
        }
        InitialScan::Scanned { .. } => {}
    }

    let grid = session.grid()?;
    for state in [
        TileSyncState::Fresh4,
        TileSyncState::Fresh3,
        TileSyncState::Fresh2,
        TileSyncState::Fresh1,
        TileSyncState::Populated,
        TileSyncState::Orphan,
        TileSyncState::Error,
        TileSyncState::Unusable,
    ] {
        println!("{:>10}: {}", state.label(), grid.count(state));
    }
    Ok(())
}

async fn run(
    config: &GardenConfig,
    mission: Mission,
    region: RegionArgs,
    tiles: Vec<String>,
    server: Option<String>,
    json: bool,
) -> Result<()> {
    let anchor = tiles
        .first()
        .map(|name| parse_tile_name(name))
        .transpose()
        .context("invalid tile name")?;

    let mut session = RegionSession::new(config.region.region_dim, config.region.board_pixels);
    session.activate(region.region(config.region.region_dim, anchor)?)?;
    let assessor = FreshnessAssessor::new(config.gap_days(), &config.tiles.manifest_file_name)?;
    if session.initial_scan(&region.root, &assessor).await? == InitialScan::FreshRepository {
        info!("Starting from an empty repository at {}", region.root.display());
    }

    session.set_pending(mission);
    for name in &tiles {
        let cell = session
            .context()?
            .parse_cell(name)
            .with_context(|| format!("{} is not in the active region", name))?;
        match session.pick(cell)? {
            Some(mark) => info!("Picked {} as {}", name, mark),
            None => warn!(
                "{} ({}) cannot take part in {}",
                name,
                session.grid()?.state(cell),
                mission
            ),
        }
    }
    session.log_selection()?;

    let remote_root = if mission.needs_remote() {
        mirror_root(config, server.as_deref()).await?
    } else {
        // Clearing never contacts a mirror
        Url::parse("file:///").context("invalid placeholder URL")?
    };
    let order = session.order(mission, &region.root, remote_root)?;
    if order.target_count() == 0 {
        bail!("No tile selected for {}", mission);
    }

    let engine = SyncEngine::new(
        manifest_client(config)?,
        ContentStamper::new(config.tiles.stamp_file_name.clone()),
        config.engine_options(),
    );
    let mut coordinator = WorkerCoordinator::new(engine, config.worker_settings());
    coordinator.dispatch(order).await?;

    let finished = follow(&mut coordinator, json, tokio::signal::ctrl_c()).await;
    coordinator.shutdown().await?;

    match finished? {
        Some(MissionOutcome::Completed) | Some(MissionOutcome::Aborted) => Ok(()),
        Some(MissionOutcome::Crashed) => bail!("{} did not update anything", mission),
        None => bail!("Worker stopped before the mission finished"),
    }
}

/// Render worker events until the mission ends. `interrupt` resolving asks
/// the worker to abort once; the mission still runs to its next tile boundary.
async fn follow<F>(
    coordinator: &mut WorkerCoordinator,
    json: bool,
    interrupt: F,
) -> Result<Option<MissionOutcome>>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(interrupt);
    let mut abort_sent = false;
    loop {
        tokio::select! {
            event = coordinator.next_event() => match event {
                Some(event) => {
                    render(&event, json)?;
                    if let Some(outcome) = event.outcome() {
                        return Ok(Some(outcome));
                    }
                }
                None => return Ok(None),
            },
            _ = &mut interrupt, if !abort_sent => {
                abort_sent = true;
                println!("Abort requested, finishing the current tile...");
                coordinator.abort()?;
            }
        }
    }
}

fn render(event: &WorkerEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        WorkerEvent::MissionStarted {
            mission, targets, ..
        } => println!("▶ {} on {} tiles", mission, targets),
        WorkerEvent::Progress {
            scanned,
            updated,
            errors,
            transferred,
            notice,
            ..
        } => println!(
            "  {} tiles, {} updates, {} errors, {} files | {}",
            scanned, updated, errors, transferred, notice
        ),
        WorkerEvent::MissionFinished {
            outcome,
            report,
            duration,
            notice,
            ..
        } => {
            let mark = match outcome {
                MissionOutcome::Completed => "✅",
                MissionOutcome::Aborted => "⏹",
                MissionOutcome::Crashed => "❌",
            };
            println!("{} {} ({:.1}s)", mark, notice, duration.as_secs_f64());
            println!(
                "  scanned {}, updated {}, downloaded {}, errors {}, incidents {}, skipped {}",
                report.scanned,
                report.updated,
                report.downloads,
                report.errors,
                report.incidents,
                report.skipped
            );
        }
        WorkerEvent::Rejected { reason, .. } => println!("Request rejected: {}", reason),
        _ => {}
    }
    Ok(())
}

async fn browse(config: &GardenConfig, subpath: &str, server: Option<&str>) -> Result<()> {
    let root = mirror_root(config, server).await?;
    let url = join_url(
        &root,
        &format!(
            "{}/{}",
            subpath.trim_end_matches('/'),
            config.tiles.manifest_file_name
        ),
    )?;

    let entries = manifest_client(config)?
        .browse(&url)
        .await
        .with_context(|| format!("cannot browse {}", url))?;
    for entry in entries {
        match entry.value {
            Some(value) => println!("{:<12} {:<40} {}", format!("{:?}", entry.kind), entry.name, value),
            None => println!("{:<12} {}", format!("{:?}", entry.kind), entry.name),
        }
    }
    Ok(())
}

async fn mirror_root(config: &GardenConfig, server: Option<&str>) -> Result<Url> {
    let source = match server.or(config.mirror.server_url.as_deref()) {
        Some(url) => FixedSource::new(url)?,
        None => FixedSource::unavailable(),
    };
    source
        .find_preferred_source()
        .await
        .context("no mirror available; pass --server or set mirror.server_url")
}

fn manifest_client(config: &GardenConfig) -> Result<ManifestClient> {
    let http = MirrorClientBuilder::new()
        .timeout(config.http_timeout())
        .user_agent(config.mirror.user_agent.clone())
        .build()
        .context("cannot build HTTP client")?;
    Ok(ManifestClient::new(Arc::new(http)).with_retry_delays(config.retry_delays()))
}
