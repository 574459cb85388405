//! Gardener configuration
//!
//! A TOML file with one table per concern. Every field has a default, so an
//! empty or missing file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::addressing::DEFAULT_REGION_DIM;
use crate::coordinator::WorkerSettings;
use crate::engine::EngineOptions;
use crate::error::{Result, SyncError};
use crate::freshness::{parse_gap, DEFAULT_GAP_DAYS};
use crate::manifest::{DEFAULT_RETRY_DELAYS_MS, MANIFEST_FILE_NAME};
use crate::stamper::DEFAULT_STAMP_FILE_NAME;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GardenConfig {
    #[serde(default)]
    pub tiles: TileSettings,
    #[serde(default)]
    pub region: RegionSettings,
    #[serde(default)]
    pub mirror: MirrorSettings,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gap as written by the user: a number or free text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GapSetting {
    Days(i64),
    Text(String),
}

impl GapSetting {
    /// Effective gap in days, floored and defaulted like any raw setting
    pub fn days(&self) -> u32 {
        match self {
            GapSetting::Days(days) => parse_gap(&days.to_string()),
            GapSetting::Text(text) => parse_gap(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileSettings {
    #[serde(default = "default_gap")]
    pub freshness_gap_days: GapSetting,
    #[serde(default = "default_stamp_file_name")]
    pub stamp_file_name: String,
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,
    #[serde(default = "default_path_separator")]
    pub path_separator: char,
    /// Clearing a tile also removes its airports
    #[serde(default)]
    pub clear_airports: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSettings {
    #[serde(default = "default_region_dim")]
    pub region_dim: usize,
    /// Side of the square board the region is drawn on
    #[serde(default = "default_board_pixels")]
    pub board_pixels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSettings {
    /// Fixed mirror; unset means no mirror is available
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_retry_delays_ms")]
    pub manifest_retry_delays_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
    #[serde(default = "default_startup_alive_attempts")]
    pub startup_alive_attempts: u32,
    #[serde(default = "default_startup_idle_attempts")]
    pub startup_idle_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory of the rolling session log; unset disables it
    #[serde(default = "default_log_dir")]
    pub log_dir: Option<PathBuf>,
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            freshness_gap_days: default_gap(),
            stamp_file_name: default_stamp_file_name(),
            manifest_file_name: default_manifest_file_name(),
            path_separator: default_path_separator(),
            clear_airports: false,
        }
    }
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            region_dim: default_region_dim(),
            board_pixels: default_board_pixels(),
        }
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            http_timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
            manifest_retry_delays_ms: default_retry_delays_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_secs: default_idle_poll_secs(),
            startup_alive_attempts: default_startup_alive_attempts(),
            startup_idle_attempts: default_startup_idle_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

impl GardenConfig {
    /// Read `path`; a missing file gives the defaults
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(SyncError::local_io(path, e)),
        };
        let config: GardenConfig = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("cannot serialize configuration: {}", e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::local_io(parent, e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| SyncError::local_io(path, e))?;
        Ok(())
    }

    /// Default file location in the user's config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("terrasync-gardener")
            .join("gardener.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(server_url) = &self.mirror.server_url {
            url::Url::parse(server_url)
                .map_err(|e| SyncError::Config(format!("invalid server URL '{}': {}", server_url, e)))?;
        }

        let dim = self.region.region_dim;
        if dim == 0 || dim as i32 > 2 * crate::addressing::REGION_LAT_LIMIT {
            return Err(SyncError::Config(format!(
                "region dimension {} out of range",
                dim
            )));
        }
        if self.region.board_pixels < dim as u32 {
            return Err(SyncError::Config(format!(
                "board of {} pixels cannot hold {} tiles per side",
                self.region.board_pixels, dim
            )));
        }
        if self.tiles.stamp_file_name.is_empty() || self.tiles.manifest_file_name.is_empty() {
            return Err(SyncError::Config(
                "stamp and manifest file names cannot be empty".to_string(),
            ));
        }
        if self.worker.idle_poll_secs == 0 {
            return Err(SyncError::Config(
                "worker idle poll must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gap_days(&self) -> u32 {
        self.tiles.freshness_gap_days.days()
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            manifest_file_name: self.tiles.manifest_file_name.clone(),
            path_separator: self.tiles.path_separator,
            clear_airports: self.tiles.clear_airports,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            idle_poll: Duration::from_secs(self.worker.idle_poll_secs),
            alive_attempts: self.worker.startup_alive_attempts,
            idle_attempts: self.worker.startup_idle_attempts,
            ..WorkerSettings::default()
        }
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.mirror
            .manifest_retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.mirror.http_timeout_secs)
    }
}

fn default_gap() -> GapSetting { GapSetting::Days(DEFAULT_GAP_DAYS as i64) }
fn default_stamp_file_name() -> String { DEFAULT_STAMP_FILE_NAME.to_string() }
fn default_manifest_file_name() -> String { MANIFEST_FILE_NAME.to_string() }
fn default_path_separator() -> char { std::path::MAIN_SEPARATOR }

fn default_region_dim() -> usize { DEFAULT_REGION_DIM }
fn default_board_pixels() -> u32 { 920 }

fn default_http_timeout_secs() -> u64 { 30 }
fn default_user_agent() -> String { concat!("terrasync-gardener/", env!("CARGO_PKG_VERSION")).to_string() }
fn default_retry_delays_ms() -> Vec<u64> { DEFAULT_RETRY_DELAYS_MS.to_vec() }

fn default_idle_poll_secs() -> u64 { 2 }
fn default_startup_alive_attempts() -> u32 { 10 }
fn default_startup_idle_attempts() -> u32 { 5 }

fn default_log_level() -> String { "info".to_string() }

fn default_log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("terrasync-gardener").join("logs"))
}
