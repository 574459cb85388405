//! Local freshness stamps
//!
//! After a folder has been transferred, a small stamp file records when and
//! against which manifest signature:
//!
//! ```text
//! stamped:2017-10-23T14:22:05.123
//! Z:w012n45:<sha1 of the manifest>:<epoch seconds>
//! ```
//!
//! Comparing a freshly fetched manifest against that signature tells
//! whether the folder can be skipped.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, Utc};
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::manifest::{self, EntryKind, Manifest};

pub const DEFAULT_STAMP_FILE_NAME: &str = ".ZsyncStamp";

/// Hash recorded when a load left a folder incomplete
pub const LOAD_FAILED_SENTINEL: &str = "<LOAD did not SUCCEED>";

/// Hash recorded when a sync left a folder incomplete
pub const SYNC_FAILED_SENTINEL: &str = "<SYNC did not SUCCEED>";

const STAMP_PREFIX: &str = "stamped:";
const MIN_STAMP_LINE_LEN: usize = "stamped:1970-01-01".len();
const STAMP_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-1 over the bytes of every line, in order, as lowercase hex.
///
/// Line order matters: any change to the manifest changes the signature.
pub fn signature<S: AsRef<str>>(lines: &[S]) -> String {
    let mut hasher = Sha1::new();
    for line in lines {
        hasher.update(line.as_ref().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// How a local folder stands against a remote manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    /// Stamp matches the manifest signature
    Current,
    /// Stamp present but recorded against another manifest
    Stale,
    /// No stamp, or one that cannot be trusted
    Absent,
}

/// Parsed stamp file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampRecord {
    pub stamped_at: NaiveDateTime,
    pub folder: String,
    pub hash: String,
    pub epoch: u64,
}

fn parse_stamped_at(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .ok()
}

/// Last path segment of a folder, as recorded in its stamp
fn folder_name(folder: &Path) -> String {
    folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Writes and checks stamp files
#[derive(Debug, Clone)]
pub struct ContentStamper {
    stamp_file_name: String,
}

impl Default for ContentStamper {
    fn default() -> Self {
        Self::new(DEFAULT_STAMP_FILE_NAME)
    }
}

impl ContentStamper {
    pub fn new(stamp_file_name: impl Into<String>) -> Self {
        Self {
            stamp_file_name: stamp_file_name.into(),
        }
    }

    pub fn stamp_file_name(&self) -> &str {
        &self.stamp_file_name
    }

    pub fn stamp_path(&self, folder: &Path) -> PathBuf {
        folder.join(&self.stamp_file_name)
    }

    /// Overwrite the stamp of `folder` with `hash`
    pub async fn write_stamp(&self, folder: &Path, hash: &str) -> Result<()> {
        let path = self.stamp_path(folder);
        let content = format!(
            "{}{}\nZ:{}:{}:{}\n",
            STAMP_PREFIX,
            Local::now().naive_local().format(STAMP_TIME_FORMAT),
            folder_name(folder),
            hash,
            Utc::now().timestamp()
        );
        fs::write(&path, content)
            .await
            .map_err(|e| SyncError::local_io(&path, e))?;
        debug!("Stamped {} with {}", folder.display(), hash);
        Ok(())
    }

    /// Read and validate the stamp of `folder`.
    ///
    /// The recorded folder name must match the folder's last path segment.
    pub async fn read_stamp(&self, folder: &Path) -> Result<StampRecord> {
        let path = self.stamp_path(folder);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::local_io(&path, e))?;
        let mut lines = content.lines();

        let first = lines.next().unwrap_or_default();
        if first.len() < MIN_STAMP_LINE_LEN {
            return Err(SyncError::stamp_parse(&path, "timestamp line too short"));
        }
        let stamped_at = first
            .strip_prefix(STAMP_PREFIX)
            .and_then(parse_stamped_at)
            .ok_or_else(|| SyncError::stamp_parse(&path, "unreadable timestamp"))?;

        let second = lines.next().unwrap_or_default();
        let entry = manifest::parse_line(second)
            .filter(|e| e.kind == EntryKind::Stamp)
            .ok_or_else(|| SyncError::stamp_parse(&path, "malformed signature line"))?;

        let expected = folder_name(folder);
        if entry.name != expected {
            return Err(SyncError::stamp_parse(
                &path,
                format!("stamp names '{}', folder is '{}'", entry.name, expected),
            ));
        }

        Ok(StampRecord {
            stamped_at,
            folder: entry.name,
            hash: entry.hash,
            epoch: entry.value.unwrap_or_default(),
        })
    }

    /// Compare a remote manifest with the stamp of `folder`
    pub async fn check_currency(&self, remote: &Manifest, folder: &Path) -> Currency {
        match self.read_stamp(folder).await {
            Ok(record) if record.hash == remote.signature() => Currency::Current,
            Ok(_) => Currency::Stale,
            Err(e) => {
                debug!("No usable stamp in {}: {}", folder.display(), e);
                Currency::Absent
            }
        }
    }
}

/// Whether `path` is a readable regular file of exactly `expected_size`
/// bytes whose SHA-1 is `expected_hash`. Never fails.
pub async fn file_is_current(path: &Path, expected_size: u64, expected_hash: &str) -> bool {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == expected_size => {}
        _ => return false,
    }

    match hash_file(path).await {
        Ok(hash) => hash.eq_ignore_ascii_case(expected_hash),
        Err(e) => {
            debug!("Failed to hash {}: {}", path.display(), e);
            false
        }
    }
}

/// SHA-1 of a file's content as lowercase hex
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
