//! Remote folder manifests (`.dirindex`)
//!
//! Every remote folder carries a manifest listing its files and subfolders
//! with their SHA-1 and size:
//!
//! ```text
//! path:Terrain/w020n40/w012n45
//! Z:w012n45:<sha1>:<epoch>
//! f:3088961.btg.gz:<sha1>:<size>
//! d:subfolder:<sha1>
//! ```
//!
//! Fetching retries on a non-200 status following a fixed schedule; file
//! downloads get a single attempt.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::future::retry;
use garden_core::{HttpGet, MirrorError};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SyncError};
use crate::stamper;

/// Name of the manifest file in every remote and local folder
pub const MANIFEST_FILE_NAME: &str = ".dirindex";

/// Pauses between manifest lookups while the status is not 200
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [1000, 1500, 2000];

/// Fewer lines than this and a manifest carries nothing to sync
pub const MIN_USABLE_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Folder-level signature line
    Stamp,
    /// Regular file
    File,
    /// Airport terrain mesh, named after its ICAO code
    TerrainFile,
    /// Subfolder
    Directory,
}

/// One parsed manifest line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    pub name: String,
    pub hash: String,
    /// Size in bytes for files, epoch seconds for the stamp line
    pub value: Option<u64>,
}

impl ManifestEntry {
    pub fn size(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File | EntryKind::TerrainFile => self.value,
            _ => None,
        }
    }

    pub fn epoch(&self) -> Option<u64> {
        match self.kind {
            EntryKind::Stamp => self.value,
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File | EntryKind::TerrainFile)
    }

    /// ICAO code of an airport terrain mesh
    pub fn icao(&self) -> Option<&str> {
        match self.kind {
            EntryKind::TerrainFile => self.name.get(..4),
            _ => None,
        }
    }
}

fn is_sha1_hex(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Airport terrain meshes are named `XXXX.btg.gz`, four upper-case letters
/// or digits.
pub fn airport_code(file_name: &str) -> Option<&str> {
    let code = file_name.strip_suffix(".btg.gz")?;
    (code.len() == 4 && code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()))
        .then_some(code)
}

/// `<name>:<sha1>:<digits>`, the name possibly containing colons
fn split_hashed_value(rest: &str) -> Option<(String, String, u64)> {
    let mut parts = rest.rsplitn(3, ':');
    let value = parts.next()?;
    let hash = parts.next()?;
    let name = parts.next()?;
    if !is_sha1_hex(hash) || value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((name.to_string(), hash.to_string(), value.parse().ok()?))
}

/// Parse one manifest line. Header lines and anything unrecognized give
/// `None`.
pub fn parse_line(line: &str) -> Option<ManifestEntry> {
    if let Some(rest) = line.strip_prefix("f:") {
        let (name, hash, size) = split_hashed_value(rest)?;
        if !is_safe_name(&name) {
            return None;
        }
        let kind = if airport_code(&name).is_some() {
            EntryKind::TerrainFile
        } else {
            EntryKind::File
        };
        return Some(ManifestEntry {
            kind,
            name,
            hash,
            value: Some(size),
        });
    }
    if let Some(rest) = line.strip_prefix("Z:") {
        let (name, hash, epoch) = split_hashed_value(rest)?;
        return Some(ManifestEntry {
            kind: EntryKind::Stamp,
            name,
            hash,
            value: Some(epoch),
        });
    }
    if let Some(rest) = line.strip_prefix("d:") {
        let (name, hash) = rest.rsplit_once(':')?;
        if !is_sha1_hex(hash) || !is_safe_name(name) {
            return None;
        }
        return Some(ManifestEntry {
            kind: EntryKind::Directory,
            name: name.to_string(),
            hash: hash.to_string(),
            value: None,
        });
    }
    None
}

fn is_header_line(line: &str) -> bool {
    ["path:", "version:", "time:"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// A manifest as received, line by line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    lines: Vec<String>,
    byte_count: usize,
}

impl Manifest {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
            byte_count: text.len(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// At least three lines, opening with a header and the folder signature
    pub fn is_usable(&self) -> bool {
        match self.lines.as_slice() {
            [header, signature, ..] if self.lines.len() >= MIN_USABLE_LINES => {
                (header.starts_with("path:") || header.starts_with("version:"))
                    && signature.starts_with("Z:")
            }
            _ => false,
        }
    }

    /// Parsed entries; malformed lines are logged and skipped
    pub fn entries(&self) -> Vec<ManifestEntry> {
        let mut entries = Vec::new();
        for line in &self.lines {
            if line.is_empty() || is_header_line(line) {
                continue;
            }
            match parse_line(line) {
                Some(entry) => entries.push(entry),
                None => warn!("Unexpected manifest line: {}", line),
            }
        }
        entries
    }

    /// File entries, regular and airport meshes
    pub fn files(&self) -> Vec<ManifestEntry> {
        self.entries().into_iter().filter(|e| e.is_file()).collect()
    }

    /// ICAO codes of the airport meshes listed here
    pub fn airport_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .entries()
            .iter()
            .filter_map(|e| e.icao().map(str::to_string))
            .collect();
        codes.dedup();
        codes
    }

    /// SHA-1 over every line in received order
    pub fn signature(&self) -> String {
        stamper::signature(&self.lines)
    }

    /// Text as written to a local manifest copy
    pub fn to_text(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

/// Fixed schedule of pauses consumed one per retry
#[derive(Debug, Clone)]
struct RetrySchedule {
    delays: Vec<Duration>,
    next: usize,
}

impl RetrySchedule {
    fn new(delays: Vec<Duration>) -> Self {
        Self { delays, next: 0 }
    }
}

impl Backoff for RetrySchedule {
    fn reset(&mut self) {
        self.next = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.delays.get(self.next).copied();
        self.next += 1;
        delay
    }
}

/// Fetches manifests and files from the mirror
#[derive(Clone)]
pub struct ManifestClient {
    http: Arc<dyn HttpGet>,
    retry_delays: Vec<Duration>,
}

impl ManifestClient {
    pub fn new(http: Arc<dyn HttpGet>) -> Self {
        Self {
            http,
            retry_delays: DEFAULT_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Fetch and split a manifest.
    ///
    /// A non-200 status is retried along the schedule and reported with its
    /// status once the schedule runs out. An empty body is an empty
    /// manifest, not an error.
    pub async fn fetch_manifest(&self, url: &Url) -> Result<Manifest> {
        let http = &self.http;
        let response = retry(RetrySchedule::new(self.retry_delays.clone()), || async move {
            let response = http.get(url).await.map_err(backoff::Error::permanent)?;
            if response.is_ok() {
                Ok(response)
            } else {
                debug!("Manifest lookup at {} answered {}", url, response.status);
                Err(backoff::Error::transient(MirrorError::Status {
                    status: response.status,
                    url: url.to_string(),
                }))
            }
        })
        .await?;

        if response.body.is_empty() {
            debug!("Empty manifest at {}", url);
            return Ok(Manifest::default());
        }

        let text = String::from_utf8_lossy(&response.body);
        let manifest = Manifest::from_text(&text);
        debug!(
            "Downloaded manifest: {} lines, {} bytes from {}",
            manifest.lines().len(),
            manifest.byte_count(),
            url
        );
        Ok(manifest)
    }

    /// Download one file into `dest`. Single attempt; an empty body writes
    /// nothing and returns 0.
    pub async fn fetch_file(&self, url: &Url, dest: &Path) -> Result<u64> {
        let response = self.http.get(url).await?;
        if !response.is_ok() {
            return Err(SyncError::Remote(MirrorError::Status {
                status: response.status,
                url: url.to_string(),
            }));
        }

        if response.body.is_empty() {
            debug!("Zero content length for {}; file not created", dest.display());
            return Ok(0);
        }

        fs::write(dest, &response.body)
            .await
            .map_err(|e| SyncError::local_io(dest, e))?;
        Ok(response.body.len() as u64)
    }

    /// Entries of any remote manifest
    pub async fn browse(&self, url: &Url) -> Result<Vec<ManifestEntry>> {
        let manifest = self.fetch_manifest(url).await?;
        if !manifest.is_usable() {
            return Err(SyncError::ManifestUnusable {
                url: url.to_string(),
            });
        }
        Ok(manifest.entries())
    }
}

/// `<base>/<path>` with exactly one slash between the parts
pub fn join_url(base: &Url, path: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| SyncError::Remote(MirrorError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{manifest_text, sha1_hex, ScriptedMirror};
    use garden_core::HttpResponse;
    use tempfile::TempDir;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    fn fast_client(mirror: &Arc<ScriptedMirror>) -> ManifestClient {
        ManifestClient::new(mirror.clone()).with_retry_delays(vec![Duration::from_millis(1); 3])
    }

    #[test]
    fn test_parse_lines() {
        let file = parse_line(&format!("f:3088961.btg.gz:{}:1234", HASH)).unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.name, "3088961.btg.gz");
        assert_eq!(file.size(), Some(1234));
        assert_eq!(file.epoch(), None);

        let airport = parse_line(&format!("f:EGLL.btg.gz:{}:99", HASH)).unwrap();
        assert_eq!(airport.kind, EntryKind::TerrainFile);
        assert_eq!(airport.icao(), Some("EGLL"));

        let stamp = parse_line(&format!("Z:w012n45:{}:1510000000", HASH)).unwrap();
        assert_eq!(stamp.kind, EntryKind::Stamp);
        assert_eq!(stamp.epoch(), Some(1510000000));

        let dir = parse_line(&format!("d:sub:{}", HASH)).unwrap();
        assert_eq!(dir.kind, EntryKind::Directory);
        assert_eq!(dir.value, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_line("path:Terrain/w020n40/w012n45").is_none());
        assert!(parse_line("f:short.btg.gz:abc:12").is_none());
        assert!(parse_line(&format!("f:x.btg.gz:{}:12k", HASH)).is_none());
        assert!(parse_line(&format!("f:../escape:{}:12", HASH)).is_none());
        assert!(parse_line(&format!("f:{}:12", HASH)).is_none());
        assert!(parse_line(&format!("q:odd:{}:12", HASH)).is_none());
        assert!(parse_line(&format!("d:sub:{}", HASH.to_uppercase())).is_none());
    }

    #[test]
    fn test_name_with_colon() {
        let entry = parse_line(&format!("f:odd:name.stg:{}:7", HASH)).unwrap();
        assert_eq!(entry.name, "odd:name.stg");
        assert_eq!(entry.size(), Some(7));
    }

    #[test]
    fn test_airport_code() {
        assert_eq!(airport_code("EGLL.btg.gz"), Some("EGLL"));
        assert_eq!(airport_code("LF29.btg.gz"), Some("LF29"));
        assert_eq!(airport_code("egll.btg.gz"), None);
        assert_eq!(airport_code("3088961.btg.gz"), None);
        assert_eq!(airport_code("EGLL.stg"), None);
    }

    #[test]
    fn test_usability() {
        let usable = Manifest::from_text(&format!(
            "path:Terrain/w020n40/w012n45\nZ:w012n45:{h}:1\nf:a.btg.gz:{h}:3\n",
            h = HASH
        ));
        assert!(usable.is_usable());
        assert_eq!(usable.files().len(), 1);

        let short = Manifest::from_text("path:x\nZ:x:y:1\n");
        assert!(!short.is_usable());

        let headless = Manifest::from_text(&format!("f:a:{h}:1\nf:b:{h}:1\nf:c:{h}:1", h = HASH));
        assert!(!headless.is_usable());

        let unsigned = Manifest::from_text(&format!(
            "path:w012n45\nf:a.stg:{h}:0\nf:b.stg:{h}:0\n",
            h = HASH
        ));
        assert!(!unsigned.is_usable());

        assert!(!Manifest::default().is_usable());
    }

    #[test]
    fn test_entries_skip_bad_lines() {
        let manifest = Manifest::from_text(&format!(
            "path:x\nZ:x:{h}:1\ngarbage\nf:a.btg.gz:{h}:3\n\nd:b:{h}\n",
            h = HASH
        ));
        let entries = manifest.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].name, "a.btg.gz");
        assert_eq!(entries[2].kind, EntryKind::Directory);
    }

    #[test]
    fn test_airport_codes() {
        let manifest = Manifest::from_text(&format!(
            "path:x\nZ:x:{h}:1\nf:EGLL.btg.gz:{h}:3\nf:3088961.btg.gz:{h}:3\nf:EGKK.btg.gz:{h}:3\n",
            h = HASH
        ));
        assert_eq!(manifest.airport_codes(), vec!["EGLL", "EGKK"]);
    }

    #[test]
    fn test_join_url() {
        let base = Url::parse("http://mirror.example.org/ws2/").unwrap();
        let url = join_url(&base, "/Terrain/w020n40/w012n45/.dirindex").unwrap();
        assert_eq!(
            url.as_str(),
            "http://mirror.example.org/ws2/Terrain/w020n40/w012n45/.dirindex"
        );
    }

    #[tokio::test]
    async fn test_fetch_manifest_ok() {
        let mirror = Arc::new(ScriptedMirror::new());
        let text = manifest_text("w012n45", &[("a.btg.gz", b"aaa".as_slice())]);
        mirror.serve("http://m/Terrain/.dirindex", text.clone());

        let client = fast_client(&mirror);
        let url = Url::parse("http://m/Terrain/.dirindex").unwrap();
        let manifest = client.fetch_manifest(&url).await.unwrap();

        assert!(manifest.is_usable());
        assert_eq!(manifest.byte_count(), text.len());
        assert_eq!(mirror.request_count("http://m/Terrain/.dirindex"), 1);
    }

    #[tokio::test]
    async fn test_fetch_manifest_retries_then_succeeds() {
        let mirror = Arc::new(ScriptedMirror::new());
        let url = "http://m/Objects/.dirindex";
        mirror.queue(url, HttpResponse::new(503, ""));
        mirror.queue(url, HttpResponse::new(503, ""));
        mirror.serve(url, manifest_text("w012n45", &[]));

        let client = fast_client(&mirror);
        let manifest = client.fetch_manifest(&Url::parse(url).unwrap()).await.unwrap();
        assert_eq!(manifest.lines().len(), 2);
        assert_eq!(mirror.request_count(url), 3);
    }

    #[tokio::test]
    async fn test_fetch_manifest_gives_up_with_status() {
        let mirror = Arc::new(ScriptedMirror::new());
        let url = "http://m/Terrain/w020n40/w012n45/.dirindex";

        let client = fast_client(&mirror);
        let err = client.fetch_manifest(&Url::parse(url).unwrap()).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(err.is_not_found());
        assert_eq!(mirror.request_count(url), 4);
    }

    #[tokio::test]
    async fn test_fetch_manifest_empty_body() {
        let mirror = Arc::new(ScriptedMirror::new());
        let url = "http://m/empty/.dirindex";
        mirror.serve(url, "");

        let client = fast_client(&mirror);
        let manifest = client.fetch_manifest(&Url::parse(url).unwrap()).await.unwrap();
        assert!(manifest.is_empty());
        assert_eq!(manifest.byte_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let temp = TempDir::new().unwrap();
        let mirror = Arc::new(ScriptedMirror::new());
        mirror.serve("http://m/a.btg.gz", b"content".to_vec());
        mirror.serve("http://m/empty.btg.gz", "");

        let client = fast_client(&mirror);
        let dest = temp.path().join("a.btg.gz");
        let written = client
            .fetch_file(&Url::parse("http://m/a.btg.gz").unwrap(), &dest)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(sha1_hex(&std::fs::read(&dest).unwrap()), sha1_hex(b"content"));

        let empty = temp.path().join("empty.btg.gz");
        let written = client
            .fetch_file(&Url::parse("http://m/empty.btg.gz").unwrap(), &empty)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(!empty.exists());
    }

    #[tokio::test]
    async fn test_fetch_file_single_attempt() {
        let temp = TempDir::new().unwrap();
        let mirror = Arc::new(ScriptedMirror::new());
        let url = "http://m/missing.btg.gz";

        let client = fast_client(&mirror);
        let err = client
            .fetch_file(&Url::parse(url).unwrap(), &temp.path().join("missing.btg.gz"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(mirror.request_count(url), 1);
    }

    #[tokio::test]
    async fn test_browse_unusable() {
        let mirror = Arc::new(ScriptedMirror::new());
        let url = "http://m/Models/.dirindex";
        mirror.serve(url, "path:Models\n");

        let client = fast_client(&mirror);
        let err = client.browse(&Url::parse(url).unwrap()).await.unwrap_err();
        assert!(matches!(err, SyncError::ManifestUnusable { .. }));
    }
}
