//! Local index of blocked sites.
//!
//! Bookkeeping only. The device's layer7/filter list is authoritative: an
//! entry here does not mean the block is live, and a missing entry never
//! prevents blocking. The file is a JSON array rewritten wholesale on every
//! change through a temp file in the same directory, so readers see either
//! the old or the new content.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{IndexError, ValidationError};

/// How long a block is meant to last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BlockDuration {
    #[default]
    Permanent,
    For(Duration),
}

impl fmt::Display for BlockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDuration::Permanent => f.write_str("permanent"),
            BlockDuration::For(d) => write!(f, "{}", humantime::format_duration(*d)),
        }
    }
}

/// Accepts `permanent` or a humantime span such as `1h`, `2d`, `90m`.
impl FromStr for BlockDuration {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("permanent") || s.eq_ignore_ascii_case("permanen") {
            return Ok(BlockDuration::Permanent);
        }
        match humantime::parse_duration(s) {
            Ok(d) if !d.is_zero() => Ok(BlockDuration::For(d)),
            Ok(_) => Err(ValidationError::NotPositive { field: "duration" }),
            Err(_) => Err(ValidationError::Malformed {
                field: "duration",
                value: s.to_string(),
            }),
        }
    }
}

impl From<BlockDuration> for String {
    fn from(duration: BlockDuration) -> Self {
        duration.to_string()
    }
}

impl TryFrom<String> for BlockDuration {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One index entry, keyed by domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedSiteEntry {
    pub domain: String,
    pub schedule: Option<NaiveDate>,
    pub duration: BlockDuration,

    /// Name of the device objects implementing the block.
    pub block_id: String,
    pub created_at: DateTime<Utc>,
}

impl BlockedSiteEntry {
    pub fn new(
        domain: impl Into<String>,
        schedule: Option<NaiveDate>,
        duration: BlockDuration,
        block_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            schedule,
            duration,
            block_id: block_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// JSON file holding [`BlockedSiteEntry`] records. One writer at a time
/// within the process.
#[derive(Debug)]
pub struct BlockIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BlockIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries. A missing or unreadable file reads as empty.
    pub fn load(&self) -> Vec<BlockedSiteEntry> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("block index {} does not exist yet", self.path.display());
                return Vec::new();
            }
            Err(e) => {
                warn!("failed to read block index {}: {e}", self.path.display());
                return Vec::new();
            }
        };
        match serde_json::from_str(&data) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "block index {} is corrupt, treating as empty: {e}",
                    self.path.display()
                );
                Vec::new()
            }
        }
    }

    pub fn get(&self, domain: &str) -> Option<BlockedSiteEntry> {
        self.load().into_iter().find(|e| e.domain == domain)
    }

    /// Insert or replace the entry for `entry.domain`.
    pub fn upsert(&self, entry: BlockedSiteEntry) -> Result<(), IndexError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load();
        entries.retain(|e| e.domain != entry.domain);
        entries.push(entry);
        self.store(&entries)
    }

    /// Remove the entry for `domain`; returns whether one was present.
    pub fn remove(&self, domain: &str) -> Result<bool, IndexError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.domain != domain);
        if entries.len() == before {
            return Ok(false);
        }
        self.store(&entries)?;
        Ok(true)
    }

    fn store(&self, entries: &[BlockedSiteEntry]) -> Result<(), IndexError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let mut file = NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        serde_json::to_writer_pretty(&mut file, entries)?;
        file.flush().map_err(|e| self.io_error(e))?;
        file.persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;

        debug!(
            "block index {} rewritten with {} entries",
            self.path.display(),
            entries.len()
        );
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> IndexError {
        IndexError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domain: &str) -> BlockedSiteEntry {
        BlockedSiteEntry::new(
            domain,
            NaiveDate::from_ymd_opt(2025, 3, 1),
            BlockDuration::For(Duration::from_secs(3600)),
            format!("block-{domain}"),
        )
    }

    #[test]
    fn test_duration_parse_and_display() {
        assert_eq!("permanent".parse::<BlockDuration>(), Ok(BlockDuration::Permanent));
        assert_eq!("Permanen".parse::<BlockDuration>(), Ok(BlockDuration::Permanent));
        assert_eq!(
            "1h".parse::<BlockDuration>(),
            Ok(BlockDuration::For(Duration::from_secs(3600)))
        );
        assert_eq!(
            "1d".parse::<BlockDuration>(),
            Ok(BlockDuration::For(Duration::from_secs(86_400)))
        );
        assert!("0s".parse::<BlockDuration>().is_err());
        assert!("soon".parse::<BlockDuration>().is_err());
        assert_eq!(BlockDuration::For(Duration::from_secs(3600)).to_string(), "1h");
        assert_eq!(BlockDuration::Permanent.to_string(), "permanent");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockIndex::new(dir.path().join("blocked.json"));
        assert!(index.load().is_empty());
    }

    #[test]
    fn test_upsert_replaces_by_domain() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockIndex::new(dir.path().join("nested").join("blocked.json"));

        index.upsert(entry("example.com")).unwrap();
        index.upsert(entry("other.org")).unwrap();
        let mut again = entry("example.com");
        again.duration = BlockDuration::Permanent;
        index.upsert(again).unwrap();

        let entries = index.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            index.get("example.com").unwrap().duration,
            BlockDuration::Permanent
        );

        // Only the index file is left in the directory
        let files: Vec<_> = fs::read_dir(dir.path().join("nested")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockIndex::new(dir.path().join("blocked.json"));
        index.upsert(entry("example.com")).unwrap();

        assert!(index.remove("example.com").unwrap());
        assert!(!index.remove("example.com").unwrap());
        assert!(index.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.json");
        fs::write(&path, "{ not json").unwrap();
        let index = BlockIndex::new(&path);
        assert!(index.load().is_empty());

        index.upsert(entry("example.com")).unwrap();
        assert_eq!(index.load().len(), 1);
    }

    #[test]
    fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.json");
        let index = BlockIndex::new(&path);
        index.upsert(entry("example.com")).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["domain"], "example.com");
        assert_eq!(value[0]["schedule"], "2025-03-01");
        assert_eq!(value[0]["duration"], "1h");
        assert_eq!(value[0]["block_id"], "block-example.com");
    }
}
