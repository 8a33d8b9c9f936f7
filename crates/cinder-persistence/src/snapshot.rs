//! Point-in-time snapshot files.
//!
//! A snapshot is a text file:
//!
//! ```text
//! REDIS0011
//! EXPIRE <key> <remaining-seconds>     (only for keys with a TTL)
//! SET <key> <value-with-escapes>
//! ...
//! EOF
//! ```
//!
//! An `EXPIRE` line always precedes its key's `SET` line; on load the
//! pending TTL is attached when the matching `SET` arrives. TTLs are
//! stored as seconds remaining at the moment of the snapshot, so a load
//! on a later clock re-derives a consistent deadline (the deadline is
//! monotonic-clock relative, re-anchored at load time).
//!
//! Writes go to `<file>.tmp` and are renamed over the final path after
//! a flush, so a crashed snapshot never replaces a valid one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::escape;
use crate::PersistenceError;

/// First line of every snapshot file.
pub const RDB_HEADER: &str = "REDIS0011";

/// One live entry captured at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
    /// TTL remaining when the snapshot was taken; `None` = no expiry.
    pub remaining: Option<Duration>,
}

/// Reads and writes the snapshot file at a fixed path.
pub struct RdbSnapshot {
    path: PathBuf,
}

impl RdbSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes all entries to a temp file, then atomically renames it
    /// over the snapshot path. Entries that already expired must be
    /// filtered out by the caller before this point.
    pub fn save(&self, entries: &[SnapshotEntry]) -> Result<(), PersistenceError> {
        let tmp_path = self.tmp_path();
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{RDB_HEADER}")?;
        for entry in entries {
            if let Some(remaining) = entry.remaining {
                writeln!(writer, "EXPIRE {} {}", entry.key, remaining.as_secs())?;
            }
            writeln!(writer, "SET {} {}", entry.key, escape::escape(&entry.value))?;
        }
        writeln!(writer, "EOF")?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        info!(path = %self.path.display(), keys = entries.len(), "snapshot saved");
        Ok(())
    }

    /// Loads the snapshot, if any.
    ///
    /// A missing file yields an empty result. A header mismatch is
    /// reported as [`PersistenceError::BadHeader`]; callers treat it as
    /// "nothing to load" after logging.
    pub fn load(&self) -> Result<Vec<SnapshotEntry>, PersistenceError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let mut header = String::new();
        reader.read_line(&mut header)?;
        if header.trim_end_matches('\n') != RDB_HEADER {
            return Err(PersistenceError::BadHeader {
                expected: RDB_HEADER,
                found: header.trim_end_matches('\n').to_owned(),
            });
        }

        let mut entries = Vec::new();
        let mut pending_expires: HashMap<String, u64> = HashMap::new();

        for line in reader.lines() {
            let line = line?;
            if line == "EOF" {
                break;
            }
            if line.is_empty() {
                continue;
            }

            let Some((command, rest)) = line.split_once(' ') else {
                warn!(path = %self.path.display(), "skipping malformed snapshot line: {line:?}");
                continue;
            };
            match command {
                "SET" => {
                    let (key, value) = match rest.split_once(' ') {
                        Some((key, value)) => (key, value),
                        None => (rest, ""),
                    };
                    let remaining = pending_expires
                        .remove(key)
                        .map(Duration::from_secs);
                    entries.push(SnapshotEntry {
                        key: key.to_owned(),
                        value: escape::unescape(value),
                        remaining,
                    });
                }
                "EXPIRE" => {
                    let Some((key, seconds)) = rest.split_once(' ') else {
                        warn!(path = %self.path.display(), "skipping malformed snapshot line: {line:?}");
                        continue;
                    };
                    match seconds.parse::<u64>() {
                        Ok(seconds) => {
                            pending_expires.insert(key.to_owned(), seconds);
                        }
                        Err(_) => {
                            warn!(path = %self.path.display(), "skipping malformed snapshot line: {line:?}");
                        }
                    }
                }
                _ => {
                    warn!(path = %self.path.display(), "skipping malformed snapshot line: {line:?}");
                }
            }
        }

        info!(path = %self.path.display(), keys = entries.len(), "snapshot loaded");
        Ok(entries)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}
