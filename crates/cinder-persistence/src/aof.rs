//! Append-only command log.
//!
//! One command per line, LF-terminated:
//!
//! ```text
//! SET <key> <value-with-escapes>
//! DELETE <key>
//! EXPIRE <key> <positive-integer-seconds>
//! ```
//!
//! Keys are single whitespace-free tokens. Values run from the space
//! after the key to the end of the line, with embedded newlines escaped
//! as `\n` (see the caveat in [`crate::escape`]).
//!
//! The file is opened in append mode and flushed after every record, so
//! at most one committed mutation sits in kernel buffers at any moment.
//! Replay scans the file from the beginning, skipping blank lines;
//! lines that fail to parse are logged and skipped.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::escape;
use crate::PersistenceError;

/// A single command parsed back out of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AofCommand {
    Set { key: String, value: String },
    Delete { key: String },
    Expire { key: String, seconds: i64 },
}

/// Handle to an open append-only log file.
///
/// Appends are serialized through a dedicated mutex and flushed
/// immediately; the storage engine calls these from inside its own
/// exclusive section, so the on-disk order matches the apply order.
pub struct AofLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AofLog {
    /// Opens (or creates) the log for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "append-only log enabled");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The path this log writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.write_line(&format!("SET {key} {}", escape::escape(value)))
    }

    pub fn append_delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.write_line(&format!("DELETE {key}"))
    }

    pub fn append_expire(&self, key: &str, seconds: i64) -> Result<(), PersistenceError> {
        self.write_line(&format!("EXPIRE {key} {seconds}"))
    }

    fn write_line(&self, line: &str) -> Result<(), PersistenceError> {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Reads every command out of the log at `path`, in write order.
///
/// A missing file is not an error — there is simply nothing to replay.
/// Blank lines are skipped silently; malformed lines are logged and
/// skipped.
pub fn replay(path: &Path) -> Result<Vec<AofCommand>, PersistenceError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no append-only log to replay");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let reader = BufReader::new(file);
    let mut commands = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(command) => commands.push(command),
            None => warn!(path = %path.display(), "skipping malformed log line: {line:?}"),
        }
    }

    info!(path = %path.display(), commands = commands.len(), "append-only log replayed");
    Ok(commands)
}

fn parse_line(line: &str) -> Option<AofCommand> {
    let (command, rest) = line.split_once(' ')?;
    match command {
        "SET" => {
            // value starts after the single space following the key and
            // runs to the end of the line; it may be empty
            let (key, value) = match rest.split_once(' ') {
                Some((key, value)) => (key, value),
                None => (rest, ""),
            };
            if key.is_empty() {
                return None;
            }
            Some(AofCommand::Set {
                key: key.to_owned(),
                value: escape::unescape(value),
            })
        }
        "DELETE" => {
            if rest.is_empty() {
                return None;
            }
            Some(AofCommand::Delete {
                key: rest.to_owned(),
            })
        }
        "EXPIRE" => {
            let (key, seconds) = rest.split_once(' ')?;
            let seconds: i64 = seconds.parse().ok()?;
            if key.is_empty() {
                return None;
            }
            Some(AofCommand::Expire {
                key: key.to_owned(),
                seconds,
            })
        }
        _ => None,
    }
}
