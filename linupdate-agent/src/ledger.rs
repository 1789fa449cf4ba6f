//! Request ledger - durable per-request outcome store
//!
//! Layout: one directory per request id under the ledger root, each holding
//! flat files `status`, `log`, `summary` (JSON) and `error`. Every field is
//! written to a temporary file, synced, then renamed over the target so a
//! reader never observes a partial write.

use serde_json::Value;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Running,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RequestStatus::Running)
    }
}

impl FromStr for RequestStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "running" => Ok(RequestStatus::Running),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(LedgerError::Status(other.to_string())),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flat file of a record directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Status,
    Log,
    Summary,
    Error,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Status, Field::Log, Field::Summary, Field::Error];

    pub fn file_name(&self) -> &'static str {
        match self {
            Field::Status => "status",
            Field::Log => "log",
            Field::Summary => "summary",
            Field::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|field| field.file_name() == name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request id '{0}'")]
    InvalidId(String),
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid summary for request {id}: {source}")]
    Summary {
        id: String,
        source: serde_json::Error,
    },
    #[error("invalid status '{0}'")]
    Status(String),
}

/// Everything persisted for one request id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestRecord {
    pub id: String,
    pub status: Option<RequestStatus>,
    pub log: Option<String>,
    pub summary: Option<Value>,
    pub error: Option<String>,
}

impl RequestRecord {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.log.is_none() && self.summary.is_none() && self.error.is_none()
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Request ids come from the network and become directory names.
fn validate_id(id: &str) -> Result<(), LedgerError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidId(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RequestLedger {
    root: PathBuf,
}

impl RequestLedger {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_dir(&self, id: &str) -> Result<PathBuf, LedgerError> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_dir(id).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    /// Create the record directory (and the ledger root) if missing.
    pub fn create(&self, id: &str) -> Result<PathBuf, LedgerError> {
        let dir = self.record_dir(id)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    /// Atomically replace one field, creating the record on demand.
    pub fn write(&self, id: &str, field: Field, value: &str) -> Result<(), LedgerError> {
        let dir = self.create(id)?;
        let target = dir.join(field.file_name());
        let temp = dir.join(format!(".{}.tmp", field.file_name()));

        let mut file = fs::File::create(&temp).map_err(io_err(&temp))?;
        file.write_all(value.as_bytes()).map_err(io_err(&temp))?;
        file.sync_all().map_err(io_err(&temp))?;
        drop(file);

        fs::rename(&temp, &target).map_err(io_err(&target))?;

        // Make the rename itself durable
        if let Ok(handle) = fs::File::open(&dir) {
            let _ = handle.sync_all();
        }
        Ok(())
    }

    pub fn write_status(&self, id: &str, status: RequestStatus) -> Result<(), LedgerError> {
        self.write(id, Field::Status, status.as_str())
    }

    pub fn write_summary(&self, id: &str, summary: &Value) -> Result<(), LedgerError> {
        let content = serde_json::to_string(summary).map_err(|source| LedgerError::Summary {
            id: id.to_string(),
            source,
        })?;
        self.write(id, Field::Summary, &content)
    }

    fn read_field(&self, dir: &Path, field: Field) -> Result<Option<String>, LedgerError> {
        let path = dir.join(field.file_name());
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LedgerError::Io { path, source }),
        }
    }

    /// Read every persisted field; a missing record reads as empty.
    pub fn read_all(&self, id: &str) -> Result<RequestRecord, LedgerError> {
        let dir = self.record_dir(id)?;
        let mut record = RequestRecord {
            id: id.to_string(),
            ..Default::default()
        };

        if let Some(status) = self.read_field(&dir, Field::Status)? {
            if !status.trim().is_empty() {
                record.status = Some(status.parse()?);
            }
        }
        record.log = self.read_field(&dir, Field::Log)?;
        if let Some(summary) = self.read_field(&dir, Field::Summary)? {
            if !summary.trim().is_empty() {
                record.summary = Some(serde_json::from_str(&summary).map_err(|source| LedgerError::Summary {
                    id: id.to_string(),
                    source,
                })?);
            }
        }
        record.error = self
            .read_field(&dir, Field::Error)?
            .filter(|error| !error.is_empty());

        Ok(record)
    }

    /// Remove the record; deleting an unknown id is a no-op.
    pub fn delete(&self, id: &str) -> Result<(), LedgerError> {
        let dir = self.record_dir(id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LedgerError::Io { path: dir, source }),
        }
    }

    /// Remove the given fields, then the directory if nothing else is left.
    pub fn delete_fields(&self, id: &str, fields: &[Field]) -> Result<(), LedgerError> {
        let dir = self.record_dir(id)?;
        if !dir.is_dir() {
            return Ok(());
        }

        for field in fields {
            let path = dir.join(field.file_name());
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(LedgerError::Io { path, source }),
            }
        }

        let remaining = fs::read_dir(&dir).map_err(io_err(&dir))?.count();
        if remaining == 0 {
            self.delete(id)?;
        }
        Ok(())
    }

    /// Record ids, numeric ids first in numeric order, then the others lexicographically.
    pub fn list(&self) -> Result<Vec<String>, LedgerError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        });
        Ok(ids)
    }

    /// Time since the record directory was last modified.
    pub fn age(&self, id: &str, now: SystemTime) -> Result<Duration, LedgerError> {
        let dir = self.record_dir(id)?;
        let modified = fs::metadata(&dir)
            .and_then(|meta| meta.modified())
            .map_err(io_err(&dir))?;
        Ok(now.duration_since(modified).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.list()?.is_empty())
    }
}
