//! Durable mapping from scheduler job identifiers to the experiments that produced them.
//!
//! An entry exists from a successful submission until a reconciliation pass observed the job as
//! terminated. The file is rewritten completely on every change, via a temporary file and an
//! atomic rename, so a crash leaves either the previous or the new mapping on disk.

use crate::model::Experiment;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type JobId = String;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access ledger {0}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Ledger {0} is corrupted")]
    Corrupted(PathBuf, #[source] serde_json::Error),
    #[error("Failed to serialize ledger")]
    Serialize(#[from] serde_json::Error),
    #[error("Ledger {0} is locked by another runner")]
    Locked(PathBuf),
    #[error("Failed to lock ledger {0}")]
    Lock(PathBuf, #[source] nix::Error),
}

/// Layout written by older runners, the mapping wrapped in a `Map` object
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WrappedLedger {
    #[serde(rename = "Map", default)]
    map: Option<BTreeMap<JobId, Experiment>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLedger {
    Wrapped(WrappedLedger),
    Flat(BTreeMap<JobId, Experiment>),
}

impl From<StoredLedger> for BTreeMap<JobId, Experiment> {
    fn from(stored: StoredLedger) -> Self {
        match stored {
            StoredLedger::Wrapped(wrapped) => wrapped.map.unwrap_or_default(),
            StoredLedger::Flat(map) => map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Ledger {
    #[serde(skip)]
    path: PathBuf,
    entries: BTreeMap<JobId, Experiment>,
}

impl Ledger {
    /// Empty, not yet persisted ledger backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the ledger from `path`, a missing file is an empty ledger
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "No ledger found, starting empty");

                return Ok(Self::new(path));
            }
            Err(error) => return Err(LedgerError::Io(path, error)),
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            warn!(path = ?path, "Ledger is empty, starting empty");

            return Ok(Self::new(path));
        }

        let entries = match serde_json::from_slice::<StoredLedger>(&data) {
            Ok(stored) => stored.into(),
            Err(error) => return Err(LedgerError::Corrupted(path, error)),
        };
        let ledger = Self { path, entries };

        info!(path = ?ledger.path, entries = ledger.len(), "Loaded ledger");

        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, job: &str) -> Option<&Experiment> {
        self.entries.get(job)
    }

    pub fn contains(&self, job: &str) -> bool {
        self.entries.contains_key(job)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &Experiment)> {
        self.entries.iter()
    }

    pub fn insert(&mut self, job: JobId, experiment: Experiment) -> Option<Experiment> {
        self.entries.insert(job, experiment)
    }

    pub fn remove(&mut self, job: &str) -> Option<Experiment> {
        self.entries.remove(job)
    }

    /// Job ids whose jobs are absent from the live set of the backend
    pub fn terminated(&self, live: &BTreeSet<JobId>) -> Vec<JobId> {
        self.entries
            .keys()
            .filter(|job| !live.contains(*job))
            .cloned()
            .collect()
    }

    /// Insert an entry and flush the ledger before returning
    pub fn record(&mut self, job: JobId, experiment: Experiment) -> Result<(), LedgerError> {
        if let Some(previous) = self.insert(job.clone(), experiment) {
            warn!(job = %job, experiment = previous.id, "Replaced existing ledger entry");
        }

        self.persist()
    }

    /// Remove an entry and flush the ledger before returning
    pub fn forget(&mut self, job: &str) -> Result<Option<Experiment>, LedgerError> {
        let removed = self.remove(job);

        if removed.is_some() {
            self.persist()?;
        }

        Ok(removed)
    }

    /// Write the full ledger to disk, replacing the previous file atomically
    pub fn persist(&self) -> Result<(), LedgerError> {
        let data = serde_json::to_vec_pretty(self)?;
        let tmp_path = sibling(&self.path, ".tmp");
        let io_error = |error| LedgerError::Io(self.path.clone(), error);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = File::create(&tmp_path).map_err(io_error)?;
        file.write_all(&data).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(io_error)?;

        // make the rename itself durable, not every filesystem supports syncing directories
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(error) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!(error = ?error, "Failed to sync ledger directory");
            }
        }

        debug!(path = ?self.path, entries = self.len(), "Persisted ledger");

        Ok(())
    }
}

/// `path` with `suffix` appended to its file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("jobs.json"));
    file_name.push(suffix);

    path.with_file_name(file_name)
}

/// Exclusive advisory lock next to the ledger, released when dropped
#[derive(Debug)]
pub struct LedgerLock {
    path: PathBuf,
    _file: File,
}

impl LedgerLock {
    pub fn acquire(ledger: &Path) -> Result<Self, LedgerError> {
        let path = sibling(ledger, ".lock");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| LedgerError::Io(path.clone(), error))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|error| LedgerError::Io(path.clone(), error))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                debug!(path = ?path, "Acquired ledger lock");

                Ok(Self { path, _file: file })
            }
            Err(errno) if errno == Errno::EWOULDBLOCK => {
                Err(LedgerError::Locked(ledger.to_path_buf()))
            }
            Err(error) => Err(LedgerError::Lock(path, error)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
