use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(test)]
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::StateError;
use crate::state::models::Snapshot;

/// Durable snapshot storage
///
/// Implementations only move whole snapshots; serializing concurrent
/// read-modify-write cycles is the job of [`super::StateRepository`].
pub trait StateStore: Send + Sync {
    /// Load the snapshot, creating and persisting an empty one if none exists
    fn load(&self) -> Result<Snapshot, StateError>;

    /// Persist the snapshot before returning
    fn save(&self, snapshot: &Snapshot) -> Result<(), StateError>;
}

/// JSON file store with temp-file + fsync + rename writes
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn quarantine_corrupt(&self) -> Result<PathBuf, StateError> {
        let aside = PathBuf::from(format!(
            "{}.corrupt-{}",
            self.path.display(),
            chrono::Utc::now().timestamp()
        ));
        fs::rename(&self.path, &aside)
            .map_err(|e| StateError::io("move corrupt state file aside", e))?;
        Ok(aside)
    }

    fn initialise_empty(&self) -> Result<Snapshot, StateError> {
        let snapshot = Snapshot::default();
        self.save(&snapshot)?;
        Ok(snapshot)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Snapshot, StateError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📁 No state at {}, creating an empty snapshot", self.path.display());
                return self.initialise_empty();
            }
            Err(e) => return Err(StateError::io("read state file", e)),
        };

        match serde_json::from_slice::<Snapshot>(&raw) {
            Ok(snapshot) => Ok(snapshot),
            Err(parse_err) => {
                let aside = self.quarantine_corrupt()?;
                error!(
                    "❌ State file {} is unreadable ({}); moved to {} and starting empty",
                    self.path.display(),
                    parse_err,
                    aside.display()
                );
                self.initialise_empty()
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(snapshot).map_err(StateError::Serialize)?;
        atomic_write(&self.path, &data)
    }
}

/// Write `data` to `path` so a crash leaves either the old or the new file
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StateError> {
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return Err(StateError::NoParentDirectory(path.display().to_string())),
    };

    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| StateError::io("create state directory", e))?;
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StateError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| StateError::io("write temp file", e))?;
    tmp.flush().map_err(|e| StateError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StateError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| StateError::io("rename temp file over state", e.error))?;

    // Commit the rename itself
    match File::open(parent).and_then(|dir| dir.sync_all()) {
        Ok(()) => {}
        Err(e) => warn!("fsync of {} failed: {}", parent.display(), e),
    }

    Ok(())
}

/// Volatile store for tests
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Option<Snapshot>>,
}

#[cfg(test)]
impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Mutex::new(Some(snapshot)),
        }
    }
}

#[cfg(test)]
impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Snapshot, StateError> {
        Ok(self.inner.lock().get_or_insert_with(Snapshot::default).clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        *self.inner.lock() = Some(snapshot.clone());
        Ok(())
    }
}
