//! Persisted sync state.
//!
//! The remote engine's state serialization is kept in one file per resource.
//! It must never describe progress the resource has not durably reached, so
//! callers save it inside the resource's atomic section and only after
//! flushing the resource in that same section.

use forked_remote::StateSerialization;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// State file format version.
const STATE_FILE_VERSION: u16 = 1;

/// Extension of state files.
const STATE_FILE_EXTENSION: &str = "state";

/// Extension of the temporary file written before rename.
const STATE_TEMP_EXTENSION: &str = "state.tmp";

/// Sync state restored at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedSyncState {
    /// Engine state, `None` if the resource was never synced.
    pub state_serialization: Option<StateSerialization>,
}

impl PersistedSyncState {
    /// Creates a state holding `serialization`.
    pub fn new(serialization: StateSerialization) -> Self {
        Self {
            state_serialization: Some(serialization),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u16,
    state_serialization: Option<StateSerialization>,
}

/// Reads and writes the sync state file of one resource.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    dir: PathBuf,
    path: PathBuf,
}

impl SyncStateStore {
    /// Creates a store for resource `id` under `dir`, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>, id: &str) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{id}.{STATE_FILE_EXTENSION}"));
        Ok(Self { dir, path })
    }

    /// Returns the state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state.
    ///
    /// A missing, empty or unreadable file yields the never-synced state.
    pub fn load(&self) -> PersistedSyncState {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return PersistedSyncState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read sync state");
                return PersistedSyncState::default();
            }
        };
        if data.is_empty() {
            return PersistedSyncState::default();
        }

        match ciborium::from_reader::<StateFile, _>(data.as_slice()) {
            Ok(file) if file.version == STATE_FILE_VERSION => PersistedSyncState {
                state_serialization: file.state_serialization,
            },
            Ok(file) => {
                warn!(
                    path = %self.path.display(),
                    version = file.version,
                    "unsupported sync state version, starting unsynced"
                );
                PersistedSyncState::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt sync state, starting unsynced");
                PersistedSyncState::default()
            }
        }
    }

    /// Saves the state atomically.
    ///
    /// 1. Write to a temporary file
    /// 2. Sync the temporary file to disk
    /// 3. Rename it over the state file
    /// 4. Fsync the directory so the rename is durable
    pub fn save(&self, state: &PersistedSyncState) -> io::Result<()> {
        let file = StateFile {
            version: STATE_FILE_VERSION,
            state_serialization: state.state_serialization.clone(),
        };
        let mut data = Vec::new();
        ciborium::into_writer(&file, &mut data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let temp_path = self.path.with_extension(STATE_TEMP_EXTENSION);
        let mut temp = File::create(&temp_path)?;
        temp.write_all(&data)?;
        temp.sync_all()?;
        drop(temp);

        fs::rename(&temp_path, &self.path)?;
        self.sync_directory()?;

        debug!(path = %self.path.display(), bytes = data.len(), "saved sync state");
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> io::Result<()> {
        File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> io::Result<()> {
        Ok(())
    }
}
