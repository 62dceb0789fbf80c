// # File Cache Store
//
// File-based implementation of CacheStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: write-then-rename
// - Automatic backup: the previous good file is kept as `.backup`
// - Recovery: a file that fails to parse is replaced by its backup
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "ha_mode": "default",
//   "state": "site_affinitized",
//   "client_site": "Paris",
//   "affinitized": {
//     "corp.example.com": {
//       "dc_name": "dc1.corp.example.com",
//       "domain_name": "corp.example.com",
//       "site_name": "Paris",
//       "affinitized_since": "2025-01-09T12:00:00Z"
//     }
//   },
//   "dcs": { "dc1.corp.example.com": { "dc_name": "...", "is_alive": true } },
//   "heartbeats": {}
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::Error;
use crate::state::{CacheSnapshot, row_key};
use crate::traits::{
    AffinitizedDc, AffinityState, CacheStore, DcCacheEntry, HaMode, HeartbeatStatus,
};

/// Cache file format version
const CACHE_FILE_VERSION: &str = "1.0";

/// File-based cache store with crash recovery
///
/// Every mutation is written through to disk before the call returns.
#[derive(Debug)]
pub struct FileCacheStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
    /// Serializes writers so the temp file is never shared
    write_lock: Mutex<()>,
}

#[derive(Debug)]
struct FileState {
    snapshot: CacheSnapshot,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CacheFileFormat {
    version: String,
    #[serde(flatten)]
    snapshot: CacheSnapshot,
}

/// Why a load failed
enum LoadFailure {
    /// File exists but does not parse
    Corrupt(Error),
    /// File could not be read
    Io(Error),
}

impl FileCacheStore {
    /// Create or load a file cache store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing file
    /// 3. If it is corrupt, load the backup
    /// 4. If both fail, start empty
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create cache directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let snapshot = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                snapshot,
                dirty: false,
            })),
            write_lock: Mutex::new(()),
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<CacheSnapshot, Error> {
        match Self::load(path).await {
            Ok(snapshot) => {
                tracing::debug!("Loaded cache from file: {} DC rows", snapshot.dcs.len());
                Ok(snapshot)
            }
            Err(LoadFailure::Io(e)) => Err(e),
            Err(LoadFailure::Corrupt(e)) => {
                tracing::warn!("Cache file appears corrupted: {}. Attempting recovery from backup.", e);

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty cache.");
                    return Ok(CacheSnapshot::default());
                }

                match Self::load(&backup_path).await {
                    Ok(snapshot) => {
                        tracing::info!("Recovered cache from backup: {} DC rows", snapshot.dcs.len());
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!("Failed to restore cache file from backup: {}", restore_err);
                        }
                        Ok(snapshot)
                    }
                    Err(LoadFailure::Corrupt(backup_err)) | Err(LoadFailure::Io(backup_err)) => {
                        tracing::error!("Backup also unusable: {}. Starting with empty cache.", backup_err);
                        Ok(CacheSnapshot::default())
                    }
                }
            }
        }
    }

    async fn load(path: &Path) -> Result<CacheSnapshot, LoadFailure> {
        if !path.exists() {
            tracing::debug!("Cache file does not exist: {}", path.display());
            return Ok(CacheSnapshot::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadFailure::Io(Error::state_store(format!(
                "Failed to read cache file {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: CacheFileFormat = serde_json::from_str(&content).map_err(|e| {
            LoadFailure::Corrupt(Error::state_store(format!(
                "Failed to parse cache file {}: {}",
                path.display(),
                e
            )))
        })?;

        if file.version != CACHE_FILE_VERSION {
            tracing::warn!(
                "Cache file version mismatch: expected {}, got {}. Attempting to load anyway.",
                CACHE_FILE_VERSION,
                file.version
            );
        }

        Ok(file.snapshot)
    }

    /// Apply a mutation and write it through
    async fn mutate<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut CacheSnapshot) -> Result<(), Error>,
    {
        {
            let mut guard = self.state.write().await;
            f(&mut guard.snapshot)?;
            guard.dirty = true;
        }
        self.write_state().await
    }

    /// Write the snapshot to disk atomically
    async fn write_state(&self) -> Result<(), Error> {
        let _writer = self.write_lock.lock().await;

        let json = {
            let guard = self.state.read().await;
            let file = CacheFileFormat {
                version: CACHE_FILE_VERSION.to_string(),
                snapshot: guard.snapshot.clone(),
            };
            serde_json::to_string_pretty(&file)
                .map_err(|e| Error::state_store(format!("Failed to serialize cache: {}", e)))?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::state_store(format!("Failed to create temp file {}: {}", temp_path.display(), e))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!("Failed to write temp file {}: {}", temp_path.display(), e))
            })?;
            file.flush().await.map_err(|e| {
                Error::state_store(format!("Failed to flush temp file {}: {}", temp_path.display(), e))
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;
        tracing::trace!("Cache written to file: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get_ha_mode(&self) -> Result<Option<HaMode>, Error> {
        Ok(self.state.read().await.snapshot.ha_mode)
    }

    async fn set_ha_mode(&self, mode: HaMode) -> Result<(), Error> {
        self.mutate(|s| {
            s.ha_mode = Some(mode);
            Ok(())
        })
        .await
    }

    async fn get_state(&self) -> Result<Option<AffinityState>, Error> {
        Ok(self.state.read().await.snapshot.state)
    }

    async fn set_state(&self, state: AffinityState) -> Result<(), Error> {
        self.mutate(|s| {
            s.state = Some(state);
            Ok(())
        })
        .await
    }

    async fn get_client_site(&self) -> Result<Option<String>, Error> {
        Ok(self.state.read().await.snapshot.client_site.clone())
    }

    async fn set_client_site(&self, site: &str) -> Result<(), Error> {
        self.mutate(|s| {
            s.client_site = Some(site.to_string());
            Ok(())
        })
        .await
    }

    async fn get_affinitized_dc(&self, domain: &str) -> Result<Option<AffinitizedDc>, Error> {
        let guard = self.state.read().await;
        Ok(guard.snapshot.affinitized.get(&row_key(domain)).cloned())
    }

    async fn set_affinitized_dc(&self, dc: &AffinitizedDc) -> Result<(), Error> {
        self.mutate(|s| {
            s.affinitized.insert(row_key(&dc.domain_name), dc.clone());
            Ok(())
        })
        .await
    }

    async fn delete_affinitized_dc(&self, domain: &str) -> Result<(), Error> {
        self.mutate(|s| {
            s.affinitized.remove(&row_key(domain));
            Ok(())
        })
        .await
    }

    async fn list_dc_entries(&self, domain: &str) -> Result<Vec<DcCacheEntry>, Error> {
        Ok(self.state.read().await.snapshot.list_dc_entries(domain))
    }

    async fn get_dc_entry(&self, dc_name: &str) -> Result<Option<DcCacheEntry>, Error> {
        Ok(self.state.read().await.snapshot.dcs.get(&row_key(dc_name)).cloned())
    }

    async fn insert_dc_entry(&self, entry: &DcCacheEntry) -> Result<(), Error> {
        self.mutate(|s| s.insert_dc_entry(entry)).await
    }

    async fn update_dc_entry(&self, entry: &DcCacheEntry) -> Result<(), Error> {
        self.mutate(|s| s.update_dc_entry(entry)).await
    }

    async fn delete_dc_entry(&self, dc_name: &str) -> Result<(), Error> {
        self.mutate(|s| {
            s.delete_dc_entry(dc_name);
            Ok(())
        })
        .await
    }

    async fn purge_dc_entries(&self) -> Result<(), Error> {
        self.mutate(|s| {
            s.purge_dc_entries();
            Ok(())
        })
        .await
    }

    async fn get_heartbeat_status(&self, dc_name: &str) -> Result<Option<HeartbeatStatus>, Error> {
        Ok(self.state.read().await.snapshot.heartbeats.get(&row_key(dc_name)).cloned())
    }

    async fn set_heartbeat_status(&self, dc_name: &str, status: &HeartbeatStatus) -> Result<(), Error> {
        self.mutate(|s| {
            s.heartbeats.insert(row_key(dc_name), status.clone());
            Ok(())
        })
        .await
    }

    async fn delete_heartbeat_status(&self, dc_name: &str) -> Result<(), Error> {
        self.mutate(|s| {
            s.heartbeats.remove(&row_key(dc_name));
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty { self.write_state().await } else { Ok(()) }
    }
}
