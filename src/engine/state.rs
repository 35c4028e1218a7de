// ABOUTME: State store - persists the last committed database signature per source/target pair
// ABOUTME: JSON file with read-modify-write serialized by an in-process lock

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::detector::DatabaseSignature;
use crate::error::{Result, SyncError};

const STATE_VERSION: u32 = 1;

/// Last committed signature of one (source, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateRecord {
    /// Source identity (no password)
    pub source: String,
    /// Target identity (no password)
    pub target: String,
    pub signature: DatabaseSignature,
    /// Fingerprint of the include/exclude filter the signature was taken with
    pub filter_fingerprint: String,
    /// When the signature was committed
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl SyncStateRecord {
    pub fn new(
        source: &str,
        target: &str,
        signature: DatabaseSignature,
        filter_fingerprint: &str,
    ) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            signature,
            filter_fingerprint: filter_fingerprint.to_string(),
            recorded_at: chrono::Utc::now(),
        }
    }
}

/// On-disk layout of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    /// Version of the state format for future migrations
    version: u32,
    /// Records keyed by pair key (see [`StateStore::pair_key`])
    pairs: BTreeMap<String, SyncStateRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            pairs: BTreeMap::new(),
        }
    }
}

/// File-backed store of [`SyncStateRecord`]s.
///
/// Records are never deleted automatically. Writes go to a temporary file
/// that is renamed over the state file, so a crash never leaves a torn file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Get the default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".tablesync/sync-state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key of a directed pair. `a -> b` and `b -> a` are different pairs.
    pub fn pair_key(source_identity: &str, target_identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_identity.as_bytes());
        hasher.update(b"->");
        hasher.update(target_identity.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, pair_key: &str) -> Result<Option<SyncStateRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.pairs.get(pair_key).cloned())
    }

    /// Insert or overwrite the record of a pair.
    pub async fn put(&self, pair_key: &str, record: SyncStateRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.pairs.insert(pair_key.to_string(), record);
        self.save(&file).await
    }

    fn error(&self, source: impl Into<crate::error::BoxError>) -> SyncError {
        SyncError::State {
            path: self.path.display().to_string(),
            source: source.into(),
        }
    }

    /// Load the state file; a missing file is an empty state.
    async fn load(&self) -> Result<StateFile> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateFile::default()),
            Err(e) => return Err(self.error(e)),
        };
        let file: StateFile = serde_json::from_str(&contents).map_err(|e| self.error(e))?;
        if file.version > STATE_VERSION {
            return Err(self.error(format!(
                "state format version {} is newer than supported version {}",
                file.version, STATE_VERSION
            )));
        }
        Ok(file)
    }

    async fn save(&self, file: &StateFile) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| self.error(e))?;
        }

        let contents = serde_json::to_string_pretty(file).map_err(|e| self.error(e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).await.map_err(|e| self.error(e))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| self.error(e))?;
        tracing::debug!("Saved sync state to {}", self.path.display());
        Ok(())
    }
}
