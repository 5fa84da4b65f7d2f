use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chainbox_instance::{InstanceId, InstanceRecord};
use tokio::io::AsyncWriteExt;

/// Default on-disk location, one file per instance.
pub const DEFAULT_INSTANCES_DIR: &str = "/tmp/instances-by-uuid";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error("instance already exists: {0}")]
    DuplicateKey(InstanceId),
    #[error("invalid instance id: {0:?}")]
    InvalidId(String),
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record for {id}: {source}")]
    Serde {
        id: InstanceId,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value persistence of instance records.
///
/// Presence of a key is the definition of "instance is alive". `remove`
/// reports `true` to exactly one caller per stored record, which is what makes
/// destroy idempotent under concurrency.
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    async fn put(&self, record: &InstanceRecord) -> Result<(), StoreError>;
    async fn get(&self, id: &InstanceId) -> Result<InstanceRecord, StoreError>;
    async fn exists(&self, id: &InstanceId) -> bool;
    async fn remove(&self, id: &InstanceId) -> Result<bool, StoreError>;
    async fn list(&self) -> Result<Vec<InstanceId>, StoreError>;
}

fn io_err(op: &'static str, path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Filesystem-as-database store: `<dir>/<uuid>` holds the JSON record.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("create dir", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &InstanceId) -> Result<PathBuf, StoreError> {
        // The field is public; re-validate before it becomes a path component.
        match InstanceId::parse(id.as_str()) {
            Some(parsed) if parsed == *id => Ok(self.dir.join(id.as_str())),
            _ => Err(StoreError::InvalidId(id.0.clone())),
        }
    }
}

#[async_trait::async_trait]
impl InstanceStore for FileStore {
    async fn put(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.uuid)?;
        let data = serde_json::to_vec(record).map_err(|source| StoreError::Serde {
            id: record.uuid.clone(),
            source,
        })?;

        // Write aside, then hard-link into place: the link fails if the key
        // exists and readers never observe a half-written file.
        let tmp = self
            .dir
            .join(format!(".{}.{:016x}.tmp", record.uuid, rand::random::<u64>()));
        let write = async {
            let mut f = tokio::fs::File::create(&tmp).await?;
            f.write_all(&data).await?;
            f.flush().await?;
            f.sync_all().await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err("write", &tmp, e));
        }

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::DuplicateKey(record.uuid.clone()))
            }
            Err(e) => Err(io_err("persist", &path, e)),
        }
    }

    async fn get(&self, id: &InstanceId) -> Result<InstanceRecord, StoreError> {
        let path = self.record_path(id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(io_err("read", &path, e)),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Serde {
            id: id.clone(),
            source,
        })
    }

    async fn exists(&self, id: &InstanceId) -> bool {
        let Ok(path) = self.record_path(id) else {
            return false;
        };
        tokio::fs::metadata(&path).await.is_ok()
    }

    async fn remove(&self, id: &InstanceId) -> Result<bool, StoreError> {
        let path = self.record_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("remove", &path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        let mut rd = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_err("read dir", &self.dir, e))?;
        let mut out = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| io_err("read dir", &self.dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Temp files and foreign files never parse as ids.
            if let Some(id) = InstanceId::parse(name)
                && id.as_str() == name
            {
                out.push(id);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// In-memory store with the same semantics as [`FileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<InstanceId, InstanceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<InstanceId, InstanceRecord>) -> T) -> T {
        let mut guard = match self.records.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemoryStore {
    async fn put(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        self.with_records(|m| {
            if m.contains_key(&record.uuid) {
                return Err(StoreError::DuplicateKey(record.uuid.clone()));
            }
            m.insert(record.uuid.clone(), record.clone());
            Ok(())
        })
    }

    async fn get(&self, id: &InstanceId) -> Result<InstanceRecord, StoreError> {
        self.with_records(|m| m.get(id).cloned())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn exists(&self, id: &InstanceId) -> bool {
        self.with_records(|m| m.contains_key(id))
    }

    async fn remove(&self, id: &InstanceId) -> Result<bool, StoreError> {
        Ok(self.with_records(|m| m.remove(id).is_some()))
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        let mut ids: Vec<InstanceId> = self.with_records(|m| m.keys().cloned().collect());
        ids.sort();
        Ok(ids)
    }
}
