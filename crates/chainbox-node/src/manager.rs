use std::{collections::HashMap, sync::Arc, time::Duration};

use chainbox_instance::{InstanceId, InstanceRecord};
use chrono::Utc;
use tokio::{sync::Mutex, task::AbortHandle};

use crate::launcher::{LaunchError, NodeLauncher};
use crate::node_handle::NodeHandle;
use crate::reaper;
use crate::store::{InstanceStore, StoreError};

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("no instance is running: {0}")]
    NotFound(InstanceId),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for InstanceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => InstanceError::NotFound(id),
            other => InstanceError::Store(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyCause {
    Killed,
    Expired,
    Shutdown,
}

impl DestroyCause {
    fn as_str(self) -> &'static str {
        match self {
            DestroyCause::Killed => "killed",
            DestroyCause::Expired => "expired",
            DestroyCause::Shutdown => "shutdown",
        }
    }
}

struct LiveInstance {
    handle: Box<dyn NodeHandle>,
    reaper: Option<AbortHandle>,
}

struct Inner {
    store: Arc<dyn InstanceStore>,
    launcher: Arc<dyn NodeLauncher>,
    ttl: Duration,
    live: Mutex<HashMap<InstanceId, LiveInstance>>,
}

/// Owns every node this process started.
///
/// The store decides liveness; the in-memory map only holds the process
/// handles so they can be signalled. Destroy removes the store entry first and
/// only the caller whose removal succeeded touches the handle.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<Inner>,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        launcher: Arc<dyn NodeLauncher>,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                ttl,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Launches a node, persists its record and arms its reaper.
    ///
    /// Either all three happen or the node is torn down and an error returned.
    pub async fn create(&self) -> Result<InstanceRecord, InstanceError> {
        let node = self.inner.launcher.launch().await?;

        let now = Utc::now();
        let ttl = chrono::Duration::seconds(self.inner.ttl.as_secs().min(i32::MAX as u64) as i64);
        let record = InstanceRecord {
            uuid: node.id.clone(),
            port: node.port,
            mnemonic: node.mnemonic,
            pid: node.pid,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        };

        // Handle goes in before the record so a destroy that sees the record
        // always finds something to signal.
        {
            let mut live = self.inner.live.lock().await;
            if live.contains_key(&record.uuid) {
                drop(live);
                node.handle.terminate();
                return Err(StoreError::DuplicateKey(record.uuid).into());
            }
            live.insert(
                record.uuid.clone(),
                LiveInstance {
                    handle: node.handle,
                    reaper: None,
                },
            );
        }

        if let Err(err) = self.inner.store.put(&record).await {
            if let Some(entry) = self.inner.live.lock().await.remove(&record.uuid) {
                entry.handle.terminate();
            }
            return Err(err.into());
        }

        let reaper = reaper::schedule(self.clone(), record.uuid.clone(), self.inner.ttl);
        {
            let mut live = self.inner.live.lock().await;
            match live.get_mut(&record.uuid) {
                Some(entry) => entry.reaper = Some(reaper),
                // Killed already; the reaper would find nothing anyway.
                None => reaper.abort(),
            }
        }

        tracing::info!(uuid = %record.uuid, instance = ?record.info(), pid = ?record.pid, "instance launched");
        Ok(record)
    }

    pub async fn is_live(&self, id: &InstanceId) -> bool {
        self.inner.store.exists(id).await
    }

    pub async fn lookup(&self, id: &InstanceId) -> Result<InstanceRecord, InstanceError> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Removes the record and stops the node. Returns `false` when another
    /// caller got there first (or the id never existed).
    pub async fn destroy(&self, id: &InstanceId, cause: DestroyCause) -> Result<bool, InstanceError> {
        if !self.inner.store.remove(id).await? {
            return Ok(false);
        }

        let entry = self.inner.live.lock().await.remove(id);
        match entry {
            Some(entry) => {
                if cause != DestroyCause::Expired
                    && let Some(reaper) = entry.reaper
                {
                    reaper.abort();
                }
                tracing::info!(uuid = %id, pid = ?entry.handle.pid(), cause = cause.as_str(), "killing node");
                entry.handle.terminate();
            }
            None => {
                tracing::warn!(uuid = %id, cause = cause.as_str(), "record removed but no process handle is held");
            }
        }
        Ok(true)
    }

    /// Explicit kill. An unknown or already-destroyed id is `NotFound`.
    pub async fn kill(&self, id: &InstanceId) -> Result<(), InstanceError> {
        if self.destroy(id, DestroyCause::Killed).await? {
            Ok(())
        } else {
            Err(InstanceError::NotFound(id.clone()))
        }
    }

    /// Records in the store with no process owned by this manager, e.g. left
    /// behind by a previous run.
    pub async fn stale_records(&self) -> Result<Vec<InstanceId>, InstanceError> {
        let stored = self.inner.store.list().await?;
        let live = self.inner.live.lock().await;
        Ok(stored.into_iter().filter(|id| !live.contains_key(id)).collect())
    }

    /// Deletes records no process of this manager backs. Their nodes died
    /// with the previous gateway (parent-death signal), so the ports they name
    /// are free to be handed to new instances.
    pub async fn purge_stale(&self) -> Result<Vec<InstanceId>, InstanceError> {
        let stale = self.stale_records().await?;
        let mut purged = Vec::with_capacity(stale.len());
        for id in stale {
            let info = self.inner.store.get(&id).await.ok().map(|r| r.info());
            if self.inner.store.remove(&id).await? {
                tracing::warn!(uuid = %id, instance = ?info, "purged stale instance record");
                purged.push(id);
            }
        }
        Ok(purged)
    }

    pub async fn live_count(&self) -> usize {
        self.inner.live.lock().await.len()
    }

    /// Destroys every instance this manager started.
    pub async fn shutdown(&self) {
        let ids: Vec<InstanceId> = self.inner.live.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.destroy(&id, DestroyCause::Shutdown).await {
                tracing::warn!(uuid = %id, %err, "shutdown: destroy failed");
            }
        }
    }
}
