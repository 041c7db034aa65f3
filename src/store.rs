use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::fingerprint::{Fingerprint, RequestId};
use crate::response::StoredResponse;

/// Lifecycle state of one tracked request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// An admitted builder is executing the request.
    Processing,
    /// The builder finalized; the captured response is replayed to retries.
    Completed(StoredResponse),
    /// The builder died without finalizing; side effects are unknown.
    Interrupted,
}

/// Entry held by a store, one per request id.
///
/// The fingerprint is immutable after insertion; only the state and expiry
/// change over the entry's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub state: RequestState,
    pub fingerprint: Fingerprint,
    pub expires_at: DateTime<Utc>,
}

/// Pluggable key-to-state backing for the tracker.
///
/// The default is in-memory; a SQL- or Redis-backed implementation is a
/// drop-in replacement and the tracker's state machine is unchanged.
/// Insert, lookup, and update must be atomic with respect to each other.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Idempotent initialization. Validates configuration.
    async fn setup(&self) -> Result<()>;

    /// Creates the entry for `id`, rejecting with
    /// [`TrackerError::AlreadyExists`] if one is present.
    async fn insert(
        &self,
        id: &RequestId,
        state: RequestState,
        fingerprint: &Fingerprint,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns the current entry verbatim, or `None`.
    async fn lookup(&self, id: &RequestId) -> Result<Option<CacheEntry>>;

    /// Mutates state and expiry, leaving the fingerprint untouched. Rejects
    /// with [`TrackerError::NotFound`] if the entry is absent.
    async fn update(
        &self,
        id: &RequestId,
        state: RequestState,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Removes entries whose expiry has passed, in bounded batches. Returns
    /// the number of entries removed this pass.
    async fn prune(&self) -> Result<usize>;
}

/// Configuration for [`InMemoryStore`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Logical table name the store registers under. Required.
    pub table_name: Option<String>,
}

/// Upper bound on entries removed by a single prune pass so one pass never
/// holds the write lock for long.
const PRUNE_BATCH: usize = 1024;

/// In-memory store used by default and in tests.
///
/// Backed by a `RwLock`ed map: concurrent readers, serialized writers, no
/// awaits while a lock is held.
pub struct InMemoryStore {
    config: StoreConfig,
    entries: RwLock<HashMap<RequestId, CacheEntry>>,
}

impl InMemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store preconfigured with a table name, for embedding and tests.
    pub fn with_table(name: impl Into<String>) -> Self {
        Self::new(StoreConfig {
            table_name: Some(name.into()),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<RequestId, CacheEntry>>> {
        self.entries.read().map_err(|_| TrackerError::StateCorrupted {
            reason: "store lock poisoned".into(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<RequestId, CacheEntry>>> {
        self.entries.write().map_err(|_| TrackerError::StateCorrupted {
            reason: "store lock poisoned".into(),
        })
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn setup(&self) -> Result<()> {
        match self.config.table_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(()),
            _ => Err(TrackerError::MissingConfig { key: "table_name" }),
        }
    }

    async fn insert(
        &self,
        id: &RequestId,
        state: RequestState,
        fingerprint: &Fingerprint,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.write()?;
        if entries.contains_key(id) {
            return Err(TrackerError::AlreadyExists {
                request_id: id.to_string(),
            });
        }
        entries.insert(
            id.clone(),
            CacheEntry {
                state,
                fingerprint: fingerprint.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn lookup(&self, id: &RequestId) -> Result<Option<CacheEntry>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn update(
        &self,
        id: &RequestId,
        state: RequestState,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.write()?;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.state = state;
                entry.expires_at = expires_at;
                Ok(())
            }
            None => Err(TrackerError::NotFound {
                request_id: id.to_string(),
            }),
        }
    }

    async fn prune(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = self.write()?;
        let expired: Vec<RequestId> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .take(PRUNE_BATCH)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        Ok(expired.len())
    }
}
