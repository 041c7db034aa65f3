use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, info_span};

use crate::error::{Result, TrackerError};
use crate::fingerprint::{Fingerprint, RequestId};
use crate::metrics::TrackerMetrics;
use crate::registry::{BuilderRegistry, BuilderSignal, WaitOutcome};
use crate::response::StoredResponse;
use crate::store::{InMemoryStore, RequestState, RequestStore};

/// Tunables for the tracker. All durations are wall-clock.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Retention for completed and interrupted entries.
    pub cached_ttl: Duration,
    /// Upper bound on how long an entry may stay processing when the crash
    /// signal is lost; the pruner reclaims it afterwards.
    pub processing_ttl: Duration,
    /// How often the pruner pass runs.
    pub prune_interval: Duration,
    /// How long a retry waits for an in-flight builder before conflicting.
    pub max_concurrent_wait: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cached_ttl: Duration::from_secs(60 * 60 * 24),
            processing_ttl: Duration::from_secs(60 * 60 * 24),
            prune_interval: Duration::from_secs(60),
            max_concurrent_wait: Duration::from_secs(30),
        }
    }
}

/// Outcome of a [`RequestTracker::track`] call.
#[derive(Debug)]
pub enum Tracked {
    /// The caller owns the request and must finalize or abandon the guard.
    Proceed(AdmissionGuard),
    /// A completed response is on file; return it without re-executing.
    Replay {
        response: StoredResponse,
        expires_at: DateTime<Utc>,
    },
    /// Another builder holds the key and did not finish within the wait.
    Conflict,
    /// The key was previously used with a different fingerprint.
    Mismatch,
    /// A prior attempt crashed; its side effects are unknown.
    Interrupted { expires_at: DateTime<Utc> },
}

/// Proof of admission handed to the builder that owns the request.
///
/// Dropping the guard without [`RequestTracker::finalize`] or
/// [`RequestTracker::abandon`] broadcasts the builder's death to waiters;
/// the store entry is repaired to interrupted on the next access to the key.
pub struct AdmissionGuard {
    request_id: RequestId,
    sender: watch::Sender<Option<BuilderSignal>>,
    cached_ttl: Duration,
    finalized: bool,
}

impl AdmissionGuard {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("request_id", &self.request_id)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        let expires_at = Utc::now() + self.cached_ttl;
        self.sender
            .send_replace(Some(BuilderSignal::Died { expires_at }));
    }
}

/// Shrink the per-key lock table once it reaches this many entries.
const KEY_LOCK_GC_WATERMARK: usize = 256;

/// Coordinates the store and the builder registry; owns the state machine
/// that makes admission linearizable per request id.
pub struct RequestTracker {
    store: Arc<dyn RequestStore>,
    registry: BuilderRegistry,
    config: TrackerConfig,
    metrics: TrackerMetrics,
    key_locks: Mutex<HashMap<RequestId, Weak<tokio::sync::Mutex<()>>>>,
}

impl RequestTracker {
    /// Admits, replays, or rejects a request for `id`.
    ///
    /// Exactly one concurrent caller per id observes [`Tracked::Proceed`];
    /// the rest wait for that builder and observe a terminal outcome. May
    /// block up to `max_concurrent_wait` while another builder is in flight.
    pub async fn track(&self, id: &RequestId, fingerprint: &Fingerprint) -> Result<Tracked> {
        let span = info_span!("idempotency.track", request_id = %id);
        async {
            let started = Instant::now();
            let key_lock = self.key_lock(id)?;

            {
                let _admission = key_lock.lock().await;
                match self.store.lookup(id).await? {
                    None => {
                        let expires_at = Utc::now() + self.config.processing_ttl;
                        self.store
                            .insert(id, RequestState::Processing, fingerprint, expires_at)
                            .await?;
                        let sender = self.registry.register(id)?;
                        self.metrics.record_admitted(started.elapsed());
                        return Ok(Tracked::Proceed(AdmissionGuard {
                            request_id: id.clone(),
                            sender,
                            cached_ttl: self.config.cached_ttl,
                            finalized: false,
                        }));
                    }
                    Some(entry) if entry.fingerprint != *fingerprint => {
                        self.metrics.record_mismatch();
                        return Ok(Tracked::Mismatch);
                    }
                    Some(entry) => match entry.state {
                        RequestState::Completed(response) => {
                            self.metrics.record_replayed();
                            return Ok(Tracked::Replay {
                                response,
                                expires_at: entry.expires_at,
                            });
                        }
                        RequestState::Interrupted => {
                            self.metrics.record_interrupted();
                            return Ok(Tracked::Interrupted {
                                expires_at: entry.expires_at,
                            });
                        }
                        // Wait for the in-flight builder with the admission
                        // lock released, so it can finalize.
                        RequestState::Processing => {}
                    },
                }
            }

            match self
                .registry
                .wait_for(id, self.config.max_concurrent_wait)
                .await?
            {
                WaitOutcome::Finished {
                    response,
                    expires_at,
                } => {
                    self.metrics.record_replayed();
                    Ok(Tracked::Replay {
                        response,
                        expires_at,
                    })
                }
                WaitOutcome::StillRunning => {
                    self.metrics.record_conflict();
                    Ok(Tracked::Conflict)
                }
                WaitOutcome::Died { expires_at } => {
                    let expires_at = self.repair_interrupted(&key_lock, id, expires_at).await?;
                    self.metrics.record_interrupted();
                    Ok(Tracked::Interrupted { expires_at })
                }
                WaitOutcome::NoBuilder => self.resolve_missing_builder(&key_lock, id).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Records the captured response for an admitted request and releases
    /// waiters with it. Returns the entry's new expiry.
    pub async fn finalize(
        &self,
        mut guard: AdmissionGuard,
        response: StoredResponse,
    ) -> Result<DateTime<Utc>> {
        let id = guard.request_id.clone();
        let span = info_span!("idempotency.finalize", request_id = %id, interrupted = false);
        async {
            let key_lock = self.key_lock(&id)?;
            let _admission = key_lock.lock().await;
            let expires_at = Utc::now() + self.config.cached_ttl;
            self.store
                .update(&id, RequestState::Completed(response.clone()), expires_at)
                .await?;
            // Waiters are released only after the store transition, so a
            // waiter that sees the response also sees the completed entry.
            guard.finalized = true;
            guard.sender.send_replace(Some(BuilderSignal::Finished {
                response,
                expires_at,
            }));
            self.registry.deregister(&id)?;
            Ok(expires_at)
        }
        .instrument(span)
        .await
    }

    /// Marks an admitted request interrupted without a response, e.g. when
    /// the response could not be captured. Returns the entry's new expiry.
    pub async fn abandon(&self, mut guard: AdmissionGuard) -> Result<DateTime<Utc>> {
        let id = guard.request_id.clone();
        let span = info_span!("idempotency.finalize", request_id = %id, interrupted = true);
        async {
            let key_lock = self.key_lock(&id)?;
            let _admission = key_lock.lock().await;
            let expires_at = Utc::now() + self.config.cached_ttl;
            self.store
                .update(&id, RequestState::Interrupted, expires_at)
                .await?;
            guard.finalized = true;
            guard
                .sender
                .send_replace(Some(BuilderSignal::Died { expires_at }));
            self.registry.deregister(&id)?;
            self.metrics.record_interrupted();
            Ok(expires_at)
        }
        .instrument(span)
        .await
    }

    /// Starts the periodic pruner on a dedicated task.
    pub fn spawn_pruner(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.prune_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match tracker.store.prune().await {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::debug!(removed, "pruned expired idempotency entries");
                    }
                    Err(err) => tracing::warn!(error = %err, "prune pass failed"),
                }
            }
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Metrics counters, for telemetry export or testing.
    pub fn metrics(&self) -> &TrackerMetrics {
        &self.metrics
    }

    /// Transitions a processing entry whose builder died to interrupted.
    /// Concurrent repairs are harmless: the first one wins, the rest observe
    /// the terminal entry.
    async fn repair_interrupted(
        &self,
        key_lock: &Arc<tokio::sync::Mutex<()>>,
        id: &RequestId,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let _admission = key_lock.lock().await;
        let repaired = match self.store.lookup(id).await? {
            Some(entry) if entry.state == RequestState::Processing => {
                self.store
                    .update(id, RequestState::Interrupted, expires_at)
                    .await?;
                expires_at
            }
            Some(entry) => entry.expires_at,
            None => expires_at,
        };
        self.registry.deregister(id)?;
        Ok(repaired)
    }

    /// Resolves a processing entry that has no registered builder: the
    /// builder finalized between our lookup and subscription, or its death
    /// signal was lost entirely (stale entry from a previous run).
    async fn resolve_missing_builder(
        &self,
        key_lock: &Arc<tokio::sync::Mutex<()>>,
        id: &RequestId,
    ) -> Result<Tracked> {
        let _admission = key_lock.lock().await;
        match self.store.lookup(id).await? {
            Some(entry) => match entry.state {
                RequestState::Completed(response) => {
                    self.metrics.record_replayed();
                    Ok(Tracked::Replay {
                        response,
                        expires_at: entry.expires_at,
                    })
                }
                RequestState::Interrupted => {
                    self.metrics.record_interrupted();
                    Ok(Tracked::Interrupted {
                        expires_at: entry.expires_at,
                    })
                }
                RequestState::Processing => {
                    let expires_at = Utc::now() + self.config.cached_ttl;
                    self.store
                        .update(id, RequestState::Interrupted, expires_at)
                        .await?;
                    self.registry.deregister(id)?;
                    self.metrics.record_interrupted();
                    Ok(Tracked::Interrupted { expires_at })
                }
            },
            // The entry expired and was pruned while we waited; the client's
            // retry will be admitted fresh.
            None => {
                self.metrics.record_conflict();
                Ok(Tracked::Conflict)
            }
        }
    }

    /// Per-key admission lock with lazy creation and garbage collection.
    fn key_lock(&self, id: &RequestId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .key_locks
            .lock()
            .map_err(|_| TrackerError::StateCorrupted {
                reason: "key lock table poisoned".into(),
            })?;
        if locks.len() >= KEY_LOCK_GC_WATERMARK {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }
        if let Some(existing) = locks.get(id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(id.clone(), Arc::downgrade(&fresh));
        Ok(fresh)
    }
}

/// Builder for configuring a tracker instance.
pub struct RequestTrackerBuilder {
    store: Arc<dyn RequestStore>,
    config: TrackerConfig,
    metrics: TrackerMetrics,
}

impl Default for RequestTrackerBuilder {
    fn default() -> Self {
        Self {
            store: Arc::new(InMemoryStore::with_table("idemgate_requests")),
            config: TrackerConfig::default(),
            metrics: TrackerMetrics::new(),
        }
    }
}

impl RequestTrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: TrackerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validates the store configuration and builds the tracker.
    pub async fn build(self) -> Result<RequestTracker> {
        self.store.setup().await?;
        Ok(RequestTracker {
            store: self.store,
            registry: BuilderRegistry::new(),
            config: self.config,
            metrics: self.metrics,
            key_locks: Mutex::new(HashMap::new()),
        })
    }
}
