use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::{Result, TrackerError};
use crate::fingerprint::RequestId;
use crate::response::StoredResponse;

/// Terminal signal broadcast on a builder's slot.
#[derive(Clone, Debug)]
pub(crate) enum BuilderSignal {
    Finished {
        response: StoredResponse,
        expires_at: DateTime<Utc>,
    },
    Died {
        expires_at: DateTime<Utc>,
    },
}

/// Outcome of waiting for an in-flight builder.
#[derive(Clone, Debug)]
pub enum WaitOutcome {
    /// The builder finalized; the recorded response is on file.
    Finished {
        response: StoredResponse,
        expires_at: DateTime<Utc>,
    },
    /// The builder terminated abnormally before finalizing.
    Died { expires_at: DateTime<Utc> },
    /// The builder did not finish within the wait.
    StillRunning,
    /// No builder is registered for the request id.
    NoBuilder,
}

impl From<BuilderSignal> for WaitOutcome {
    fn from(signal: BuilderSignal) -> Self {
        match signal {
            BuilderSignal::Finished {
                response,
                expires_at,
            } => WaitOutcome::Finished {
                response,
                expires_at,
            },
            BuilderSignal::Died { expires_at } => WaitOutcome::Died { expires_at },
        }
    }
}

type Slot = watch::Sender<Option<BuilderSignal>>;

/// Tracks which request ids currently have an in-flight builder.
///
/// A slot whose value is `None` is live; a slot carrying a terminal signal
/// belongs to a builder that already finished or died and is torn down at
/// deregistration or replaced at the next registration.
#[derive(Default)]
pub struct BuilderRegistry {
    slots: Mutex<HashMap<RequestId, Slot>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RequestId, Slot>>> {
        self.slots.lock().map_err(|_| TrackerError::StateCorrupted {
            reason: "builder registry lock poisoned".into(),
        })
    }

    /// Registers a live builder for `id`, returning the sender half the
    /// builder signals through. Fails if a live builder already holds the id.
    pub(crate) fn register(&self, id: &RequestId) -> Result<Slot> {
        let mut slots = self.lock()?;
        if let Some(existing) = slots.get(id) {
            if existing.borrow().is_none() {
                return Err(TrackerError::AlreadyRegistered {
                    request_id: id.to_string(),
                });
            }
            // Stale slot of a builder that already signalled; its entry was
            // reclaimed without a deregistration. Replace it.
            slots.remove(id);
        }
        let (sender, _receiver) = watch::channel(None);
        slots.insert(id.clone(), sender.clone());
        Ok(sender)
    }

    /// Blocks up to `wait` for the registered builder to reach a terminal
    /// signal.
    pub async fn wait_for(&self, id: &RequestId, wait: Duration) -> Result<WaitOutcome> {
        let mut receiver = {
            let slots = self.lock()?;
            match slots.get(id) {
                Some(sender) => sender.subscribe(),
                None => return Ok(WaitOutcome::NoBuilder),
            }
        };

        let current = receiver.borrow().clone();
        if let Some(signal) = current {
            return Ok(signal.into());
        }

        match tokio::time::timeout(wait, receiver.changed()).await {
            Err(_) => Ok(WaitOutcome::StillRunning),
            Ok(_) => {
                // On a closed channel the last value is still observable;
                // a missing signal means the slot was torn down and the
                // store holds the authoritative state.
                let signal = receiver.borrow().clone();
                match signal {
                    Some(signal) => Ok(signal.into()),
                    None => Ok(WaitOutcome::NoBuilder),
                }
            }
        }
    }

    /// Removes the slot for `id`. Idempotent.
    pub fn deregister(&self, id: &RequestId) -> Result<()> {
        self.lock()?.remove(id);
        Ok(())
    }
}
