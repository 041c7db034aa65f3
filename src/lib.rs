#![forbid(unsafe_code)]

pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod response;
pub mod store;
pub mod tracker;

pub use error::{Result, TrackerError};
pub use fingerprint::{Fingerprint, RequestId};
pub use handler::{DefaultHandler, IdempotencyHandler, Rejection};
pub use middleware::{IDEMPOTENCY_KEY_HEADER, IdempotencyState, idempotency_middleware};
pub use response::StoredResponse;
pub use store::{InMemoryStore, RequestStore, StoreConfig};
pub use tracker::{AdmissionGuard, RequestTracker, RequestTrackerBuilder, Tracked, TrackerConfig};
