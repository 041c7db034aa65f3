use thiserror::Error;

/// Unified result type for the request tracker.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors emitted by the tracker, its store, and the builder registry.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A required store configuration key was not provided.
    #[error("store configuration is missing required key {key}")]
    MissingConfig { key: &'static str },

    /// An insert raced with an existing entry for the same request id.
    #[error("an entry already exists for request id {request_id}")]
    AlreadyExists { request_id: String },

    /// An update targeted a request id with no stored entry.
    #[error("no entry found for request id {request_id}")]
    NotFound { request_id: String },

    /// A live builder is already registered for the request id.
    #[error("a builder is already registered for request id {request_id}")]
    AlreadyRegistered { request_id: String },

    /// Shared state is unusable (poisoned lock, registry/store divergence).
    #[error("tracker state corrupted: {reason}")]
    StateCorrupted { reason: String },

    /// Catch-all for lower-level errors from pluggable implementations.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
