#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, header};
use chrono::{DateTime, Utc};

use idemgate::store::{CacheEntry, RequestState};
use idemgate::{
    Fingerprint, IdempotencyState, InMemoryStore, RequestId, RequestStore, RequestTracker,
    RequestTrackerBuilder, Result, TrackerConfig, idempotency_middleware,
};

pub fn rid(key: &str) -> RequestId {
    RequestId::from_key(key)
}

pub fn fp(method: &str, path: &str, body: &[u8]) -> Fingerprint {
    Fingerprint::compute(method, path, None, body)
}

/// Config with a short concurrent wait so conflict tests stay fast.
pub fn short_wait_config() -> TrackerConfig {
    TrackerConfig {
        max_concurrent_wait: Duration::from_millis(50),
        ..TrackerConfig::default()
    }
}

pub async fn tracker_with(config: TrackerConfig) -> Arc<RequestTracker> {
    Arc::new(
        RequestTrackerBuilder::new()
            .with_config(config)
            .build()
            .await
            .expect("build tracker"),
    )
}

pub async fn default_tracker() -> Arc<RequestTracker> {
    tracker_with(TrackerConfig::default()).await
}

/// Wraps a router with the idempotency middleware.
pub fn layered(router: Router, state: IdempotencyState) -> Router {
    router.layer(axum::middleware::from_fn_with_state(
        state,
        idempotency_middleware,
    ))
}

pub fn post_json(path: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("build request")
}

pub fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .expect("build request")
}

pub async fn body_text(body: Body) -> String {
    let bytes = to_bytes(body, usize::MAX).await.expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// Extracts `errors[0].message` from a JSON error body.
pub fn error_message(body: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(body).expect("json body");
    value["errors"][0]["message"]
        .as_str()
        .expect("error message")
        .to_string()
}

/// Store wrapper counting operations, to assert bypassed methods never reach
/// the store.
pub struct CountingStore {
    inner: InMemoryStore,
    pub setups: AtomicU64,
    pub inserts: AtomicU64,
    pub lookups: AtomicU64,
    pub updates: AtomicU64,
    pub prunes: AtomicU64,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::with_table("counted_requests"),
            setups: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            prunes: AtomicU64::new(0),
        }
    }

    /// Total data-path operations seen (setup excluded).
    pub fn operations(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
            + self.lookups.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.prunes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestStore for CountingStore {
    async fn setup(&self) -> Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.inner.setup().await
    }

    async fn insert(
        &self,
        id: &RequestId,
        state: RequestState,
        fingerprint: &Fingerprint,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(id, state, fingerprint, expires_at).await
    }

    async fn lookup(&self, id: &RequestId) -> Result<Option<CacheEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(id).await
    }

    async fn update(
        &self,
        id: &RequestId,
        state: RequestState,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, state, expires_at).await
    }

    async fn prune(&self) -> Result<usize> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        self.inner.prune().await
    }
}
