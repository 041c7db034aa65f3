use std::collections::HashSet;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::{Instrument, info_span};

use crate::fingerprint::{Fingerprint, RequestId};
use crate::handler::{DefaultHandler, IdempotencyHandler, Rejection};
use crate::response::StoredResponse;
use crate::tracker::{RequestTracker, Tracked};

/// Header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared state handed to [`idempotency_middleware`] via axum's `State`.
#[derive(Clone)]
pub struct IdempotencyState {
    tracker: Arc<RequestTracker>,
    handler: Arc<dyn IdempotencyHandler>,
    bypass_methods: HashSet<Method>,
}

impl IdempotencyState {
    pub fn new(tracker: Arc<RequestTracker>) -> Self {
        Self {
            tracker,
            handler: Arc::new(DefaultHandler),
            bypass_methods: HashSet::from([Method::GET, Method::HEAD]),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn IdempotencyHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Replaces the set of methods that bypass tracking entirely.
    pub fn with_bypass_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.bypass_methods = methods.into_iter().collect();
        self
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }
}

/// Idempotency middleware for axum routers.
///
/// Attach with `axum::middleware::from_fn_with_state(state, idempotency_middleware)`.
/// Requests on bypass methods pass through untouched; everything else must
/// carry exactly one `Idempotency-Key` header and is admitted, replayed, or
/// rejected by the tracker.
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    request: Request,
    next: Next,
) -> Response {
    if state.bypass_methods.contains(request.method()) {
        return next.run(request).await;
    }

    let mut key_headers = request.headers().get_all(IDEMPOTENCY_KEY_HEADER).iter();
    let raw_key = match (key_headers.next(), key_headers.next()) {
        (None, _) => return state.handler.error_response(Rejection::MissingKey),
        (Some(_), Some(_)) => return state.handler.error_response(Rejection::MultipleKeys),
        // A key that is not visible ASCII is treated as absent.
        (Some(value), None) => match value.to_str() {
            Ok(value) => value.to_string(),
            Err(_) => return state.handler.error_response(Rejection::MissingKey),
        },
    };
    let request_id = RequestId::from_key(&state.handler.transform_key(&raw_key));

    // The body is consumed to fingerprint the request, then rebuilt for the
    // downstream handler.
    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "failed to read request body");
            return state.handler.error_response(Rejection::Internal);
        }
    };
    let fingerprint = Fingerprint::compute(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query(),
        &body_bytes,
    );
    let request = Request::from_parts(parts, Body::from(body_bytes.clone()));

    let span = info_span!("idempotency.request", request_id = %request_id);
    async {
        match state.tracker.track(&request_id, &fingerprint).await {
            Ok(Tracked::Proceed(guard)) => {
                // If the downstream handler panics, the unwind drops the
                // guard and the entry resolves to interrupted.
                let response = next.run(request).await;
                let stored = match capture_response(response).await {
                    Ok(stored) => stored,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to capture response body");
                        if let Err(abandon_err) = state.tracker.abandon(guard).await {
                            tracing::error!(error = %abandon_err, "failed to abandon entry");
                        }
                        return state.handler.error_response(Rejection::Internal);
                    }
                };
                match state.tracker.finalize(guard, stored.clone()).await {
                    Ok(expires_at) => render_stored(&stored, expires_at),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to finalize entry");
                        state.handler.error_response(Rejection::Internal)
                    }
                }
            }
            Ok(Tracked::Replay {
                response,
                expires_at,
            }) => render_stored(&response, expires_at),
            Ok(Tracked::Conflict) => state.handler.error_response(Rejection::Conflict),
            Ok(Tracked::Mismatch) => state.handler.error_response(Rejection::Mismatch),
            Ok(Tracked::Interrupted { expires_at }) => with_expires(
                state.handler.error_response(Rejection::Interrupted),
                expires_at,
            ),
            Err(err) => {
                tracing::error!(error = %err, "request tracking failed");
                state.handler.error_response(Rejection::Internal)
            }
        }
    }
    .instrument(span)
    .await
}

/// Buffers a response into a [`StoredResponse`] before anything reaches the
/// socket, so finalize always runs ahead of the flush.
async fn capture_response(response: Response) -> Result<StoredResponse, axum::Error> {
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await?;
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    Ok(StoredResponse {
        status: parts.status.as_u16(),
        headers,
        body: bytes.to_vec(),
    })
}

fn render_stored(stored: &StoredResponse, expires_at: DateTime<Utc>) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &stored.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder
        .header(header::EXPIRES, http_date(expires_at))
        .body(Body::from(stored.body.clone()))
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "failed to rebuild stored response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn with_expires(mut response: Response, expires_at: DateTime<Utc>) -> Response {
    if let Ok(value) = http_date(expires_at).parse() {
        response.headers_mut().insert(header::EXPIRES, value);
    }
    response
}

/// Formats an expiry as an RFC 7231 IMF-fixdate, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
