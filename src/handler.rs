use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Client-visible reasons the middleware rejects or halts a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// No `Idempotency-Key` header was sent on a tracked method.
    MissingKey,
    /// More than one `Idempotency-Key` header was sent.
    MultipleKeys,
    /// Another request with the same key is currently being processed.
    Conflict,
    /// The key was reused with a different payload or URI.
    Mismatch,
    /// The original request crashed and cannot be recovered.
    Interrupted,
    /// The tracker itself failed; details are logged, not exposed.
    Internal,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::MissingKey | Rejection::MultipleKeys => StatusCode::BAD_REQUEST,
            Rejection::Conflict => StatusCode::CONFLICT,
            Rejection::Mismatch => StatusCode::UNPROCESSABLE_ENTITY,
            Rejection::Interrupted | Rejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Rejection::MissingKey => "No idempotency key found.",
            Rejection::MultipleKeys => "Only one `Idempotency-Key` header can be sent.",
            Rejection::Conflict => {
                "A request with the same `Idempotency-Key` is currently being processed."
            }
            Rejection::Mismatch => {
                "This `Idempotency-Key` can't be reused with a different payload or URI."
            }
            Rejection::Interrupted => {
                "The original request was interrupted and can't be recovered as it's in an unknown state."
            }
            Rejection::Internal => "An unexpected error occurred while tracking the request.",
        }
    }
}

/// Hook customizing how raw keys are scoped and how rejections render.
pub trait IdempotencyHandler: Send + Sync {
    /// Maps the raw header value to the value hashed into the request id.
    /// Override to scope keys, e.g. per authenticated user.
    fn transform_key(&self, raw_key: &str) -> String {
        raw_key.to_string()
    }

    /// Renders a rejection as an HTTP response.
    fn error_response(&self, rejection: Rejection) -> Response {
        let body = json!({"errors": [{"message": rejection.message()}]});
        (rejection.status(), Json(body)).into_response()
    }
}

/// Default handler: identity key transform, JSON error bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHandler;

impl IdempotencyHandler for DefaultHandler {}
