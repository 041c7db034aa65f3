use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{Value, json};

use idemgate::{IdempotencyState, RequestTrackerBuilder, TrackerConfig, idempotency_middleware};

/// Demo server exposing a mutating route behind the idempotency middleware.
#[derive(Parser, Debug)]
#[command(author, version, about = "idemgate demo server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Retention for completed and interrupted entries, in seconds.
    #[arg(long, default_value_t = 86_400)]
    cached_ttl_secs: u64,

    /// How long a retry waits for an in-flight request, in seconds.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = TrackerConfig {
        cached_ttl: Duration::from_secs(args.cached_ttl_secs),
        max_concurrent_wait: Duration::from_secs(args.wait_secs),
        ..TrackerConfig::default()
    };
    let tracker = Arc::new(
        RequestTrackerBuilder::new()
            .with_config(config)
            .build()
            .await?,
    );
    tracker.spawn_pruner();

    let state = IdempotencyState::new(Arc::clone(&tracker));
    let app = Router::new()
        .route("/orders", post(create_order))
        .route("/healthz", get(healthz))
        .layer(axum::middleware::from_fn_with_state(
            state,
            idempotency_middleware,
        ));

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, "idemgate demo listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn create_order(Json(payload): Json<Value>) -> Json<Value> {
    tracing::info!(%payload, "creating order");
    Json(json!({"status": "created", "payload": payload}))
}

async fn healthz() -> &'static str {
    "ok"
}
