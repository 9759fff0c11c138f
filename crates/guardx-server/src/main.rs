//! # guardx-server: HTTP Service for the Policy Rewriter
//!
//! This binary crate exposes the guardx policy rewriter as a network service.
//! A row-level-security layer posts its policy set and receives the rewritten
//! query expression to install in front of the observation store.
//!
//! ## Architecture
//!
//! ```text
//! Security layer / benchmark harness
//!   |
//!   | HTTP POST /rewrite (policy-source JSON + algorithm choice)
//!   v
//! guardx-server (this binary)
//!   |
//!   +-> policy-source decoding (guardx-core)
//!   +-> optional overlap merge (guardx-factor)
//!   +-> factorization / guard selection / sequencing
//!   +-> query rendering
//!   |
//!   | HTTP response (rewritten query + summary)
//!   v
//! Security layer installs the WHERE clause
//! ```
//!
//! ## Endpoints
//!
//! - `GET  /health`   - Health check
//! - `GET  /catalog`  - The configured attribute catalog and cost constants
//! - `POST /rewrite`  - Rewrite a policy set into a guarded query
//!
//! ## Configuration
//!
//! The server listens on `0.0.0.0:3000`. Logging is controlled by the
//! `RUST_LOG` environment variable (defaults to `guardx=debug`).

mod routes;
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Structured logging via tracing; override the default with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("guardx=debug".parse().unwrap()),
        )
        .init();

    // Shared application state (catalog, cost model constants), one per server.
    let state = Arc::new(state::AppState::new());

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/catalog", get(routes::catalog))
        .route("/rewrite", post(routes::rewrite))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    tracing::info!("guardx-server listening on http://0.0.0.0:3000");
    axum::serve(listener, app).await.unwrap();
}
