//! # HTTP Route Handlers
//!
//! ## Rewrite Pipeline
//!
//! The `/rewrite` handler runs the whole pipeline for one request:
//!
//! 1. **Decode**: policy-source entries into the typed model. Malformed
//!    entries are skipped with a warning; a request with no usable policy is
//!    a 400.
//! 2. **Merge** (optional): the overlap merger widens close same-attribute
//!    ranges to create factoring opportunities.
//! 3. **Rewrite**: the chosen algorithm factors the expression.
//! 4. **Render**: the rewritten query text plus summary counts go back to the
//!    caller.
//!
//! ## Error Handling
//!
//! - 400 Bad Request: undecodable document, or no valid policy entry.
//! - 422 Unprocessable Entity: policy authoring errors the caller must fix
//!   (unknown attribute, incompatible attribute type).
//! - 500 Internal Server Error: structural violations in the rewrite itself.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use guardx_core::error::PolicyEngineError;
use guardx_core::policy::PolicyExpression;
use guardx_core::source::{policy_from_source, PolicySource};
use guardx_factor::{CostGuidedSelector, ExactFactorizer, GuardSequencer, PredicateMerger};

use crate::state::AppState;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// GET /catalog — the configured attribute catalog and cost constants.
pub async fn catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "catalog": &state.catalog,
        "cost_params": &state.cost_params,
    }))
}

/// Which rewrite pass to run.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Single-predicate greedy exact factorization.
    Greedy,
    /// Bounded power-set exact factorization.
    Exact,
    /// Cost-guided factor selection.
    Cost,
    /// Flat guard sequencing (union rendering).
    Sequence,
}

/// Request body for the rewrite endpoint.
#[derive(Deserialize)]
pub struct RewriteRequest {
    pub policies: Vec<PolicySource>,
    pub algorithm: Algorithm,
    /// Run the overlap merger before factoring.
    #[serde(default)]
    pub merge: bool,
    /// For `sequence`: join with UNION ALL instead of UNION.
    #[serde(default)]
    pub union_all: bool,
}

#[derive(Serialize)]
pub struct RewriteResponse {
    /// The rewritten query text.
    pub query: String,
    /// Policies decoded from the request.
    pub policies_in: usize,
    /// Policies after merge-time deduplication (same as `policies_in` when
    /// the merger did not run).
    pub policies_after_merge: usize,
    /// Factored guards in the output (factor nodes or generated terms).
    pub guards: usize,
}

/// POST /rewrite — rewrite a policy set into a guarded query.
pub async fn rewrite(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RewriteRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // Step 1: decode, skipping malformed entries like the batch loader does.
    let mut policies = Vec::with_capacity(request.policies.len());
    for source in &request.policies {
        match policy_from_source(source) {
            Ok(policy) => policies.push(policy),
            Err(e) => warn!("skipping policy '{}': {e}", source.id),
        }
    }
    if policies.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "no valid policy in request".to_string(),
        ));
    }
    let policies_in = policies.len();
    let mut expression = PolicyExpression::new(policies);

    // The sequencer prices against pre-merge originals, so snapshot first.
    let snapshot = expression.snapshot_by_id();

    // Step 2: optional overlap merge.
    if request.merge {
        PredicateMerger::new(&state.catalog)
            .merge(&mut expression)
            .map_err(error_response)?;
        expression.dedup();
    }
    let policies_after_merge = expression.len();

    // Step 3 and 4: factor and render.
    let response = match request.algorithm {
        Algorithm::Greedy => {
            let tree = ExactFactorizer::new(&state.catalog)
                .factorize_greedy(&expression)
                .map_err(error_response)?;
            RewriteResponse {
                query: tree.render(),
                policies_in,
                policies_after_merge,
                guards: tree.guard_count(),
            }
        }
        Algorithm::Exact => {
            let tree = ExactFactorizer::with_config(&state.catalog, state.exact_config)
                .factorize_power_set(&expression)
                .map_err(error_response)?;
            RewriteResponse {
                query: tree.render(),
                policies_in,
                policies_after_merge,
                guards: tree.guard_count(),
            }
        }
        Algorithm::Cost => {
            let tree = CostGuidedSelector::new(&state.catalog, &state.cost_params)
                .select_guards(&expression)
                .map_err(error_response)?;
            RewriteResponse {
                query: tree.render(),
                policies_in,
                policies_after_merge,
                guards: tree.guard_count(),
            }
        }
        Algorithm::Sequence => {
            let sequencer = GuardSequencer::new(&state.catalog, &state.cost_params);
            let terms = sequencer
                .sequence(&expression, &snapshot)
                .map_err(error_response)?;
            RewriteResponse {
                query: sequencer.render(&terms, request.union_all),
                policies_in,
                policies_after_merge,
                guards: terms.len(),
            }
        }
    };
    Ok(Json(response))
}

/// Map pipeline errors onto HTTP status codes.
fn error_response(e: PolicyEngineError) -> (StatusCode, String) {
    let status = match &e {
        PolicyEngineError::MalformedPolicy { .. }
        | PolicyEngineError::Parse(_)
        | PolicyEngineError::Source(_) => StatusCode::BAD_REQUEST,
        PolicyEngineError::IncompatibleAttributeType { .. }
        | PolicyEngineError::UnknownAttribute(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}
