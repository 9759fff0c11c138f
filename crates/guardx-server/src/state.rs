//! # Application State
//!
//! Shared state available to every request handler, created once at startup
//! and shared via `Arc`. Everything in it is read-only configuration: each
//! rewrite request builds its own policy expression, so no mutable state
//! crosses requests.

use guardx_core::catalog::Catalog;
use guardx_core::cost::CostParams;
use guardx_factor::ExactConfig;

/// Shared application state, accessible via Axum's State extractor.
pub struct AppState {
    /// Attribute metadata and row count for the observation table.
    pub catalog: Catalog,
    /// Constants of the I/O + CPU cost model.
    pub cost_params: CostParams,
    /// Bounds on the power-set exact factorization.
    pub exact_config: ExactConfig,
}

impl AppState {
    /// State for the default observation table and cost constants.
    pub fn new() -> Self {
        Self {
            catalog: Catalog::observation(),
            cost_params: CostParams::default(),
            exact_config: ExactConfig::default(),
        }
    }
}
