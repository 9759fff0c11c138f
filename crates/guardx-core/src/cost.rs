//! # Cost Model
//!
//! This module defines the cost abstraction and the two-term I/O + CPU model the
//! cost-guided algorithms compare against.
//!
//! ## Guarded Evaluation vs Full Scan
//!
//! A guarded representation first fetches the rows satisfying the guard (an
//! indexed predicate) and only then evaluates the partition's remaining
//! predicates over them:
//!
//! ```text
//! guard_cost(factor, quotient) = N * L(factor) * (IO + ROW * 2 * numPreds(quotient) * alpha)
//! scan_cost(quotient)          = N * (IO + ROW * alpha * numPreds(quotient))
//! ```
//!
//! `IO` is the block-read cost of touching a row, `ROW` the cost of one
//! predicate evaluation, and `alpha` the fraction of a partition's predicates
//! that short-circuit evaluation actually visits per row. The factor of 2 in
//! the guarded form accounts for range conditions carrying two comparisons.
//! A guard pays I/O only on the `L(factor)` fraction of the table but evaluates
//! the partition over every fetched row; a full scan touches every block but
//! filters in a single pass.
//!
//! ## Calibration
//!
//! The constants in `CostParams` are deployment-specific. Their defaults are
//! stand-ins; the calibration loop in `guardx-factor` measures rendered guard
//! queries through the execution collaborator so the constants can be refit
//! against observed latencies.

use serde::{Deserialize, Serialize};

/// Cost is a single comparable value representing the estimated expense of
/// evaluating a (sub-)expression. Lower is better; `f64::MAX` represents
/// infinity (a not-yet-costed alternative).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cost {
    pub total: f64,
}

impl Cost {
    pub fn zero() -> Self {
        Self { total: 0.0 }
    }

    pub fn new(total: f64) -> Self {
        Self { total }
    }

    pub fn infinite() -> Self {
        Self { total: f64::MAX }
    }

    pub fn is_infinite(&self) -> bool {
        self.total == f64::MAX
    }
}

/// Epsilon-based equality to handle floating-point imprecision in cost comparisons.
impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        (self.total - other.total).abs() < f64::EPSILON
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.total.partial_cmp(&other.total)
    }
}

/// Tunable constants of the I/O + CPU cost model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostParams {
    /// Cost of reading one row's block through an index access path.
    pub io_block_read_cost: f64,
    /// Cost of evaluating one predicate against one row.
    pub row_evaluate_cost: f64,
    /// Fraction alpha of a partition's predicates evaluated per row under
    /// short-circuiting.
    pub pred_eval_fraction: f64,
}

impl Default for CostParams {
    fn default() -> Self {
        Self {
            io_block_read_cost: 0.0045,
            row_evaluate_cost: 0.00012,
            pred_eval_fraction: 0.66,
        }
    }
}

/// Cost of the guarded representation: index-fetch the guard's rows, then
/// evaluate the partition's predicates over them.
pub fn guard_cost(params: &CostParams, row_count: f64, l_guard: f64, num_preds: usize) -> f64 {
    row_count
        * l_guard
        * (params.io_block_read_cost
            + params.row_evaluate_cost * 2.0 * num_preds as f64 * params.pred_eval_fraction)
}

/// Cost of evaluating a partition unguarded: touch every block, filter in one pass.
pub fn scan_cost(params: &CostParams, row_count: f64, num_preds: usize) -> f64 {
    row_count
        * (params.io_block_read_cost
            + params.row_evaluate_cost * num_preds as f64 * params.pred_eval_fraction)
}

/// Full-scan cost of a single policy; the same form as [`scan_cost`], kept
/// separate because the guard sequencer sums it per quotient policy against
/// the pre-merge predicate counts.
pub fn policy_scan_cost(params: &CostParams, row_count: f64, num_preds: usize) -> f64 {
    scan_cost(params, row_count, num_preds)
}

/// CPU cost of evaluating `num_preds` predicates over the rows a factor lets
/// through.
pub fn filter_cpu_cost(params: &CostParams, row_count: f64, l_factor: f64, num_preds: usize) -> f64 {
    row_count
        * l_factor
        * params.row_evaluate_cost
        * params.pred_eval_fraction
        * num_preds as f64
}

/// I/O cost of fetching a factor's rows through its index.
pub fn index_access_cost(params: &CostParams, row_count: f64, l_factor: f64) -> f64 {
    row_count * l_factor * params.io_block_read_cost
}
