//! # Execution Collaborator Contract
//!
//! The rewriter never talks to a database itself. Empirical calibration issues
//! rendered guard queries through an implementation of [`QueryExecutor`]
//! supplied by the embedding application. The contract mirrors how such a
//! collaborator behaves: each run executes with a bounded timeout on a
//! dedicated worker, and on expiry the in-flight statement is cancelled and
//! the run reports `Timeout` instead of blocking forever.
//!
//! On this side of the seam, timeouts and database failures never escape the
//! measurement loop: they are recorded as the saturating
//! [`MAX_QUERY_DURATION`] sentinel so one slow guard cannot stall or abort a
//! whole calibration batch.

use crate::error::PolicyEngineError;
use std::time::Duration;
use tracing::warn;

/// Worst-case sentinel recorded for timed-out or failed calibration runs.
pub const MAX_QUERY_DURATION: Duration = Duration::from_secs(600);

/// Default per-query budget for calibration runs.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(25_000);

/// What a completed query run reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOutcome {
    pub duration: Duration,
    pub row_count: u64,
}

/// External collaborator that runs a query with a bounded timeout.
pub trait QueryExecutor: Send + Sync {
    /// Run `query`, cancelling it if `timeout` expires. Implementations return
    /// `Timeout` on expiry and `ExecutionFailure` on database-level errors.
    fn run(&self, query: &str, timeout: Duration)
        -> Result<QueryOutcome, PolicyEngineError>;
}

/// Run `query` `repetitions` times and return a smoothed latency.
///
/// With three or more repetitions the single highest and lowest observations
/// are discarded before averaging; with fewer there is nothing to trim and all
/// observations are averaged. Timeouts and failures contribute the saturating
/// sentinel instead of propagating.
pub fn trimmed_mean_latency(
    executor: &dyn QueryExecutor,
    query: &str,
    repetitions: usize,
    timeout: Duration,
) -> Duration {
    if repetitions == 0 {
        return Duration::ZERO;
    }
    let mut observed = Vec::with_capacity(repetitions);
    for _ in 0..repetitions {
        match executor.run(query, timeout) {
            Ok(outcome) => observed.push(outcome.duration),
            Err(e @ PolicyEngineError::Timeout(_)) => {
                warn!("calibration run timed out, recording sentinel: {e}");
                observed.push(MAX_QUERY_DURATION);
            }
            Err(e) => {
                warn!("calibration run failed, recording sentinel: {e}");
                observed.push(MAX_QUERY_DURATION);
            }
        }
    }
    observed.sort();
    let trimmed: &[Duration] = if observed.len() >= 3 {
        &observed[1..observed.len() - 1]
    } else {
        &observed[..]
    };
    let total: Duration = trimmed.iter().sum();
    total / trimmed.len() as u32
}
