//! # Error Type
//!
//! One error enum covers the whole pipeline. The variants fall into three bands
//! with different propagation rules:
//!
//! - **Per-entry** (`MalformedPolicy`, `Parse`): caught at the site that produced
//!   them; the offending policy or merge candidate is skipped and the batch
//!   continues, so a load or rewrite always yields a complete result.
//! - **Authoring** (`IncompatibleAttributeType`, `UnknownAttribute`): a policy
//!   references an attribute the catalog cannot estimate or compare. Fatal to the
//!   current factorization call; fixing the policy source is the only remedy.
//! - **Calibration** (`Timeout`, `ExecutionFailure`): converted to a saturating
//!   worst-case sentinel inside the calibration loop and never propagated past it.
//!
//! `EmptyExpression` is the structural violation: asking a factorizer to split an
//! expression with no policies indicates a caller bug and aborts the whole run.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyEngineError>;

#[derive(Debug, Error)]
pub enum PolicyEngineError {
    /// A policy-source entry could not be decoded or normalized. Aborts that
    /// entry only; the rest of the batch loads.
    #[error("malformed policy '{id}': {reason}")]
    MalformedPolicy { id: String, reason: String },

    /// A value could not be interpreted under its declared attribute type
    /// (e.g. a non-numeric user id during an overlap test).
    #[error("unparsable value '{0}'")]
    Parse(String),

    /// A comparison or selectivity rule was requested for an attribute type
    /// that has none.
    #[error("incompatible attribute type for '{attribute}'")]
    IncompatibleAttributeType { attribute: String },

    /// A condition references an attribute the catalog does not know.
    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    /// A calibration query exceeded its budget.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// A database-level failure while running a calibration query.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    /// A factorizer was asked to split an expression with no policies.
    #[error("cannot factor an empty expression")]
    EmptyExpression,

    /// The policy-source document itself is not valid JSON.
    #[error("invalid policy source: {0}")]
    Source(#[from] serde_json::Error),
}
