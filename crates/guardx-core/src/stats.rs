//! # Selectivity Estimation
//!
//! Selectivity L() estimates the fraction of rows a predicate, policy, or
//! expression lets through. It drives every factoring decision: a guard is
//! worth pulling out exactly when its selectivity makes the guarded partition
//! cheap relative to an unguarded scan.
//!
//! ## Estimation Formulas
//!
//! - **Equality**: `1 / cardinality` (uniform distribution assumption).
//! - **Range**: `(hi - lo) / domain_size`, clipped to [0, 1]. Timestamps are
//!   measured in epoch seconds; numeric-coded strings parse their full text.
//! - **Policy (AND)**: product of its conditions' selectivities
//!   (independence assumption).
//! - **Expression (OR)**: `1 - Π(1 - L(policy))` -- the independent-OR
//!   approximation. The empty expression has selectivity 0: it authorizes
//!   no row.
//!
//! Asking for the selectivity of an attribute the catalog does not know, or of
//! a shape with no defined rule (e.g. a range over a categorical string), is a
//! policy-authoring error and fails the current call.

use crate::catalog::Catalog;
use crate::error::{PolicyEngineError, Result};
use crate::policy::{AttributeType, Condition, Policy, PolicyExpression};

/// Estimated fraction of rows satisfying `condition`.
pub fn condition_selectivity(catalog: &Catalog, condition: &Condition) -> Result<f64> {
    let info = catalog.attribute(&condition.attribute)?;
    if condition.is_equality() {
        return Ok(1.0 / info.cardinality.max(1.0));
    }
    if info.attr_type == AttributeType::Categorical {
        return Err(PolicyEngineError::IncompatibleAttributeType {
            attribute: condition.attribute.clone(),
        });
    }
    let low = condition.low().as_numeric(info.attr_type)?;
    let high = condition.high().as_numeric(info.attr_type)?;
    let domain = info.domain_size();
    if domain <= 0.0 {
        return Err(PolicyEngineError::IncompatibleAttributeType {
            attribute: condition.attribute.clone(),
        });
    }
    Ok(((high - low) / domain).clamp(0.0, 1.0))
}

/// Product of the policy's condition selectivities (independence assumption).
pub fn policy_selectivity(catalog: &Catalog, policy: &Policy) -> Result<f64> {
    let mut l = 1.0;
    for condition in &policy.conditions {
        l *= condition_selectivity(catalog, condition)?;
    }
    Ok(l)
}

/// Selectivity of the policy with one condition removed. Used by the overlap
/// merger to pick the donor whose remaining conditions are least informative.
pub fn residual_selectivity(
    catalog: &Catalog,
    policy: &Policy,
    without: &Condition,
) -> Result<f64> {
    let mut l = 1.0;
    for condition in policy.conditions.iter().filter(|c| *c != without) {
        l *= condition_selectivity(catalog, condition)?;
    }
    Ok(l)
}

/// Independent-OR approximation: `1 - Π(1 - L(policy))`.
pub fn expression_selectivity(catalog: &Catalog, expression: &PolicyExpression) -> Result<f64> {
    let mut miss = 1.0;
    for policy in &expression.policies {
        miss *= 1.0 - policy_selectivity(catalog, policy)?;
    }
    Ok(1.0 - miss)
}

/// Selectivity of a conjunction of conditions (a multi-condition factor).
pub fn factor_selectivity(catalog: &Catalog, factor: &[Condition]) -> Result<f64> {
    let mut l = 1.0;
    for condition in factor {
        l *= condition_selectivity(catalog, condition)?;
    }
    Ok(l)
}
