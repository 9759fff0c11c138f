//! # Exact Factorization
//!
//! Gain-maximizing factorization of a policy expression into
//! `multiplier AND (quotient) OR (remainder)` form. Two modes:
//!
//! ## Single-Predicate Greedy
//!
//! Considers every indexed-attribute condition occurring in at least two
//! policies. A candidate split is scored by a weighted normalized benefit:
//!
//! ```text
//! guard_freq  = L(factor) * N
//! filter_freq = (L(quotient) - L(original)) * N
//! benefit     = (0.8 * guard_freq + 0.2 * filter_freq) / (guard_freq + filter_freq)
//! ```
//!
//! where `original` is the sub-expression of policies carrying the factor and
//! `quotient` is the same sub-expression with the factor removed. The single
//! best-benefit split is kept and the recursion continues on the remainder
//! until at most one policy remains or no split improves.
//!
//! ## Bounded Power-Set Exact
//!
//! Considers every non-empty subset of any policy's conditions (up to
//! `max_subset_size`) shared by at least two policies, scored by the absolute
//! gain of factoring the sub-conjunction out:
//!
//! ```text
//! gain = (|quotient| - 1) * L(factor) * N + L(original) * N - L(quotient) * N
//! ```
//!
//! The globally best positive-gain subset wins each round; recursion on the
//! remainder is capped at `max_rounds` to bound the combinatorial blow-up.
//! Both bounds are first-class parameters in [`ExactConfig`].

use crate::tree::FactorTree;
use guardx_core::catalog::Catalog;
use guardx_core::cost::Cost;
use guardx_core::error::{PolicyEngineError, Result};
use guardx_core::policy::{Condition, PolicyExpression};
use guardx_core::stats::{condition_selectivity, expression_selectivity, factor_selectivity};
use tracing::debug;

/// Bounds on the power-set search.
#[derive(Debug, Clone, Copy)]
pub struct ExactConfig {
    /// Largest sub-conjunction considered as a factor.
    pub max_subset_size: usize,
    /// Maximum recursive factoring rounds on the remainder.
    pub max_rounds: usize,
}

impl Default for ExactConfig {
    fn default() -> Self {
        Self {
            max_subset_size: 4,
            max_rounds: 2,
        }
    }
}

/// Gain-maximizing factorizer.
pub struct ExactFactorizer<'a> {
    catalog: &'a Catalog,
    config: ExactConfig,
}

impl<'a> ExactFactorizer<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            config: ExactConfig::default(),
        }
    }

    pub fn with_config(catalog: &'a Catalog, config: ExactConfig) -> Self {
        Self { catalog, config }
    }

    /// Single-predicate greedy factorization.
    pub fn factorize_greedy(&self, expression: &PolicyExpression) -> Result<FactorTree> {
        if expression.is_empty() {
            return Err(PolicyEngineError::EmptyExpression);
        }
        self.greedy(expression)
    }

    fn greedy(&self, expression: &PolicyExpression) -> Result<FactorTree> {
        let mut best: Option<(f64, Condition, PolicyExpression)> = None;
        for candidate in indexed_candidates(self.catalog, expression) {
            let original = expression.filter_containing(&candidate);
            if original.len() < 2 {
                continue;
            }
            let mut quotient = original.clone();
            quotient.remove_condition(&candidate);
            let benefit = self.benefit(&candidate, &original, &quotient)?;
            if best.as_ref().map(|(b, _, _)| benefit > *b).unwrap_or(true) {
                best = Some((benefit, candidate, quotient));
            }
        }

        let Some((benefit, factor, quotient)) = best else {
            return Ok(FactorTree::leaf(expression.clone()));
        };
        debug!("greedy factor '{factor}' over {} policies, benefit {benefit:.4}", quotient.len());

        let mut remainder = expression.clone();
        remainder.remove_policies_of(&quotient);
        let remainder_tree = if remainder.len() <= 1 {
            FactorTree::leaf(remainder)
        } else {
            self.greedy(&remainder)?
        };
        Ok(FactorTree::Factor {
            multiplier: vec![factor],
            quotient: Box::new(FactorTree::leaf(quotient)),
            remainder: Box::new(remainder_tree),
            cost: Cost::new(benefit),
        })
    }

    /// Weighted normalized benefit of a greedy split.
    fn benefit(
        &self,
        factor: &Condition,
        original: &PolicyExpression,
        quotient: &PolicyExpression,
    ) -> Result<f64> {
        let n = self.catalog.row_count;
        let guard_freq = condition_selectivity(self.catalog, factor)? * n;
        let filter_freq = (expression_selectivity(self.catalog, quotient)?
            - expression_selectivity(self.catalog, original)?)
            * n;
        let denominator = guard_freq + filter_freq;
        if denominator <= 0.0 {
            return Ok(0.0);
        }
        Ok((0.8 * guard_freq + 0.2 * filter_freq) / denominator)
    }

    /// Bounded power-set exact factorization.
    pub fn factorize_power_set(&self, expression: &PolicyExpression) -> Result<FactorTree> {
        if expression.is_empty() {
            return Err(PolicyEngineError::EmptyExpression);
        }
        self.power_set(expression, 0)
    }

    fn power_set(&self, expression: &PolicyExpression, round: usize) -> Result<FactorTree> {
        let mut subsets: Vec<Vec<Condition>> = Vec::new();
        for policy in &expression.policies {
            for subset in policy.condition_subsets(self.config.max_subset_size) {
                if !subsets.contains(&subset) {
                    subsets.push(subset);
                }
            }
        }

        let mut best: Option<(f64, Vec<Condition>, PolicyExpression)> = None;
        for subset in subsets {
            let original = expression.filter_containing_all(&subset);
            if original.len() < 2 {
                continue;
            }
            let mut quotient = original.clone();
            quotient.remove_conditions(&subset);
            let gain = self.gain(&subset, &original, &quotient)?;
            if gain <= 0.0 {
                continue;
            }
            if best.as_ref().map(|(g, _, _)| gain > *g).unwrap_or(true) {
                best = Some((gain, subset, quotient));
            }
        }

        let Some((gain, factor, quotient)) = best else {
            return Ok(FactorTree::leaf(expression.clone()));
        };
        debug!(
            "round {round}: factored {}-condition subset over {} policies, gain {gain:.1}",
            factor.len(),
            quotient.len()
        );

        let mut remainder = expression.clone();
        remainder.remove_policies_of(&quotient);
        let remainder_tree = if remainder.len() <= 1 || round + 1 >= self.config.max_rounds {
            FactorTree::leaf(remainder)
        } else {
            self.power_set(&remainder, round + 1)?
        };
        Ok(FactorTree::Factor {
            multiplier: factor,
            quotient: Box::new(FactorTree::leaf(quotient)),
            remainder: Box::new(remainder_tree),
            cost: Cost::new(gain),
        })
    }

    /// Absolute gain of factoring `factor` out of `original`.
    fn gain(
        &self,
        factor: &[Condition],
        original: &PolicyExpression,
        quotient: &PolicyExpression,
    ) -> Result<f64> {
        let n = self.catalog.row_count;
        let l_factor = factor_selectivity(self.catalog, factor)?;
        let gain = (quotient.len() as f64 - 1.0) * l_factor * n
            + expression_selectivity(self.catalog, original)? * n
            - expression_selectivity(self.catalog, quotient)? * n;
        Ok(gain)
    }
}

/// Distinct indexed-attribute conditions appearing anywhere in the expression.
pub(crate) fn indexed_candidates(
    catalog: &Catalog,
    expression: &PolicyExpression,
) -> Vec<Condition> {
    let mut candidates: Vec<Condition> = Vec::new();
    for policy in &expression.policies {
        for condition in &policy.conditions {
            if catalog.is_indexed(&condition.attribute) && !candidates.contains(condition) {
                candidates.push(condition.clone());
            }
        }
    }
    candidates
}
