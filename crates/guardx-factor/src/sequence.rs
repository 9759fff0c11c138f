//! # Guard Sequencing
//!
//! Produces a flat, utility-ordered list of guard terms instead of a tree.
//! Each term pairs one indexed guard condition with the partition of policies
//! it covers, and the whole sequence renders as a union of guarded
//! sub-queries.
//!
//! ## Step Rule
//!
//! Among all distinct indexed conditions present anywhere in the current
//! remainder, each step picks the one maximizing `utility = benefit / cost`:
//!
//! ```text
//! benefit = sum(full-scan cost of each quotient policy, pre-merge)
//!         - N * L(factor) * ROW * alpha * numPreds(quotient, pre-merge)
//! cost    = N * L(factor) * IO
//! ```
//!
//! The benefit compares what the quotient's policies would cost as individual
//! full scans against the CPU spent filtering the factor's rows, and the cost
//! is the index fetch itself. Only positive-utility candidates qualify.
//!
//! Because the overlap merger mutates policies in place, an id-to-original
//! snapshot map is captured before generation so the benefit always reflects
//! true pre-merge cost. The sequencer runs after the merger, on the merged
//! expression, but prices against the snapshot.
//!
//! The chosen factor stays inside its quotient policies; the rendering is
//! duplicate-safe, so repeating the guard predicate in the partition is
//! harmless. Remaining single policies become leaf terms guarded by their own
//! lowest-selectivity indexed condition. Rendering joins all terms with
//! `UNION` (duplicate-safe) or `UNION ALL` (faster, assumes disjoint guards)
//! per caller flag.

use crate::exact::indexed_candidates;
use guardx_core::catalog::Catalog;
use guardx_core::cost::{filter_cpu_cost, index_access_cost, policy_scan_cost, CostParams};
use guardx_core::error::{PolicyEngineError, Result};
use guardx_core::policy::{Condition, Policy, PolicyExpression, Row};
use guardx_core::render::{UNION, UNION_ALL};
use guardx_core::stats::condition_selectivity;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One guarded term of the final flat form.
#[derive(Debug, Clone, Serialize)]
pub struct Term {
    /// The guard. `None` only for a leaf policy with no indexed condition.
    pub factor: Option<Condition>,
    /// Policies covered by this term. The factor, when present, is still
    /// contained in them.
    pub quotient: PolicyExpression,
    pub benefit: f64,
    pub cost: f64,
    pub utility: f64,
}

impl Term {
    /// Row semantics of the term: `factor AND quotient`.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        if let Some(factor) = &self.factor {
            if !factor.matches(row)? {
                return Ok(false);
            }
        }
        self.quotient.matches(row)
    }

    /// `factor AND (quotient)`, or the bare quotient for an unguarded leaf.
    pub fn render_where(&self) -> String {
        match &self.factor {
            Some(factor) => format!("{factor} AND ({})", self.quotient.render_clean()),
            None => format!("({})", self.quotient.render_clean()),
        }
    }
}

/// Generates the flat guarded form.
pub struct GuardSequencer<'a> {
    catalog: &'a Catalog,
    params: &'a CostParams,
}

impl<'a> GuardSequencer<'a> {
    pub fn new(catalog: &'a Catalog, params: &'a CostParams) -> Self {
        Self { catalog, params }
    }

    /// Generate guard terms for the expression. `snapshot` is the
    /// id-to-original map captured before the overlap merger ran; pass
    /// [`PolicyExpression::snapshot_by_id`] of the pre-merge expression, or of
    /// the input itself when no merge happened.
    pub fn sequence(
        &self,
        expression: &PolicyExpression,
        snapshot: &HashMap<String, Policy>,
    ) -> Result<Vec<Term>> {
        if expression.is_empty() {
            return Err(PolicyEngineError::EmptyExpression);
        }
        let candidates = indexed_candidates(self.catalog, expression);
        let mut terms = Vec::new();
        let mut remainder = expression.clone();

        while remainder.len() > 1 && !candidates.is_empty() {
            let Some(term) = self.best_term(&remainder, &candidates, snapshot)? else {
                break;
            };
            debug!(
                "guard term '{}' covers {} policies, utility {:.4}",
                term.factor.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                term.quotient.len(),
                term.utility
            );
            remainder.remove_policies_of(&term.quotient);
            terms.push(term);
        }
        for policy in &remainder.policies {
            terms.push(self.leaf_term(policy)?);
        }
        Ok(terms)
    }

    /// The positive-utility candidate with the highest utility over the
    /// current remainder, if any.
    fn best_term(
        &self,
        remainder: &PolicyExpression,
        candidates: &[Condition],
        snapshot: &HashMap<String, Policy>,
    ) -> Result<Option<Term>> {
        let n = self.catalog.row_count;
        let mut best: Option<Term> = None;
        for candidate in candidates {
            let quotient = remainder.filter_containing(candidate);
            // A generated guard must cover at least two policies; singletons
            // are handled as leaf terms once the loop finishes.
            if quotient.len() < 2 {
                continue;
            }
            let l_factor = condition_selectivity(self.catalog, candidate)?;

            // Pre-merge pricing: both the scan sum and the predicate count
            // come from the snapshot originals.
            let mut scan_sum = 0.0;
            let mut num_preds = 0usize;
            for policy in &quotient.policies {
                let original = snapshot.get(&policy.id).unwrap_or(policy);
                scan_sum += policy_scan_cost(self.params, n, original.conditions.len());
                num_preds += original.conditions.len();
            }
            let benefit = scan_sum - filter_cpu_cost(self.params, n, l_factor, num_preds);
            let cost = index_access_cost(self.params, n, l_factor);
            if cost <= 0.0 {
                continue;
            }
            let utility = benefit / cost;
            if utility > best.as_ref().map(|t| t.utility).unwrap_or(0.0) {
                best = Some(Term {
                    factor: Some(candidate.clone()),
                    quotient,
                    benefit,
                    cost,
                    utility,
                });
            }
        }
        Ok(best)
    }

    /// A single remaining policy, guarded by its own lowest-selectivity
    /// indexed condition.
    fn leaf_term(&self, policy: &Policy) -> Result<Term> {
        let mut guard: Option<(f64, Condition)> = None;
        for condition in &policy.conditions {
            if !self.catalog.is_indexed(&condition.attribute) {
                continue;
            }
            let l = condition_selectivity(self.catalog, condition)?;
            if guard.as_ref().map(|(b, _)| l < *b).unwrap_or(true) {
                guard = Some((l, condition.clone()));
            }
        }
        Ok(Term {
            factor: guard.map(|(_, c)| c),
            quotient: PolicyExpression::new(vec![policy.clone()]),
            benefit: 0.0,
            cost: 0.0,
            utility: 0.0,
        })
    }

    /// Join all terms' guarded sub-queries with `UNION` (duplicate-safe) or
    /// `UNION ALL` (faster, assumes disjoint guards).
    pub fn render(&self, terms: &[Term], union_all: bool) -> String {
        let joiner = if union_all { UNION_ALL } else { UNION };
        terms
            .iter()
            .map(|t| {
                format!(
                    "SELECT * FROM {} WHERE {}",
                    self.catalog.table,
                    t.render_where()
                )
            })
            .collect::<Vec<_>>()
            .join(joiner)
    }
}

/// Row semantics of a whole term list: the OR of its terms.
pub fn terms_match(terms: &[Term], row: &Row) -> Result<bool> {
    for term in terms {
        if term.matches(row)? {
            return Ok(true);
        }
    }
    Ok(false)
}
