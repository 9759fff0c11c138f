//! # Cost-Guided Factor Selection
//!
//! Greedy factorization with the same tree shape as the exact factorizer, but
//! the factor choice is driven by the explicit I/O + CPU cost model instead of
//! a heuristic gain, which makes the decisions checkable against measured
//! latency.
//!
//! ## Selection Rule
//!
//! For each indexed-attribute condition occurring in at least two policies,
//! the split is accepted only if evaluating the quotient unguarded would cost
//! more than fetching the guard's rows and filtering them:
//!
//! ```text
//! cost_scan(quotient) > cost_guard(factor, quotient)
//! ```
//!
//! Among the accepted candidates the minimum-`cost_guard` one wins, and the
//! recursion continues on the remainder with both the chosen and the rejected
//! factors removed from the candidate set. Terminal policies are each guarded
//! by their own lowest-selectivity indexed condition.
//!
//! ## Flattening and Calibration
//!
//! [`CostGuidedSelector::guard_partitions`] flattens the tree into ordered
//! `guard -> partition` pairs (one per factor node, plus one per leaf policy),
//! which is the shape used both for rendering independent guarded sub-queries
//! and for empirical calibration. Calibration replays each pair's rendered
//! query through the execution collaborator a fixed number of repetitions,
//! discards the highest and lowest latency, averages the rest, and sums
//! across pairs. The result is informational -- it validates the cost model
//! but never feeds back into the selection decision.

use crate::exact::indexed_candidates;
use crate::tree::FactorTree;
use guardx_core::catalog::Catalog;
use guardx_core::cost::{guard_cost, scan_cost, Cost, CostParams};
use guardx_core::error::{PolicyEngineError, Result};
use guardx_core::exec::{trimmed_mean_latency, QueryExecutor};
use guardx_core::policy::{Condition, Policy, PolicyExpression};
use guardx_core::render::render_guarded_statement;
use guardx_core::stats::condition_selectivity;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// One flattened `guard -> partition` pair.
#[derive(Debug, Clone, Serialize)]
pub struct GuardedPartition {
    /// The guard condition. `None` for a leaf policy with no indexed
    /// condition to guard it; such a partition renders unguarded.
    pub guard: Option<Condition>,
    pub partition: PolicyExpression,
}

impl GuardedPartition {
    /// Render this pair as a complete statement against the catalog's table.
    pub fn render(&self, catalog: &Catalog) -> String {
        render_guarded_statement(self.guard.as_ref(), &self.partition, catalog)
    }
}

/// Cost-model-driven guard selector.
pub struct CostGuidedSelector<'a> {
    catalog: &'a Catalog,
    params: &'a CostParams,
}

impl<'a> CostGuidedSelector<'a> {
    pub fn new(catalog: &'a Catalog, params: &'a CostParams) -> Self {
        Self { catalog, params }
    }

    /// Factor the expression into a quotient/remainder tree.
    pub fn select_guards(&self, expression: &PolicyExpression) -> Result<FactorTree> {
        if expression.is_empty() {
            return Err(PolicyEngineError::EmptyExpression);
        }
        let candidates = indexed_candidates(self.catalog, expression);
        self.select(expression, candidates)
    }

    fn select(
        &self,
        expression: &PolicyExpression,
        candidates: Vec<Condition>,
    ) -> Result<FactorTree> {
        let n = self.catalog.row_count;
        let mut best: Option<(f64, Condition, PolicyExpression)> = None;
        let mut rejected: Vec<Condition> = Vec::new();

        for candidate in &candidates {
            let original = expression.filter_containing(candidate);
            if original.len() < 2 {
                // Not a factor of at least two policies; drop from recursion.
                rejected.push(candidate.clone());
                continue;
            }
            let mut quotient = original.clone();
            quotient.remove_condition(candidate);

            let l_guard = condition_selectivity(self.catalog, candidate)?;
            let guarded = guard_cost(self.params, n, l_guard, quotient.condition_count());
            let scanned = scan_cost(self.params, n, quotient.condition_count());
            if scanned > guarded {
                if best.as_ref().map(|(c, _, _)| guarded < *c).unwrap_or(true) {
                    best = Some((guarded, candidate.clone(), quotient));
                }
            } else {
                // A guard that loses to the scan now will keep losing on any
                // sub-partition; drop it from the recursion entirely.
                rejected.push(candidate.clone());
            }
        }

        let Some((cost, factor, quotient)) = best else {
            return Ok(FactorTree::leaf(expression.clone()));
        };
        debug!(
            "selected guard '{factor}' over {} policies, cost {cost:.1}",
            quotient.len()
        );

        let mut remaining = candidates;
        remaining.retain(|c| c != &factor && !rejected.contains(c));
        let mut remainder = expression.clone();
        remainder.remove_policies_of(&quotient);
        let remainder_tree = if remainder.is_empty() {
            FactorTree::leaf(remainder)
        } else {
            self.select(&remainder, remaining)?
        };
        Ok(FactorTree::Factor {
            multiplier: vec![factor],
            quotient: Box::new(FactorTree::leaf(quotient)),
            remainder: Box::new(remainder_tree),
            cost: Cost::new(cost),
        })
    }

    /// Flatten the tree into ordered `guard -> partition` pairs: one per
    /// factor node, then one per policy left in the deepest remainder, each
    /// guarded by its own lowest-selectivity indexed condition.
    pub fn guard_partitions(&self, tree: &FactorTree) -> Result<Vec<GuardedPartition>> {
        let mut pairs = Vec::new();
        let mut node = tree;
        loop {
            match node {
                FactorTree::Factor {
                    multiplier,
                    quotient,
                    remainder,
                    ..
                } => {
                    let FactorTree::Leaf { expression } = quotient.as_ref() else {
                        return Err(PolicyEngineError::EmptyExpression);
                    };
                    pairs.push(GuardedPartition {
                        guard: multiplier.first().cloned(),
                        partition: expression.clone(),
                    });
                    node = remainder.as_ref();
                }
                FactorTree::Leaf { expression } => {
                    for policy in &expression.policies {
                        pairs.push(GuardedPartition {
                            guard: self.cheapest_indexed_condition(policy)?,
                            partition: PolicyExpression::new(vec![policy.clone()]),
                        });
                    }
                    return Ok(pairs);
                }
            }
        }
    }

    /// The policy's lowest-selectivity indexed condition, if any.
    fn cheapest_indexed_condition(&self, policy: &Policy) -> Result<Option<Condition>> {
        let mut best: Option<(f64, Condition)> = None;
        for condition in &policy.conditions {
            if !self.catalog.is_indexed(&condition.attribute) {
                continue;
            }
            let l = condition_selectivity(self.catalog, condition)?;
            if best.as_ref().map(|(b, _)| l < *b).unwrap_or(true) {
                best = Some((l, condition.clone()));
            }
        }
        Ok(best.map(|(_, c)| c))
    }

    /// Replay every pair's rendered query through the execution collaborator
    /// and sum the smoothed latencies. Informational only; timeouts and
    /// failures contribute the saturating sentinel.
    pub fn calibrate(
        &self,
        pairs: &[GuardedPartition],
        executor: &dyn QueryExecutor,
        repetitions: usize,
        timeout: Duration,
    ) -> Duration {
        let mut total = Duration::ZERO;
        for pair in pairs {
            let query = pair.render(self.catalog);
            let latency = trimmed_mean_latency(executor, &query, repetitions, timeout);
            debug!("calibrated guard pair in {latency:?}: {query}");
            total += latency;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardx_core::exec::QueryOutcome;
    use guardx_core::policy::{AttributeType, ScalarValue};

    fn user_eq(v: &str) -> Condition {
        Condition::equality(
            "user_id",
            AttributeType::NumericString,
            ScalarValue::Str(v.into()),
        )
    }

    fn activity_eq(v: &str) -> Condition {
        Condition::equality(
            "activity",
            AttributeType::Categorical,
            ScalarValue::Str(v.into()),
        )
    }

    fn shared_activity_expression() -> PolicyExpression {
        PolicyExpression::new(vec![
            Policy::new("p1", vec![user_eq("1"), activity_eq("walking")]),
            Policy::new("p2", vec![user_eq("2"), activity_eq("walking")]),
            Policy::new("p3", vec![user_eq("3"), activity_eq("walking")]),
        ])
    }

    #[test]
    fn test_selects_shared_activity_guard() {
        let catalog = Catalog::observation();
        let params = CostParams::default();
        let tree = CostGuidedSelector::new(&catalog, &params)
            .select_guards(&shared_activity_expression())
            .unwrap();
        let FactorTree::Factor {
            multiplier,
            quotient,
            remainder,
            ..
        } = &tree
        else {
            panic!("expected a factored tree");
        };
        assert_eq!(multiplier, &vec![activity_eq("walking")]);
        // The quotient keeps all three policies, activity removed.
        let FactorTree::Leaf { expression } = quotient.as_ref() else {
            panic!("quotient should be a leaf partition");
        };
        assert_eq!(expression.len(), 3);
        assert!(expression
            .policies
            .iter()
            .all(|p| p.conditions == vec![user_eq(&p.id[1..])]));
        assert!(remainder.is_empty());
        assert_eq!(
            tree.render(),
            "activity='walking' AND ((user_id=1) OR (user_id=2) OR (user_id=3))"
        );
    }

    #[test]
    fn test_accepted_split_satisfies_cost_rule() {
        let catalog = Catalog::observation();
        let params = CostParams::default();
        let selector = CostGuidedSelector::new(&catalog, &params);
        let tree = selector.select_guards(&shared_activity_expression()).unwrap();
        let FactorTree::Factor { multiplier, quotient, cost, .. } = &tree else {
            panic!("expected a factored tree");
        };
        let FactorTree::Leaf { expression } = quotient.as_ref() else {
            panic!();
        };
        let l = condition_selectivity(&catalog, &multiplier[0]).unwrap();
        let guarded = guard_cost(&params, catalog.row_count, l, expression.condition_count());
        let scanned = scan_cost(&params, catalog.row_count, expression.condition_count());
        assert!(guarded < scanned);
        assert!((cost.total - guarded).abs() < 1e-9);
    }

    #[test]
    fn test_leaf_policies_get_cheapest_indexed_guard() {
        let catalog = Catalog::observation();
        let params = CostParams::default();
        let selector = CostGuidedSelector::new(&catalog, &params);
        // No shared condition: the tree is a leaf, so flattening guards each
        // policy by its most selective indexed condition.
        let expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![user_eq("1"), activity_eq("walking")]),
            Policy::new("p2", vec![user_eq("2"), activity_eq("working")]),
        ]);
        let tree = selector.select_guards(&expr).unwrap();
        assert!(matches!(tree, FactorTree::Leaf { .. }));
        let pairs = selector.guard_partitions(&tree).unwrap();
        assert_eq!(pairs.len(), 2);
        // user_id equality (L = 1/5000) beats activity (L = 1/10).
        assert_eq!(pairs[0].guard, Some(user_eq("1")));
        assert_eq!(pairs[1].guard, Some(user_eq("2")));
        assert_eq!(pairs[0].partition.len(), 1);
    }

    #[test]
    fn test_guard_partitions_cover_tree_and_leaves() {
        let catalog = Catalog::observation();
        let params = CostParams::default();
        let selector = CostGuidedSelector::new(&catalog, &params);
        let mut policies = shared_activity_expression().policies;
        policies.push(Policy::new("p4", vec![user_eq("9")]));
        let expr = PolicyExpression::new(policies);
        let tree = selector.select_guards(&expr).unwrap();
        let pairs = selector.guard_partitions(&tree).unwrap();
        // One factored pair for the activity guard, one leaf pair for p4.
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].guard, Some(activity_eq("walking")));
        assert_eq!(pairs[0].partition.len(), 3);
        assert_eq!(pairs[1].guard, Some(user_eq("9")));
    }

    struct ConstantExecutor(Duration);

    impl QueryExecutor for ConstantExecutor {
        fn run(
            &self,
            _query: &str,
            _timeout: Duration,
        ) -> std::result::Result<QueryOutcome, PolicyEngineError> {
            Ok(QueryOutcome {
                duration: self.0,
                row_count: 42,
            })
        }
    }

    #[test]
    fn test_calibration_sums_across_pairs() {
        let catalog = Catalog::observation();
        let params = CostParams::default();
        let selector = CostGuidedSelector::new(&catalog, &params);
        let mut policies = shared_activity_expression().policies;
        policies.push(Policy::new("p4", vec![user_eq("9")]));
        let tree = selector
            .select_guards(&PolicyExpression::new(policies))
            .unwrap();
        let pairs = selector.guard_partitions(&tree).unwrap();
        let executor = ConstantExecutor(Duration::from_millis(10));
        let total = selector.calibrate(&pairs, &executor, 5, Duration::from_secs(1));
        assert_eq!(total, Duration::from_millis(10) * pairs.len() as u32);
    }
}
