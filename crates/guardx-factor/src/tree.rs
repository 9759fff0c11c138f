//! # Factorization Tree
//!
//! The tree-shaped passes rewrite an OR-of-ANDs expression into a binary
//! recursion of guarded partitions:
//!
//! ```text
//! multiplier AND (quotient) OR (remainder)
//! ```
//!
//! A node is either a `Leaf` holding an unfactored sub-expression, or a
//! `Factor` holding the factored-out multiplier, the quotient containing the
//! policies that carried it, and the remainder carrying everything else to the
//! next recursion level. Terminality is the `Leaf` variant itself -- there is
//! no empty-multiplier sentinel.
//!
//! At every `Factor` node the quotient's and remainder's policy sets partition
//! the parent's: disjoint, and together complete. [`FactorTree::partitions_hold`]
//! checks the invariant recursively and is used by the property tests.

use guardx_core::cost::Cost;
use guardx_core::error::Result;
use guardx_core::policy::{Condition, PolicyExpression, Row};
use guardx_core::render::{CONJUNCTION, DISJUNCTION};
use serde::Serialize;
use std::collections::BTreeSet;

/// A factorization result: either an unfactored sub-expression or a guarded
/// split.
#[derive(Debug, Clone, Serialize)]
pub enum FactorTree {
    /// An unfactored sub-expression. May be empty (an exhausted remainder).
    Leaf { expression: PolicyExpression },
    /// A guarded split of the parent's policy set.
    Factor {
        /// The factored-out guard condition(s).
        multiplier: Vec<Condition>,
        /// Policies that contained the multiplier, with it removed.
        quotient: Box<FactorTree>,
        /// Policies that did not contain the multiplier.
        remainder: Box<FactorTree>,
        /// Score of this split under the pass that produced it.
        cost: Cost,
    },
}

impl FactorTree {
    pub fn leaf(expression: PolicyExpression) -> Self {
        FactorTree::Leaf { expression }
    }

    /// Number of `Factor` nodes in the tree.
    pub fn guard_count(&self) -> usize {
        match self {
            FactorTree::Leaf { .. } => 0,
            FactorTree::Factor {
                quotient,
                remainder,
                ..
            } => 1 + quotient.guard_count() + remainder.guard_count(),
        }
    }

    /// Ids of every policy reachable from this node.
    pub fn policy_ids(&self) -> BTreeSet<String> {
        match self {
            FactorTree::Leaf { expression } => expression.policy_ids(),
            FactorTree::Factor {
                quotient,
                remainder,
                ..
            } => {
                let mut ids = quotient.policy_ids();
                ids.extend(remainder.policy_ids());
                ids
            }
        }
    }

    /// Is this subtree free of policies (an exhausted remainder)?
    pub fn is_empty(&self) -> bool {
        match self {
            FactorTree::Leaf { expression } => expression.is_empty(),
            FactorTree::Factor { .. } => false,
        }
    }

    /// Evaluate the rewritten expression against a row:
    /// `(multiplier AND quotient) OR remainder`.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        match self {
            FactorTree::Leaf { expression } => expression.matches(row),
            FactorTree::Factor {
                multiplier,
                quotient,
                remainder,
                ..
            } => {
                let mut guarded = true;
                for condition in multiplier {
                    if !condition.matches(row)? {
                        guarded = false;
                        break;
                    }
                }
                if guarded && quotient.matches(row)? {
                    return Ok(true);
                }
                remainder.matches(row)
            }
        }
    }

    /// Render the rewritten expression:
    /// `multiplier AND (quotient)[ OR (remainder)]`, remainder omitted when
    /// empty.
    pub fn render(&self) -> String {
        match self {
            FactorTree::Leaf { expression } => expression.render(),
            FactorTree::Factor {
                multiplier,
                quotient,
                remainder,
                ..
            } => {
                let mut out = String::new();
                for condition in multiplier {
                    out.push_str(&condition.to_string());
                    out.push_str(CONJUNCTION);
                }
                out.push('(');
                out.push_str(&quotient.render());
                out.push(')');
                if !remainder.is_empty() {
                    out.push_str(DISJUNCTION);
                    out.push('(');
                    out.push_str(&remainder.render());
                    out.push(')');
                }
                out
            }
        }
    }

    /// Verify that every `Factor` node's quotient and remainder partition its
    /// policy set: disjoint, and together equal to the node's own set.
    pub fn partitions_hold(&self) -> bool {
        match self {
            FactorTree::Leaf { .. } => true,
            FactorTree::Factor {
                quotient,
                remainder,
                ..
            } => {
                let q = quotient.policy_ids();
                let r = remainder.policy_ids();
                q.is_disjoint(&r)
                    && quotient.partitions_hold()
                    && remainder.partitions_hold()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardx_core::policy::{AttributeType, Policy, ScalarValue};

    fn user_eq(id: &str, v: &str) -> Policy {
        Policy::new(
            id,
            vec![Condition::equality(
                "user_id",
                AttributeType::NumericString,
                ScalarValue::Str(v.into()),
            )],
        )
    }

    #[test]
    fn test_render_omits_empty_remainder() {
        let guard = Condition::equality(
            "activity",
            AttributeType::Categorical,
            ScalarValue::Str("walking".into()),
        );
        let quotient = PolicyExpression::new(vec![user_eq("p1", "1"), user_eq("p2", "2")]);
        let tree = FactorTree::Factor {
            multiplier: vec![guard],
            quotient: Box::new(FactorTree::leaf(quotient)),
            remainder: Box::new(FactorTree::leaf(PolicyExpression::empty())),
            cost: Cost::zero(),
        };
        assert_eq!(
            tree.render(),
            "activity='walking' AND ((user_id=1) OR (user_id=2))"
        );
    }

    #[test]
    fn test_render_includes_remainder() {
        let guard = Condition::equality(
            "activity",
            AttributeType::Categorical,
            ScalarValue::Str("walking".into()),
        );
        let tree = FactorTree::Factor {
            multiplier: vec![guard],
            quotient: Box::new(FactorTree::leaf(PolicyExpression::new(vec![user_eq(
                "p1", "1",
            )]))),
            remainder: Box::new(FactorTree::leaf(PolicyExpression::new(vec![user_eq(
                "p2", "2",
            )]))),
            cost: Cost::zero(),
        };
        assert_eq!(
            tree.render(),
            "activity='walking' AND ((user_id=1)) OR ((user_id=2))"
        );
    }

    #[test]
    fn test_partition_check_catches_overlap() {
        let shared = user_eq("p1", "1");
        let tree = FactorTree::Factor {
            multiplier: vec![],
            quotient: Box::new(FactorTree::leaf(PolicyExpression::new(vec![shared.clone()]))),
            remainder: Box::new(FactorTree::leaf(PolicyExpression::new(vec![shared]))),
            cost: Cost::zero(),
        };
        assert!(!tree.partitions_hold());
    }
}
