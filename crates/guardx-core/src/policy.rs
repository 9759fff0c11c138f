//! # Policy Types
//!
//! This module defines the complete type system for access-control policies.
//! It is organized into three layers:
//!
//! ## Predicates and Conditions
//! A `Predicate` is a single comparison against a literal (`>= 100`). A
//! `Condition` binds one or two predicates to an attribute: ranges always hold
//! exactly `[>=lo, <=hi]`, equalities exactly `[=v]`. The constructors enforce
//! this normalization so the rest of the pipeline can rely on it.
//!
//! ## Policies
//! A `Policy` is a conjunction of conditions plus a stable unique id. The id is
//! identity, not value: equality, hashing, and duplicate detection compare
//! conditions only, so a condition merged across policies is recognized as the
//! same predicate by value alone. The id survives all cloning and mutation,
//! which is what lets post-merge policies map back to their originals through a
//! snapshot map.
//!
//! ## Expressions
//! A `PolicyExpression` is a disjunction of policies -- the OR-of-ANDs form a
//! row-level-security layer evaluates. An empty expression authorizes no row.
//!
//! All three layers are plain values. Components that mutate an expression
//! clone it first; sibling factorization branches never alias state with each
//! other or with the caller's original.

use crate::error::{PolicyEngineError, Result};
use chrono::NaiveDateTime;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Wire and display format for timestamp literals.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An attribute-to-value assignment for a single observation row, used to check
/// that a rewritten expression authorizes exactly the rows the original does.
pub type Row = HashMap<String, ScalarValue>;

/// Comparison operators for boolean predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equality (`=`).
    Eq,
    /// Inequality (`!=`).
    NotEq,
    /// Less than (`<`).
    Lt,
    /// Less than or equal (`<=`).
    LtEq,
    /// Greater than (`>`).
    Gt,
    /// Greater than or equal (`>=`).
    GtEq,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => Some(CompareOp::Eq),
            "!=" | "<>" => Some(CompareOp::NotEq),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::LtEq),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::GtEq),
            _ => None,
        }
    }

    /// Evaluate the operator against an ordering of (row value, literal).
    pub fn evaluate(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::NotEq => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::LtEq => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::GtEq => ord != Ordering::Less,
        }
    }
}

/// Declared type of a policy attribute.
///
/// The type decides how literals are parsed, compared, and rendered, and which
/// slack rule (if any) the overlap merger applies. `Double` carries no overlap
/// rule: merging over a double-typed attribute fails with
/// `IncompatibleAttributeType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeType {
    /// 64-bit integer attribute.
    Integer,
    /// Floating-point attribute (temperature, energy).
    Double,
    /// Timestamp attribute, `%Y-%m-%d %H:%M:%S` literals.
    Timestamp,
    /// String attribute whose values are numeric codes (user/location ids).
    NumericString,
    /// Free-text categorical attribute (activity). Compared as opaque strings.
    Categorical,
}

/// Literal value appearing in a predicate or a row.
///
/// Uses `OrderedFloat` for `f64` so that conditions containing float literals
/// can be used as hash map keys and in Eq/Hash comparisons (needed for
/// replacement maps and candidate-set deduplication).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarValue {
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point, wrapped in OrderedFloat for Eq/Hash support.
    Double(OrderedFloat<f64>),
    /// Timestamp without timezone.
    Timestamp(NaiveDateTime),
    /// UTF-8 string; numeric-coded or categorical per the attribute type.
    Str(String),
}

impl ScalarValue {
    /// Interpret the value on the numeric axis its attribute type defines.
    ///
    /// Timestamps map to epoch seconds; numeric-coded strings parse their full
    /// text as a number. Categorical strings have no numeric interpretation.
    pub fn as_numeric(&self, attr_type: AttributeType) -> Result<f64> {
        match (self, attr_type) {
            (ScalarValue::Int(v), AttributeType::Integer) => Ok(*v as f64),
            (ScalarValue::Double(v), AttributeType::Double) => Ok(v.into_inner()),
            (ScalarValue::Timestamp(t), AttributeType::Timestamp) => {
                Ok(t.and_utc().timestamp() as f64)
            }
            (ScalarValue::Str(s), AttributeType::NumericString) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| PolicyEngineError::Parse(s.clone())),
            _ => Err(PolicyEngineError::Parse(format!("{self:?}"))),
        }
    }

    /// Total order between two values of the same attribute type.
    ///
    /// Numeric-coded strings compare numerically (`"9" < "10"`); categorical
    /// strings compare lexicographically; mixing value shapes is an error.
    pub fn compare(&self, other: &ScalarValue, attr_type: AttributeType) -> Result<Ordering> {
        match attr_type {
            AttributeType::Categorical => match (self, other) {
                (ScalarValue::Str(a), ScalarValue::Str(b)) => Ok(a.cmp(b)),
                _ => Err(PolicyEngineError::Parse(format!("{self:?} vs {other:?}"))),
            },
            AttributeType::Timestamp => match (self, other) {
                (ScalarValue::Timestamp(a), ScalarValue::Timestamp(b)) => Ok(a.cmp(b)),
                _ => Err(PolicyEngineError::Parse(format!("{self:?} vs {other:?}"))),
            },
            _ => {
                let a = self.as_numeric(attr_type)?;
                let b = other.as_numeric(attr_type)?;
                a.partial_cmp(&b)
                    .ok_or_else(|| PolicyEngineError::Parse(format!("{a} vs {b}")))
            }
        }
    }
}

/// A single comparison against a literal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub op: CompareOp,
    pub value: ScalarValue,
}

impl Predicate {
    pub fn new(op: CompareOp, value: ScalarValue) -> Self {
        Self { op, value }
    }
}

/// One attribute's contribution to a policy: a normalized range or equality.
///
/// Equality and hashing are by value (attribute, type, predicates); there is
/// no identity component, so the same condition appearing in several policies
/// deduplicates naturally in candidate sets and replacement maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: String,
    pub attr_type: AttributeType,
    /// Exactly `[>=lo, <=hi]` for a range, exactly `[=v]` for an equality.
    pub predicates: Vec<Predicate>,
}

impl Condition {
    /// A normalized range condition `attribute ∈ [low, high]`.
    pub fn range(
        attribute: impl Into<String>,
        attr_type: AttributeType,
        low: ScalarValue,
        high: ScalarValue,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            attr_type,
            predicates: vec![
                Predicate::new(CompareOp::GtEq, low),
                Predicate::new(CompareOp::LtEq, high),
            ],
        }
    }

    /// A normalized equality condition `attribute = value`.
    pub fn equality(
        attribute: impl Into<String>,
        attr_type: AttributeType,
        value: ScalarValue,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            attr_type,
            predicates: vec![Predicate::new(CompareOp::Eq, value)],
        }
    }

    pub fn is_range(&self) -> bool {
        self.predicates.len() == 2
    }

    pub fn is_equality(&self) -> bool {
        self.predicates.len() == 1
    }

    /// Lower bound of a range, or the equality value.
    pub fn low(&self) -> &ScalarValue {
        &self.predicates[0].value
    }

    /// Upper bound of a range, or the equality value.
    pub fn high(&self) -> &ScalarValue {
        &self.predicates[self.predicates.len() - 1].value
    }

    /// Does the row satisfy every predicate of this condition?
    ///
    /// A row that lacks the attribute fails the condition rather than erroring:
    /// the policy simply does not authorize it.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        let Some(value) = row.get(&self.attribute) else {
            return Ok(false);
        };
        for pred in &self.predicates {
            let ord = value.compare(&pred.value, self.attr_type)?;
            if !pred.op.evaluate(ord) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A conjunction of conditions with a stable unique id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Identity. Survives cloning and mutation; never part of value equality.
    pub id: String,
    pub conditions: Vec<Condition>,
}

impl Policy {
    pub fn new(id: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            id: id.into(),
            conditions,
        }
    }

    /// Value equality: same conditions regardless of order, ignoring the id.
    pub fn same_conditions(&self, other: &Policy) -> bool {
        self.conditions.len() == other.conditions.len()
            && self.conditions.iter().all(|c| other.conditions.contains(c))
            && other.conditions.iter().all(|c| self.conditions.contains(c))
    }

    pub fn contains(&self, condition: &Condition) -> bool {
        self.conditions.contains(condition)
    }

    pub fn contains_all(&self, conditions: &[Condition]) -> bool {
        conditions.iter().all(|c| self.contains(c))
    }

    /// Remove every condition equal (by value) to `condition`.
    pub fn remove_condition(&mut self, condition: &Condition) {
        self.conditions.retain(|c| c != condition);
    }

    /// Replace `from` with `to`, then drop any duplicate the replacement
    /// created so no attribute repeats within the policy.
    pub fn replace_condition(&mut self, from: &Condition, to: &Condition) {
        for c in &mut self.conditions {
            if c == from {
                *c = to.clone();
            }
        }
        let mut seen: Vec<Condition> = Vec::with_capacity(self.conditions.len());
        self.conditions.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(c.clone());
                true
            }
        });
    }

    /// Does the row satisfy every condition?
    pub fn matches(&self, row: &Row) -> Result<bool> {
        for condition in &self.conditions {
            if !condition.matches(row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// All non-empty subsets of this policy's conditions up to `max_size`,
    /// in a canonical order suitable for cross-policy deduplication.
    pub fn condition_subsets(&self, max_size: usize) -> Vec<Vec<Condition>> {
        let n = self.conditions.len();
        let mut subsets = Vec::new();
        if n == 0 || n > 20 {
            return subsets;
        }
        for mask in 1u32..(1u32 << n) {
            if (mask.count_ones() as usize) > max_size {
                continue;
            }
            let mut subset: Vec<Condition> = (0..n)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| self.conditions[i].clone())
                .collect();
            subset.sort_by(canonical_order);
            subsets.push(subset);
        }
        subsets
    }
}

/// Canonical ordering for conditions, used only to deduplicate subsets that
/// different policies generate in different storage orders.
pub fn canonical_order(a: &Condition, b: &Condition) -> Ordering {
    a.attribute
        .cmp(&b.attribute)
        .then_with(|| format!("{a:?}").cmp(&format!("{b:?}")))
}

/// A disjunction of policies -- the expression a row-level-security layer
/// evaluates to decide whether a row is visible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyExpression {
    pub policies: Vec<Policy>,
}

impl PolicyExpression {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    pub fn empty() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Every attribute named anywhere in the expression.
    pub fn attributes(&self) -> BTreeSet<String> {
        self.policies
            .iter()
            .flat_map(|p| p.conditions.iter().map(|c| c.attribute.clone()))
            .collect()
    }

    /// Total number of conditions across all policies.
    pub fn condition_count(&self) -> usize {
        self.policies.iter().map(|p| p.conditions.len()).sum()
    }

    /// The empty expression authorizes no row.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        for policy in &self.policies {
            if policy.matches(row)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The sub-expression of policies containing `condition` (by value).
    pub fn filter_containing(&self, condition: &Condition) -> PolicyExpression {
        PolicyExpression::new(
            self.policies
                .iter()
                .filter(|p| p.contains(condition))
                .cloned()
                .collect(),
        )
    }

    /// The sub-expression of policies containing every condition of `factor`.
    pub fn filter_containing_all(&self, factor: &[Condition]) -> PolicyExpression {
        PolicyExpression::new(
            self.policies
                .iter()
                .filter(|p| p.contains_all(factor))
                .cloned()
                .collect(),
        )
    }

    /// Remove `condition` from every policy.
    pub fn remove_condition(&mut self, condition: &Condition) {
        for policy in &mut self.policies {
            policy.remove_condition(condition);
        }
    }

    /// Remove every condition of `factor` from every policy.
    pub fn remove_conditions(&mut self, factor: &[Condition]) {
        for condition in factor {
            self.remove_condition(condition);
        }
    }

    /// Remove the policies whose ids appear in `other`.
    pub fn remove_policies_of(&mut self, other: &PolicyExpression) {
        let ids: BTreeSet<&str> = other.policies.iter().map(|p| p.id.as_str()).collect();
        self.policies.retain(|p| !ids.contains(p.id.as_str()));
    }

    /// Drop duplicate policies (compared by conditions, ignoring ids).
    /// Duplicates are semantically idempotent under OR.
    pub fn dedup(&mut self) {
        let mut kept: Vec<Policy> = Vec::with_capacity(self.policies.len());
        for policy in self.policies.drain(..) {
            if !kept.iter().any(|k| k.same_conditions(&policy)) {
                kept.push(policy);
            }
        }
        self.policies = kept;
    }

    pub fn policy_ids(&self) -> BTreeSet<String> {
        self.policies.iter().map(|p| p.id.clone()).collect()
    }

    /// An id -> value-copy map of the current policies. Captured before the
    /// overlap merger runs so later cost computations can reach the pre-merge
    /// originals.
    pub fn snapshot_by_id(&self) -> HashMap<String, Policy> {
        self.policies
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Int(v)
    }

    #[test]
    fn test_range_normalization() {
        let c = Condition::range("temperature", AttributeType::Integer, int(55), int(75));
        assert!(c.is_range());
        assert_eq!(c.predicates[0].op, CompareOp::GtEq);
        assert_eq!(c.predicates[1].op, CompareOp::LtEq);
        assert_eq!(c.low(), &int(55));
        assert_eq!(c.high(), &int(75));
    }

    #[test]
    fn test_numeric_string_compares_numerically() {
        let a = ScalarValue::Str("9".into());
        let b = ScalarValue::Str("10".into());
        assert_eq!(
            a.compare(&b, AttributeType::NumericString).unwrap(),
            Ordering::Less
        );
        // Categorical strings compare lexicographically instead.
        assert_eq!(
            a.compare(&b, AttributeType::Categorical).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_condition_matches_row() {
        let c = Condition::range("temperature", AttributeType::Integer, int(55), int(75));
        let mut row = Row::new();
        row.insert("temperature".into(), int(60));
        assert!(c.matches(&row).unwrap());
        row.insert("temperature".into(), int(80));
        assert!(!c.matches(&row).unwrap());
        // A row without the attribute is simply not authorized.
        assert!(!c.matches(&Row::new()).unwrap());
    }

    #[test]
    fn test_policy_identity_vs_value() {
        let c = Condition::equality("activity", AttributeType::Categorical, ScalarValue::Str("walking".into()));
        let p1 = Policy::new("p1", vec![c.clone()]);
        let p2 = Policy::new("p2", vec![c]);
        // Different ids, same value.
        assert!(p1.same_conditions(&p2));
        let mut expr = PolicyExpression::new(vec![p1, p2]);
        expr.dedup();
        assert_eq!(expr.len(), 1);
    }

    #[test]
    fn test_empty_expression_authorizes_nothing() {
        let expr = PolicyExpression::empty();
        let mut row = Row::new();
        row.insert("temperature".into(), int(60));
        assert!(!expr.matches(&row).unwrap());
    }

    #[test]
    fn test_replace_condition_dedups() {
        let a = Condition::range("location_id", AttributeType::NumericString,
            ScalarValue::Str("100".into()), ScalarValue::Str("199".into()));
        let b = Condition::range("location_id", AttributeType::NumericString,
            ScalarValue::Str("150".into()), ScalarValue::Str("250".into()));
        let merged = Condition::range("location_id", AttributeType::NumericString,
            ScalarValue::Str("100".into()), ScalarValue::Str("250".into()));
        let mut p = Policy::new("p", vec![a.clone(), b.clone()]);
        p.replace_condition(&a, &merged);
        p.replace_condition(&b, &merged);
        assert_eq!(p.conditions, vec![merged]);
    }

    #[test]
    fn test_condition_subsets_bounded() {
        let conds: Vec<Condition> = (0..4)
            .map(|i| Condition::equality(format!("a{i}"), AttributeType::Integer, int(i)))
            .collect();
        let p = Policy::new("p", conds);
        let subsets = p.condition_subsets(2);
        // C(4,1) + C(4,2) = 4 + 6
        assert_eq!(subsets.len(), 10);
        assert!(subsets.iter().all(|s| s.len() <= 2));
    }
}
