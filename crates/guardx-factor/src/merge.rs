//! # Overlap Merger
//!
//! Before factoring, same-attribute conditions that are "close enough" are
//! coalesced into one wider range. The widened range admits rows none of the
//! originals admitted -- a controlled precision loss -- but identical merged
//! conditions across policies are what give the factorizers something to pull
//! out.
//!
//! ## Sweep
//!
//! Conditions are grouped by attribute and sorted by range start, then swept
//! with a stack: push the first; for each next condition test overlap against
//! the stack top with the type-specific slack below; on overlap extend the
//! top's upper bound to the larger endpoint, record both originals against the
//! merged condition in a replacement map, and continue. After the sweep every
//! affected policy is rewritten through the (chain-resolved) replacement map.
//!
//! ## Slack Rules
//!
//! - **Integer**: direct interval intersection.
//! - **Timestamp**: both ranges extended by one minute before the test.
//! - **Numeric-coded strings**: `user_id` gets ±1000; `location_id` compares
//!   the first four characters with ±100; other numeric-coded attributes
//!   intersect directly.
//! - **Categorical**: never overlaps.
//! - **Double** (and anything else): no rule -- `IncompatibleAttributeType`.
//!
//! A numeric-coded value that fails to parse skips that overlap candidate with
//! a warning and the sweep continues; the rewrite stays total. Timestamps are
//! typed at load, so they cannot be malformed here.
//!
//! ## Gain Gate
//!
//! `MergeGate::GainGated` reinstates the per-pair gain test
//! `l_intersection + F_a1 + F_a2 > 0`, where each F is the donor policy's
//! selectivity drop from removing its condition. When a condition occurs in
//! several policies the donor is the one whose residual selectivity is
//! smallest -- least informative to retain, since the condition is about to be
//! absorbed into the merged range. The default `Always` merges every
//! overlapping pair unconditionally.

use guardx_core::catalog::Catalog;
use guardx_core::error::{PolicyEngineError, Result};
use guardx_core::policy::{AttributeType, Condition, Policy, PolicyExpression, ScalarValue};
use guardx_core::stats::{condition_selectivity, policy_selectivity, residual_selectivity};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Extension applied to both sides of a timestamp range before the overlap test.
const TIMESTAMP_SLACK_SECS: i64 = 60;
/// Slack for `user_id` numeric codes.
const USER_ID_SLACK: i64 = 1000;
/// Slack for `location_id` numeric codes (first four characters).
const LOCATION_ID_SLACK: i64 = 100;

/// Whether a pair of overlapping conditions must also pass the gain test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeGate {
    /// Merge every overlapping pair.
    #[default]
    Always,
    /// Merge only pairs whose estimated gain is positive.
    GainGated,
}

/// Consolidates overlapping same-attribute conditions across an expression.
pub struct PredicateMerger<'a> {
    catalog: &'a Catalog,
    gate: MergeGate,
}

impl<'a> PredicateMerger<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            gate: MergeGate::Always,
        }
    }

    pub fn with_gate(catalog: &'a Catalog, gate: MergeGate) -> Self {
        Self { catalog, gate }
    }

    /// Merge overlapping conditions in place. Returns the resolved
    /// original-to-merged replacement pairs that were applied.
    pub fn merge(&self, expression: &mut PolicyExpression) -> Result<Vec<(Condition, Condition)>> {
        let mut replacements: HashMap<Condition, Condition> = HashMap::new();

        for attribute in expression.attributes() {
            // Distinct conditions on this attribute, each with the ids of the
            // policies it occurs in (for donor selection under the gain gate).
            let mut pools: Vec<(Condition, Vec<String>)> = Vec::new();
            for policy in &expression.policies {
                for condition in policy.conditions.iter().filter(|c| c.attribute == attribute) {
                    match pools.iter_mut().find(|(c, _)| c == condition) {
                        Some((_, ids)) => ids.push(policy.id.clone()),
                        None => pools.push((condition.clone(), vec![policy.id.clone()])),
                    }
                }
            }
            if pools.len() < 2 {
                continue;
            }
            let attr_type = pools[0].0.attr_type;
            if attr_type == AttributeType::Categorical {
                continue;
            }

            // Sort by range start. Conditions whose start cannot be
            // interpreted are left out of the sweep (and thus untouched).
            let mut ordered: Vec<Condition> = Vec::with_capacity(pools.len());
            let mut keys: Vec<f64> = Vec::with_capacity(pools.len());
            for (condition, _) in &pools {
                match condition.low().as_numeric(attr_type) {
                    Ok(key) => {
                        ordered.push(condition.clone());
                        keys.push(key);
                    }
                    Err(PolicyEngineError::Parse(v)) => {
                        warn!("excluding '{attribute}' condition with unparsable start '{v}' from merge");
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut order: Vec<usize> = (0..ordered.len()).collect();
            order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
            let ordered: Vec<Condition> = order.into_iter().map(|i| ordered[i].clone()).collect();
            if ordered.len() < 2 {
                continue;
            }

            let mut pool_map: HashMap<Condition, Vec<String>> = pools.into_iter().collect();
            let mut stack: Vec<Condition> = vec![ordered[0].clone()];
            for next in &ordered[1..] {
                let top = stack.last().unwrap().clone();
                let overlapping = match self.overlaps(&top, next) {
                    Ok(b) => b,
                    Err(PolicyEngineError::Parse(v)) => {
                        warn!("skipping overlap test on '{attribute}': unparsable value '{v}'");
                        false
                    }
                    Err(e) => return Err(e),
                };
                if !overlapping {
                    stack.push(next.clone());
                    continue;
                }
                if self.gate == MergeGate::GainGated
                    && !self.merge_gain_positive(expression, &pool_map, next, &top)?
                {
                    stack.push(next.clone());
                    continue;
                }

                // Extend the top's upper bound to the larger endpoint; the
                // lower bound is already the smaller one by sort order.
                let high = match next.high().compare(top.high(), attr_type) {
                    Ok(std::cmp::Ordering::Greater) => next.high().clone(),
                    _ => top.high().clone(),
                };
                let merged = Condition::range(attribute.clone(), attr_type, top.low().clone(), high);
                debug!("merging '{top}' and '{next}' into '{merged}'");

                if merged != top {
                    replacements.insert(top.clone(), merged.clone());
                }
                if &merged != next {
                    replacements.insert(next.clone(), merged.clone());
                }
                let mut pool = pool_map.remove(&top).unwrap_or_default();
                pool.extend(pool_map.get(next).cloned().unwrap_or_default());
                pool_map.insert(merged.clone(), pool);
                stack.pop();
                stack.push(merged);
            }
        }

        // Rewrite every affected policy through the chain-resolved map.
        let applied: Vec<(Condition, Condition)> = replacements
            .keys()
            .map(|c| (c.clone(), resolve(&replacements, c)))
            .collect();
        for (from, to) in &applied {
            for policy in &mut expression.policies {
                policy.replace_condition(from, to);
            }
        }
        Ok(applied)
    }

    /// Type-specific overlap test between two same-attribute conditions.
    fn overlaps(&self, a: &Condition, b: &Condition) -> Result<bool> {
        match a.attr_type {
            AttributeType::Integer => {
                let (s1, e1) = numeric_bounds(a)?;
                let (s2, e2) = numeric_bounds(b)?;
                Ok(s1 <= e2 && e1 >= s2)
            }
            AttributeType::Timestamp => {
                let (s1, e1) = numeric_bounds(a)?;
                let (s2, e2) = numeric_bounds(b)?;
                let ext = TIMESTAMP_SLACK_SECS as f64;
                Ok(s1 - ext < e2 + ext && e1 + ext > s2 - ext)
            }
            AttributeType::NumericString => {
                if a.attribute.eq_ignore_ascii_case("user_id") {
                    let (s1, e1) = code_bounds(a, usize::MAX)?;
                    let (s2, e2) = code_bounds(b, usize::MAX)?;
                    Ok(s1 - USER_ID_SLACK <= e2 + USER_ID_SLACK
                        && e1 + USER_ID_SLACK >= s2 - USER_ID_SLACK)
                } else if a.attribute.eq_ignore_ascii_case("location_id") {
                    let (s1, e1) = code_bounds(a, 4)?;
                    let (s2, e2) = code_bounds(b, 4)?;
                    Ok(s1 - LOCATION_ID_SLACK <= e2 + LOCATION_ID_SLACK
                        && e1 + LOCATION_ID_SLACK >= s2 - LOCATION_ID_SLACK)
                } else {
                    let (s1, e1) = code_bounds(a, usize::MAX)?;
                    let (s2, e2) = code_bounds(b, usize::MAX)?;
                    Ok(s1 <= e2 && e1 >= s2)
                }
            }
            AttributeType::Categorical => Ok(false),
            AttributeType::Double => Err(PolicyEngineError::IncompatibleAttributeType {
                attribute: a.attribute.clone(),
            }),
        }
    }

    /// The gated merge test: `l_intersection + F_a1 + F_a2 > 0`.
    fn merge_gain_positive(
        &self,
        expression: &PolicyExpression,
        pools: &HashMap<Condition, Vec<String>>,
        a1: &Condition,
        a2: &Condition,
    ) -> Result<bool> {
        let f1 = self.donor_selectivity_drop(expression, pools, a1)?;
        let f2 = self.donor_selectivity_drop(expression, pools, a2)?;
        let l_intersection =
            condition_selectivity(self.catalog, a1)? * condition_selectivity(self.catalog, a2)?;
        Ok(l_intersection + f1 + f2 > 0.0)
    }

    /// `F = L(donor) - L(donor without the condition)` for the donor policy
    /// with the smallest residual selectivity.
    fn donor_selectivity_drop(
        &self,
        expression: &PolicyExpression,
        pools: &HashMap<Condition, Vec<String>>,
        condition: &Condition,
    ) -> Result<f64> {
        let donor = self.choose_donor(expression, pools, condition)?;
        let full = policy_selectivity(self.catalog, &donor)?;
        let residual = residual_selectivity(self.catalog, &donor, condition)?;
        Ok(full - residual)
    }

    /// Among the policies a condition occurs in, pick the one whose remaining
    /// conditions are least selective once this condition is removed.
    fn choose_donor(
        &self,
        expression: &PolicyExpression,
        pools: &HashMap<Condition, Vec<String>>,
        condition: &Condition,
    ) -> Result<Policy> {
        let ids = pools.get(condition).cloned().unwrap_or_default();
        let mut best: Option<(f64, Policy)> = None;
        for policy in expression
            .policies
            .iter()
            .filter(|p| ids.iter().any(|id| id == &p.id))
        {
            let residual = residual_selectivity(self.catalog, policy, condition)?;
            if best.as_ref().map(|(r, _)| residual < *r).unwrap_or(true) {
                best = Some((residual, policy.clone()));
            }
        }
        best.map(|(_, p)| p)
            .ok_or(PolicyEngineError::EmptyExpression)
    }
}

/// Follow replacement chains to the final merged condition. A condition merged
/// into a range that itself later widened maps through each intermediate step.
fn resolve(replacements: &HashMap<Condition, Condition>, condition: &Condition) -> Condition {
    let mut current = condition.clone();
    let mut hops = 0;
    while let Some(next) = replacements.get(&current) {
        if *next == current || hops > replacements.len() {
            break;
        }
        current = next.clone();
        hops += 1;
    }
    current
}

fn numeric_bounds(condition: &Condition) -> Result<(f64, f64)> {
    Ok((
        condition.low().as_numeric(condition.attr_type)?,
        condition.high().as_numeric(condition.attr_type)?,
    ))
}

/// Numeric-coded string bounds, truncated to `prefix` characters.
fn code_bounds(condition: &Condition, prefix: usize) -> Result<(i64, i64)> {
    Ok((
        code_value(condition.low(), prefix)?,
        code_value(condition.high(), prefix)?,
    ))
}

fn code_value(value: &ScalarValue, prefix: usize) -> Result<i64> {
    let ScalarValue::Str(s) = value else {
        return Err(PolicyEngineError::Parse(format!("{value:?}")));
    };
    let text = s.trim();
    let text = text.get(..prefix.min(text.len())).unwrap_or(text);
    text.parse::<i64>()
        .map_err(|_| PolicyEngineError::Parse(s.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use guardx_core::policy::Policy;

    fn loc_range(lo: &str, hi: &str) -> Condition {
        Condition::range(
            "location_id",
            AttributeType::NumericString,
            ScalarValue::Str(lo.into()),
            ScalarValue::Str(hi.into()),
        )
    }

    fn user_range(lo: &str, hi: &str) -> Condition {
        Condition::range(
            "user_id",
            AttributeType::NumericString,
            ScalarValue::Str(lo.into()),
            ScalarValue::Str(hi.into()),
        )
    }

    fn ts(h: u32, m: u32, s: u32) -> ScalarValue {
        ScalarValue::Timestamp(
            NaiveDate::from_ymd_opt(2017, 3, 4)
                .unwrap()
                .and_hms_opt(h, m, s)
                .unwrap(),
        )
    }

    #[test]
    fn test_overlapping_location_ranges_merge() {
        let catalog = Catalog::observation();
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![loc_range("100", "199")]),
            Policy::new("p2", vec![loc_range("150", "250")]),
        ]);
        let applied = PredicateMerger::new(&catalog).merge(&mut expr).unwrap();

        let merged = loc_range("100", "250");
        assert_eq!(expr.policies[0].conditions, vec![merged.clone()]);
        assert_eq!(expr.policies[1].conditions, vec![merged.clone()]);
        // Both originals map to the merged condition.
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().all(|(_, to)| *to == merged));
        // Ids survive the rewrite.
        assert_eq!(expr.policies[0].id, "p1");
        assert_eq!(expr.policies[1].id, "p2");
    }

    #[test]
    fn test_merged_range_covers_both_inputs() {
        let catalog = Catalog::observation();
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![loc_range("1200", "1400")]),
            Policy::new("p2", vec![loc_range("1250", "1300")]),
        ]);
        PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        // The second range is contained in the first; the merged range is the
        // first, and both policies now carry it.
        let merged = loc_range("1200", "1400");
        assert_eq!(expr.policies[0].conditions, vec![merged.clone()]);
        assert_eq!(expr.policies[1].conditions, vec![merged]);
    }

    #[test]
    fn test_user_slack_merges_near_ranges() {
        let catalog = Catalog::observation();
        // Gap of 1400 is within the combined ±1000 slack.
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![user_range("0", "100")]),
            Policy::new("p2", vec![user_range("1500", "1600")]),
        ]);
        PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        assert_eq!(expr.policies[0].conditions, vec![user_range("0", "1600")]);
    }

    #[test]
    fn test_distant_user_ranges_do_not_merge() {
        let catalog = Catalog::observation();
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![user_range("0", "100")]),
            Policy::new("p2", vec![user_range("2500", "2600")]),
        ]);
        let applied = PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        assert!(applied.is_empty());
        assert_eq!(expr.policies[0].conditions, vec![user_range("0", "100")]);
    }

    #[test]
    fn test_timestamp_minute_extension() {
        let catalog = Catalog::observation();
        // 30-second gap: bridged by the ±1-minute extensions.
        let near = Condition::range("timeStamp", AttributeType::Timestamp, ts(10, 0, 0), ts(10, 30, 0));
        let close = Condition::range("timeStamp", AttributeType::Timestamp, ts(10, 30, 30), ts(11, 0, 0));
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![near]),
            Policy::new("p2", vec![close]),
        ]);
        PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        let merged = Condition::range("timeStamp", AttributeType::Timestamp, ts(10, 0, 0), ts(11, 0, 0));
        assert_eq!(expr.policies[0].conditions, vec![merged]);

        // A five-minute gap stays apart.
        let far = Condition::range("timeStamp", AttributeType::Timestamp, ts(11, 5, 0), ts(11, 30, 0));
        let apart = Condition::range("timeStamp", AttributeType::Timestamp, ts(10, 0, 0), ts(11, 0, 0));
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![apart.clone()]),
            Policy::new("p2", vec![far.clone()]),
        ]);
        let applied = PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        assert!(applied.is_empty());
        assert_eq!(expr.policies[0].conditions, vec![apart]);
        assert_eq!(expr.policies[1].conditions, vec![far]);
    }

    #[test]
    fn test_categorical_never_merges() {
        let catalog = Catalog::observation();
        let a = Condition::equality("activity", AttributeType::Categorical, ScalarValue::Str("walking".into()));
        let b = Condition::equality("activity", AttributeType::Categorical, ScalarValue::Str("working".into()));
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![a.clone()]),
            Policy::new("p2", vec![b.clone()]),
        ]);
        let applied = PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        assert!(applied.is_empty());
        assert_eq!(expr.policies[0].conditions, vec![a]);
        assert_eq!(expr.policies[1].conditions, vec![b]);
    }

    #[test]
    fn test_double_attribute_is_incompatible() {
        let catalog = Catalog::observation();
        let a = Condition::range("temperature", AttributeType::Double,
            ScalarValue::Double(55.0.into()), ScalarValue::Double(65.0.into()));
        let b = Condition::range("temperature", AttributeType::Double,
            ScalarValue::Double(60.0.into()), ScalarValue::Double(70.0.into()));
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![a]),
            Policy::new("p2", vec![b]),
        ]);
        assert!(matches!(
            PredicateMerger::new(&catalog).merge(&mut expr),
            Err(PolicyEngineError::IncompatibleAttributeType { .. })
        ));
    }

    #[test]
    fn test_unparsable_code_skips_candidate_only() {
        let catalog = Catalog::observation();
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![loc_range("100", "199")]),
            Policy::new("p2", vec![loc_range("bad", "worse")]),
            Policy::new("p3", vec![loc_range("150", "250")]),
        ]);
        PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        // The parsable pair still merges; the malformed one is untouched.
        assert_eq!(expr.policies[0].conditions, vec![loc_range("100", "250")]);
        assert_eq!(expr.policies[1].conditions, vec![loc_range("bad", "worse")]);
        assert_eq!(expr.policies[2].conditions, vec![loc_range("100", "250")]);
    }

    #[test]
    fn test_chained_merges_resolve_transitively() {
        let catalog = Catalog::observation();
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![loc_range("100", "199")]),
            Policy::new("p2", vec![loc_range("150", "250")]),
            Policy::new("p3", vec![loc_range("240", "300")]),
        ]);
        PredicateMerger::new(&catalog).merge(&mut expr).unwrap();
        let merged = loc_range("100", "300");
        for policy in &expr.policies {
            assert_eq!(policy.conditions, vec![merged.clone()]);
        }
    }

    #[test]
    fn test_gain_gate_blocks_selective_merges() {
        let catalog = Catalog::observation();
        // Each policy is just a narrow location range: absorbing it into a
        // wider range surrenders nearly all of its selectivity, far more than
        // the tiny intersection term recovers, so the gated merger declines.
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![loc_range("1000", "1100")]),
            Policy::new("p2", vec![loc_range("1150", "1250")]),
        ]);
        let applied = PredicateMerger::with_gate(&catalog, MergeGate::GainGated)
            .merge(&mut expr)
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(expr.policies[0].conditions, vec![loc_range("1000", "1100")]);
    }

    #[test]
    fn test_gain_gate_accepts_wide_merges() {
        let catalog = Catalog::observation();
        // Ranges already spanning most of the domain lose almost nothing by
        // widening, and their intersection term dominates.
        let mut expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![loc_range("1000", "3900")]),
            Policy::new("p2", vec![loc_range("1100", "4000")]),
        ]);
        PredicateMerger::with_gate(&catalog, MergeGate::GainGated)
            .merge(&mut expr)
            .unwrap();
        let merged = loc_range("1000", "4000");
        assert_eq!(expr.policies[0].conditions, vec![merged.clone()]);
        assert_eq!(expr.policies[1].conditions, vec![merged]);
    }
}
