//! # Policy Source Decoding
//!
//! Decodes the external policy-source JSON document into the typed model. The
//! wire format is an array of policies:
//!
//! ```json
//! [{
//!   "id": "p1",
//!   "object_conditions": [{
//!     "attribute": "location_id",
//!     "type": "NUMERIC_STRING",
//!     "boolean_predicates": [
//!       {"operator": ">=", "value": "100"},
//!       {"operator": "<=", "value": "250"}
//!     ]
//!   }]
//! }]
//! ```
//!
//! Values arrive as strings and are parsed under the declared attribute type.
//! Normalization happens here: strict `>`/`<` bounds on integer-like types are
//! tightened to the equivalent inclusive bound so every stored range is exactly
//! `[>=, <=]`, and every stored equality exactly `[=]`.
//!
//! An entry that cannot be decoded or normalized is a `MalformedPolicy`: it is
//! skipped with a warning and the rest of the batch loads. Only an undecodable
//! document is fatal.

use crate::error::{PolicyEngineError, Result};
use crate::policy::{
    AttributeType, CompareOp, Condition, Policy, PolicyExpression, Predicate, ScalarValue,
    TIMESTAMP_FORMAT,
};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Wire form of a single boolean predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateSource {
    pub operator: String,
    pub value: String,
}

/// Wire form of an object condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSource {
    pub attribute: String,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    pub boolean_predicates: Vec<PredicateSource>,
}

/// Wire form of a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySource {
    pub id: String,
    pub object_conditions: Vec<ConditionSource>,
}

/// Decode a policy-source document, skipping malformed entries.
///
/// Returns an expression over every entry that decoded; each failure is logged
/// and aborts only its own entry.
pub fn parse_policies(json: &str) -> Result<PolicyExpression> {
    let sources: Vec<PolicySource> = serde_json::from_str(json)?;
    let mut policies = Vec::with_capacity(sources.len());
    for source in &sources {
        match policy_from_source(source) {
            Ok(policy) => policies.push(policy),
            Err(e) => warn!("skipping policy '{}': {e}", source.id),
        }
    }
    Ok(PolicyExpression::new(policies))
}

/// Decode one wire policy into the typed model.
pub fn policy_from_source(source: &PolicySource) -> Result<Policy> {
    let mut conditions = Vec::with_capacity(source.object_conditions.len());
    for cond in &source.object_conditions {
        let condition =
            condition_from_source(cond).map_err(|e| PolicyEngineError::MalformedPolicy {
                id: source.id.clone(),
                reason: e.to_string(),
            })?;
        conditions.push(condition);
    }
    Ok(Policy::new(source.id.clone(), conditions))
}

fn condition_from_source(source: &ConditionSource) -> Result<Condition> {
    let mut predicates = Vec::with_capacity(source.boolean_predicates.len());
    for pred in &source.boolean_predicates {
        let op = CompareOp::parse(&pred.operator)
            .ok_or_else(|| PolicyEngineError::Parse(pred.operator.clone()))?;
        let value = scalar_from_str(&pred.value, source.attr_type)?;
        predicates.push(Predicate::new(op, value));
    }
    match predicates.len() {
        1 => {
            let pred = predicates.into_iter().next().unwrap();
            if pred.op != CompareOp::Eq {
                return Err(PolicyEngineError::Parse(format!(
                    "single predicate on '{}' must be an equality",
                    source.attribute
                )));
            }
            Ok(Condition::equality(
                source.attribute.clone(),
                source.attr_type,
                pred.value,
            ))
        }
        2 => {
            let mut low = None;
            let mut high = None;
            for pred in predicates {
                match pred.op {
                    CompareOp::GtEq => low = Some(pred.value),
                    CompareOp::Gt => low = Some(tighten(pred.value, source.attr_type, 1)?),
                    CompareOp::LtEq => high = Some(pred.value),
                    CompareOp::Lt => high = Some(tighten(pred.value, source.attr_type, -1)?),
                    _ => {
                        return Err(PolicyEngineError::Parse(format!(
                            "operator '{}' cannot bound a range",
                            pred.op.as_str()
                        )))
                    }
                }
            }
            match (low, high) {
                (Some(low), Some(high)) => Ok(Condition::range(
                    source.attribute.clone(),
                    source.attr_type,
                    low,
                    high,
                )),
                _ => Err(PolicyEngineError::Parse(format!(
                    "range on '{}' needs one lower and one upper bound",
                    source.attribute
                ))),
            }
        }
        n => Err(PolicyEngineError::Parse(format!(
            "condition on '{}' has {n} predicates",
            source.attribute
        ))),
    }
}

/// Tighten a strict bound to the equivalent inclusive one. Defined only for
/// types with a discrete axis; strict double bounds cannot be normalized.
fn tighten(value: ScalarValue, attr_type: AttributeType, step: i64) -> Result<ScalarValue> {
    match (value, attr_type) {
        (ScalarValue::Int(v), AttributeType::Integer) => Ok(ScalarValue::Int(v + step)),
        (ScalarValue::Str(s), AttributeType::NumericString) => {
            let v: i64 = s
                .trim()
                .parse()
                .map_err(|_| PolicyEngineError::Parse(s.clone()))?;
            Ok(ScalarValue::Str((v + step).to_string()))
        }
        (ScalarValue::Timestamp(t), AttributeType::Timestamp) => {
            Ok(ScalarValue::Timestamp(t + Duration::seconds(step)))
        }
        (value, _) => Err(PolicyEngineError::Parse(format!(
            "strict bound on {value:?} cannot be normalized"
        ))),
    }
}

fn scalar_from_str(value: &str, attr_type: AttributeType) -> Result<ScalarValue> {
    match attr_type {
        AttributeType::Integer => value
            .trim()
            .parse::<i64>()
            .map(ScalarValue::Int)
            .map_err(|_| PolicyEngineError::Parse(value.to_string())),
        AttributeType::Double => value
            .trim()
            .parse::<f64>()
            .map(|v| ScalarValue::Double(v.into()))
            .map_err(|_| PolicyEngineError::Parse(value.to_string())),
        AttributeType::Timestamp => NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
            .map(ScalarValue::Timestamp)
            .map_err(|_| PolicyEngineError::Parse(value.to_string())),
        AttributeType::NumericString | AttributeType::Categorical => {
            Ok(ScalarValue::Str(value.to_string()))
        }
    }
}
