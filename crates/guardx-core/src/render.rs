//! # Query Rendering
//!
//! Renders the policy model to boolean-expression text for a WHERE clause
//! against the observation table:
//!
//! - a range condition prints `attr>=lo AND attr<=hi`, an equality `attr=v`;
//! - a policy is its conditions joined with `" AND "`;
//! - an expression is its parenthesized policies joined with `" OR "`;
//! - the "clean" render deduplicates identical policy clauses first;
//! - a guarded partition prints `guard AND (partition)`, optionally preceded by
//!   a `USE INDEX (<name>)` hint when rendered as a full statement.
//!
//! Literal quoting follows the attribute type: timestamps and categorical
//! strings are single-quoted, numeric-coded strings and numbers print raw.

use crate::catalog::Catalog;
use crate::policy::{
    AttributeType, Condition, Policy, PolicyExpression, ScalarValue, TIMESTAMP_FORMAT,
};
use std::fmt;

pub const CONJUNCTION: &str = " AND ";
pub const DISJUNCTION: &str = " OR ";
pub const UNION: &str = " UNION ";
pub const UNION_ALL: &str = " UNION ALL ";

/// Render a literal the way the target attribute type expects it quoted.
pub fn render_literal(value: &ScalarValue, attr_type: AttributeType) -> String {
    match value {
        ScalarValue::Int(v) => v.to_string(),
        ScalarValue::Double(v) => v.to_string(),
        ScalarValue::Timestamp(t) => format!("'{}'", t.format(TIMESTAMP_FORMAT)),
        ScalarValue::Str(s) => match attr_type {
            AttributeType::NumericString => s.clone(),
            _ => format!("'{s}'"),
        },
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for pred in &self.predicates {
            write!(
                f,
                "{sep}{}{}{}",
                self.attribute,
                pred.op.as_str(),
                render_literal(&pred.value, self.attr_type)
            )?;
            sep = CONJUNCTION;
        }
        Ok(())
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for condition in &self.conditions {
            write!(f, "{sep}{condition}")?;
            sep = CONJUNCTION;
        }
        Ok(())
    }
}

impl fmt::Display for PolicyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for policy in &self.policies {
            write!(f, "{sep}({policy})")?;
            sep = DISJUNCTION;
        }
        Ok(())
    }
}

impl PolicyExpression {
    /// OR-of-ANDs render of the expression as it stands.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Render with duplicate policy clauses removed first. Duplicates are
    /// idempotent under OR, so this changes only the text, not the semantics.
    pub fn render_clean(&self) -> String {
        let mut copy = self.clone();
        copy.dedup();
        copy.to_string()
    }
}

/// `guard AND (partition)`, with the partition deduplicated.
pub fn render_guarded(guard: &Condition, partition: &PolicyExpression) -> String {
    format!("{guard}{CONJUNCTION}({})", partition.render_clean())
}

/// A complete guarded statement against the catalog's table, with a
/// `USE INDEX` hint when the guard's attribute is indexed. A missing guard
/// renders the partition unguarded.
pub fn render_guarded_statement(
    guard: Option<&Condition>,
    partition: &PolicyExpression,
    catalog: &Catalog,
) -> String {
    match guard {
        Some(guard) => {
            let hint = catalog
                .index_name(&guard.attribute)
                .map(|idx| format!(" USE INDEX ({idx})"))
                .unwrap_or_default();
            format!(
                "SELECT * FROM {}{hint} WHERE {}",
                catalog.table,
                render_guarded(guard, partition)
            )
        }
        None => format!(
            "SELECT * FROM {} WHERE ({})",
            catalog.table,
            partition.render_clean()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use chrono::NaiveDate;

    fn user_eq(v: &str) -> Condition {
        Condition::equality(
            "user_id",
            AttributeType::NumericString,
            ScalarValue::Str(v.into()),
        )
    }

    #[test]
    fn test_range_render() {
        let c = Condition::range(
            "location_id",
            AttributeType::NumericString,
            ScalarValue::Str("100".into()),
            ScalarValue::Str("250".into()),
        );
        assert_eq!(c.to_string(), "location_id>=100 AND location_id<=250");
    }

    #[test]
    fn test_literal_quoting() {
        let ts = NaiveDate::from_ymd_opt(2017, 3, 4)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let c = Condition::range(
            "timeStamp",
            AttributeType::Timestamp,
            ScalarValue::Timestamp(ts),
            ScalarValue::Timestamp(ts),
        );
        assert_eq!(
            c.to_string(),
            "timeStamp>='2017-03-04 10:00:00' AND timeStamp<='2017-03-04 10:00:00'"
        );
        let activity = Condition::equality(
            "activity",
            AttributeType::Categorical,
            ScalarValue::Str("walking".into()),
        );
        assert_eq!(activity.to_string(), "activity='walking'");
    }

    #[test]
    fn test_expression_render_is_or_of_ands() {
        let expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![user_eq("1")]),
            Policy::new("p2", vec![user_eq("2")]),
        ]);
        assert_eq!(expr.render(), "(user_id=1) OR (user_id=2)");
    }

    #[test]
    fn test_clean_render_dedups() {
        let expr = PolicyExpression::new(vec![
            Policy::new("p1", vec![user_eq("1")]),
            Policy::new("p2", vec![user_eq("1")]),
        ]);
        assert_eq!(expr.render(), "(user_id=1) OR (user_id=1)");
        assert_eq!(expr.render_clean(), "(user_id=1)");
    }

    #[test]
    fn test_guarded_statement_uses_index_hint() {
        let catalog = Catalog::observation();
        let guard = Condition::equality(
            "activity",
            AttributeType::Categorical,
            ScalarValue::Str("walking".into()),
        );
        let partition = PolicyExpression::new(vec![Policy::new("p1", vec![user_eq("1")])]);
        let statement = render_guarded_statement(Some(&guard), &partition, &catalog);
        assert_eq!(
            statement,
            "SELECT * FROM SEMANTIC_OBSERVATION USE INDEX (idx_so_activity) \
             WHERE activity='walking' AND ((user_id=1))"
        );
    }
}
