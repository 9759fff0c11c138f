//! # Attribute Catalog
//!
//! The catalog provides the rewriter with metadata about the observation table:
//! the total row count and, per attribute, the declared type, the domain bounds
//! used for range selectivity, the number of distinct values used for equality
//! selectivity, and the name of the backing index if one exists.
//!
//! This is configuration consumed, not computed: in a deployment the numbers
//! come from the store's own statistics, and the defaults in
//! [`Catalog::observation`] are stand-in calibration targets for the sensor
//! observation schema.

use crate::error::{PolicyEngineError, Result};
use crate::policy::AttributeType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-attribute metadata used for selectivity estimation and rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub attr_type: AttributeType,
    /// Lower end of the attribute's value domain, on the numeric axis the type
    /// defines (epoch seconds for timestamps). Unused for categorical strings.
    pub domain_low: f64,
    /// Upper end of the attribute's value domain.
    pub domain_high: f64,
    /// Number of distinct values. Equality selectivity is 1/cardinality.
    pub cardinality: f64,
    /// Name of the backing index, if the attribute is indexed.
    pub index: Option<String>,
}

impl AttributeInfo {
    pub fn new(attr_type: AttributeType, domain_low: f64, domain_high: f64, cardinality: f64) -> Self {
        Self {
            attr_type,
            domain_low,
            domain_high,
            cardinality,
            index: None,
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn domain_size(&self) -> f64 {
        self.domain_high - self.domain_low
    }
}

/// Table-level metadata: row count plus the attribute map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// Table the rendered queries run against.
    pub table: String,
    /// Total row count N.
    pub row_count: f64,
    pub attributes: HashMap<String, AttributeInfo>,
}

impl Catalog {
    pub fn new(table: impl Into<String>, row_count: f64) -> Self {
        Self {
            table: table.into(),
            row_count,
            attributes: HashMap::new(),
        }
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, info: AttributeInfo) {
        self.attributes.insert(name.into(), info);
    }

    pub fn attribute(&self, name: &str) -> Result<&AttributeInfo> {
        self.attributes
            .get(name)
            .ok_or_else(|| PolicyEngineError::UnknownAttribute(name.to_string()))
    }

    pub fn is_indexed(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .map(|a| a.index.is_some())
            .unwrap_or(false)
    }

    pub fn index_name(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|a| a.index.as_deref())
    }

    /// The default sensor observation table.
    ///
    /// Columns: `user_id` and `location_id` are numeric-coded strings,
    /// `timeStamp` spans one calendar year of observations, `temperature` and
    /// `energy` are unindexed doubles, and `activity` is a small categorical
    /// domain. Replace per deployment.
    pub fn observation() -> Self {
        let mut catalog = Catalog::new("SEMANTIC_OBSERVATION", 10_000_000.0);
        catalog.add_attribute(
            "user_id",
            AttributeInfo::new(AttributeType::NumericString, 0.0, 5000.0, 5000.0)
                .with_index("idx_so_user"),
        );
        catalog.add_attribute(
            "location_id",
            AttributeInfo::new(AttributeType::NumericString, 1000.0, 4000.0, 300.0)
                .with_index("idx_so_location"),
        );
        // 2017-01-01 00:00:00 .. 2018-01-01 00:00:00 UTC, in epoch seconds.
        catalog.add_attribute(
            "timeStamp",
            AttributeInfo::new(
                AttributeType::Timestamp,
                1_483_228_800.0,
                1_514_764_800.0,
                31_536_000.0,
            )
            .with_index("idx_so_ts"),
        );
        catalog.add_attribute(
            "temperature",
            AttributeInfo::new(AttributeType::Double, 55.0, 75.0, 20.0),
        );
        catalog.add_attribute(
            "energy",
            AttributeInfo::new(AttributeType::Double, 0.0, 100.0, 100.0),
        );
        catalog.add_attribute(
            "activity",
            AttributeInfo::new(AttributeType::Categorical, 0.0, 0.0, 10.0)
                .with_index("idx_so_activity"),
        );
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_defaults() {
        let catalog = Catalog::observation();
        assert!(catalog.is_indexed("user_id"));
        assert!(catalog.is_indexed("activity"));
        assert!(!catalog.is_indexed("temperature"));
        assert_eq!(catalog.index_name("location_id"), Some("idx_so_location"));
        assert!(matches!(
            catalog.attribute("nonexistent"),
            Err(PolicyEngineError::UnknownAttribute(_))
        ));
    }
}
