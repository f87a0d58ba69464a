//! Feature filters

use crate::tile::data::{Feature, FeatureValue};
use serde_json::Value;

/// Which features a layer draws
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    Always,
    All(Vec<Filter>),
    Any(Vec<Filter>),
    None(Vec<Filter>),
    Equals(String, FeatureValue),
    NotEquals(String, FeatureValue),
    Has(String),
    NotHas(String),
    In(String, Vec<FeatureValue>),
    NotIn(String, Vec<FeatureValue>),
}

impl Filter {
    /// Parses the array filter syntax, e.g. `["==", "class", "major"]`.
    /// `$type` and `$id` address the geometry type and feature id.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let items = value
            .as_array()
            .ok_or_else(|| format!("filter must be an array, got {}", value))?;
        let (op, args) = items
            .split_first()
            .ok_or_else(|| "filter must not be empty".to_string())?;
        let op = op
            .as_str()
            .ok_or_else(|| format!("filter operator must be a string, got {}", op))?;

        let key = |index: usize| -> Result<String, String> {
            args.get(index)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| format!("'{}' filter requires a key", op))
        };
        let literal = |index: usize| -> Result<FeatureValue, String> {
            args.get(index)
                .map(FeatureValue::from_json)
                .ok_or_else(|| format!("'{}' filter requires a value", op))
        };
        let nested = || args.iter().map(Filter::parse).collect::<Result<Vec<_>, _>>();

        Ok(match op {
            "all" => Filter::All(nested()?),
            "any" => Filter::Any(nested()?),
            "none" => Filter::None(nested()?),
            "==" => Filter::Equals(key(0)?, literal(1)?),
            "!=" => Filter::NotEquals(key(0)?, literal(1)?),
            "has" => Filter::Has(key(0)?),
            "!has" => Filter::NotHas(key(0)?),
            "in" => Filter::In(key(0)?, args[1..].iter().map(FeatureValue::from_json).collect()),
            "!in" => {
                Filter::NotIn(key(0)?, args[1..].iter().map(FeatureValue::from_json).collect())
            }
            other => return Err(format!("unsupported filter operator {}", other)),
        })
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        match self {
            Filter::Always => true,
            Filter::All(filters) => filters.iter().all(|f| f.matches(feature)),
            Filter::Any(filters) => filters.iter().any(|f| f.matches(feature)),
            Filter::None(filters) => !filters.iter().any(|f| f.matches(feature)),
            Filter::Equals(key, value) => lookup(feature, key).as_ref() == Some(value),
            Filter::NotEquals(key, value) => lookup(feature, key).as_ref() != Some(value),
            Filter::Has(key) => lookup(feature, key).is_some(),
            Filter::NotHas(key) => lookup(feature, key).is_none(),
            Filter::In(key, values) => lookup(feature, key).map_or(false, |v| values.contains(&v)),
            Filter::NotIn(key, values) => {
                lookup(feature, key).map_or(true, |v| !values.contains(&v))
            }
        }
    }
}

fn lookup(feature: &Feature, key: &str) -> Option<FeatureValue> {
    match key {
        "$type" => Some(FeatureValue::String(feature.geometry_type.as_str().into())),
        "$id" => feature.id.clone(),
        _ => feature.property(key).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::data::{GeometryType, Properties};
    use serde_json::json;

    fn road(class: &str) -> Feature {
        let mut properties = Properties::default();
        properties.insert("class".into(), FeatureValue::String(class.into()));
        properties.insert("lanes".into(), FeatureValue::Number(2.0));
        Feature {
            id: Some(FeatureValue::Number(1.0)),
            geometry_type: GeometryType::LineString,
            geometry: vec![vec![[0.0, 0.0], [1.0, 1.0]]],
            properties,
        }
    }

    #[test]
    fn test_comparison_filters() {
        let major = road("major");
        let minor = road("minor");

        let eq = Filter::parse(&json!(["==", "class", "major"])).unwrap();
        assert!(eq.matches(&major));
        assert!(!eq.matches(&minor));

        let ne = Filter::parse(&json!(["!=", "class", "major"])).unwrap();
        assert!(ne.matches(&minor));

        // Numbers compare by value regardless of integer/float spelling
        let lanes = Filter::parse(&json!(["==", "lanes", 2])).unwrap();
        assert!(lanes.matches(&major));

        let membership = Filter::parse(&json!(["in", "class", "major", "trunk"])).unwrap();
        assert!(membership.matches(&major));
        assert!(!membership.matches(&minor));
    }

    #[test]
    fn test_compound_and_special_keys() {
        let filter = Filter::parse(&json!([
            "all",
            ["==", "$type", "LineString"],
            ["has", "class"],
            ["!has", "bridge"],
            ["==", "$id", 1]
        ]))
        .unwrap();
        assert!(filter.matches(&road("minor")));

        let none = Filter::parse(&json!(["none", ["==", "class", "minor"]])).unwrap();
        assert!(none.matches(&road("major")));
        assert!(!none.matches(&road("minor")));
    }

    #[test]
    fn test_rejects_bad_filters() {
        assert!(Filter::parse(&json!([])).is_err());
        assert!(Filter::parse(&json!(["~=", "a", 1])).is_err());
        assert!(Filter::parse(&json!(["==", "a"])).is_err());
        assert!(Filter::parse(&json!("==")).is_err());
    }
}
