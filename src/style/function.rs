//! Zoom and data-driven property functions

use crate::tile::data::{FeatureValue, Properties};
use serde_json::Value;
use std::fmt::Debug;

/// Types a paint property can hold.
///
/// Interpolatable types blend between stops; the rest step at each stop.
pub trait PropertyType: Clone + Debug + PartialEq + Send + Sync + 'static {
    const INTERPOLATABLE: bool;

    fn from_json(value: &Value) -> Option<Self>;

    /// Blend towards `other`. Step-only types switch once `t` reaches 1.
    fn lerp(&self, other: &Self, t: f64) -> Self;
}

impl PropertyType for f32 {
    const INTERPOLATABLE: bool = true;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64().map(|v| v as f32)
    }

    fn lerp(&self, other: &Self, t: f64) -> Self {
        *self + (*other - *self) * t as f32
    }
}

impl PropertyType for [f32; 2] {
    const INTERPOLATABLE: bool = true;

    fn from_json(value: &Value) -> Option<Self> {
        match value.as_array()?.as_slice() {
            [a, b] => Some([a.as_f64()? as f32, b.as_f64()? as f32]),
            _ => None,
        }
    }

    fn lerp(&self, other: &Self, t: f64) -> Self {
        [self[0].lerp(&other[0], t), self[1].lerp(&other[1], t)]
    }
}

impl PropertyType for bool {
    const INTERPOLATABLE: bool = false;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }

    fn lerp(&self, other: &Self, t: f64) -> Self {
        if t < 1.0 {
            *self
        } else {
            *other
        }
    }
}

impl PropertyType for String {
    const INTERPOLATABLE: bool = false;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }

    fn lerp(&self, other: &Self, t: f64) -> Self {
        if t < 1.0 {
            self.clone()
        } else {
            other.clone()
        }
    }
}

/// Position of `z` between the two stops of `range` under an exponential
/// curve with the given base.
pub fn interpolation_factor(base: f64, range: (f64, f64), z: f64) -> f64 {
    let difference = range.1 - range.0;
    let progress = z - range.0;
    if difference == 0.0 {
        0.0
    } else if base == 1.0 {
        progress / difference
    } else {
        (base.powf(progress) - 1.0) / (base.powf(difference) - 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FunctionKind {
    Exponential { base: f64 },
    Interval,
    Categorical,
    Identity,
}

impl FunctionKind {
    fn parse<T: PropertyType>(object: &serde_json::Map<String, Value>) -> Result<Self, String> {
        let base = match object.get("base") {
            None => 1.0,
            Some(value) => value
                .as_f64()
                .ok_or_else(|| "function base must be a number".to_string())?,
        };
        match object.get("type").and_then(Value::as_str) {
            None if T::INTERPOLATABLE => Ok(FunctionKind::Exponential { base }),
            None => Ok(FunctionKind::Interval),
            Some("exponential") if T::INTERPOLATABLE => Ok(FunctionKind::Exponential { base }),
            Some("exponential") => Err("exponential function on a step-only property".into()),
            Some("interval") => Ok(FunctionKind::Interval),
            Some("categorical") => Ok(FunctionKind::Categorical),
            Some("identity") => Ok(FunctionKind::Identity),
            Some(other) => Err(format!("unknown function type {}", other)),
        }
    }
}

fn parse_stops<I, T: PropertyType>(
    object: &serde_json::Map<String, Value>,
    input: impl Fn(&Value) -> Option<I>,
) -> Result<Vec<(I, T)>, String> {
    let stops = object
        .get("stops")
        .and_then(Value::as_array)
        .ok_or_else(|| "function requires a stops array".to_string())?;
    if stops.is_empty() {
        return Err("function requires at least one stop".into());
    }
    stops
        .iter()
        .map(|stop| match stop.as_array().map(Vec::as_slice) {
            Some([key, value]) => {
                let key = input(key).ok_or_else(|| format!("invalid stop input {}", key))?;
                let value =
                    T::from_json(value).ok_or_else(|| format!("invalid stop value {}", value))?;
                Ok((key, value))
            }
            _ => Err(format!("stop must be a two-element array, got {}", stop)),
        })
        .collect()
}

/// Evaluates numeric stops, shared by zoom and numeric property functions
fn evaluate_numeric<T: PropertyType>(kind: FunctionKind, stops: &[(f64, T)], input: f64) -> T {
    // Index of the last stop at or below the input
    let below = stops.iter().rposition(|(stop, _)| *stop <= input);
    match (kind, below) {
        (_, None) => stops[0].1.clone(),
        (FunctionKind::Exponential { base }, Some(i)) if i + 1 < stops.len() => {
            let (lower, upper) = (&stops[i], &stops[i + 1]);
            let t = interpolation_factor(base, (lower.0, upper.0), input);
            lower.1.lerp(&upper.1, t)
        }
        (_, Some(i)) => stops[i].1.clone(),
    }
}

/// A value that varies with zoom
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomFunction<T> {
    pub kind: FunctionKind,
    pub stops: Vec<(f64, T)>,
}

impl<T: PropertyType> ZoomFunction<T> {
    pub fn parse(object: &serde_json::Map<String, Value>) -> Result<Self, String> {
        let kind = FunctionKind::parse::<T>(object)?;
        if matches!(kind, FunctionKind::Categorical | FunctionKind::Identity) {
            return Err("zoom functions must be exponential or interval".into());
        }
        let mut stops: Vec<(f64, T)> = parse_stops(object, Value::as_f64)?;
        stops.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { kind, stops })
    }

    pub fn evaluate(&self, zoom: f64) -> T {
        evaluate_numeric(self.kind, &self.stops, zoom)
    }
}

/// A value computed from one feature property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyFunction<T> {
    pub property: String,
    pub kind: FunctionKind,
    numeric_stops: Vec<(f64, T)>,
    categorical_stops: Vec<(FeatureValue, T)>,
    pub default: Option<T>,
}

impl<T: PropertyType> PropertyFunction<T> {
    pub fn parse(object: &serde_json::Map<String, Value>) -> Result<Self, String> {
        let property = object
            .get("property")
            .and_then(Value::as_str)
            .ok_or_else(|| "property function requires a property name".to_string())?
            .to_owned();
        let kind = FunctionKind::parse::<T>(object)?;
        let default = match object.get("default") {
            None => None,
            Some(value) => Some(
                T::from_json(value).ok_or_else(|| format!("invalid default value {}", value))?,
            ),
        };
        let mut function = Self {
            property,
            kind,
            numeric_stops: Vec::new(),
            categorical_stops: Vec::new(),
            default,
        };
        match kind {
            FunctionKind::Exponential { .. } | FunctionKind::Interval => {
                function.numeric_stops = parse_stops(object, Value::as_f64)?;
                function.numeric_stops.sort_by(|a, b| a.0.total_cmp(&b.0));
            }
            FunctionKind::Categorical => {
                function.categorical_stops =
                    parse_stops(object, |key| Some(FeatureValue::from_json(key)))?;
            }
            FunctionKind::Identity => {}
        }
        Ok(function)
    }

    /// `None` when the feature lacks a usable value and no default is set
    pub fn evaluate(&self, properties: &Properties) -> Option<T> {
        let value = properties.get(&self.property);
        let result = match self.kind {
            FunctionKind::Exponential { .. } | FunctionKind::Interval => value
                .and_then(FeatureValue::as_f64)
                .map(|input| evaluate_numeric(self.kind, &self.numeric_stops, input)),
            FunctionKind::Categorical => value.and_then(|value| {
                self.categorical_stops
                    .iter()
                    .find(|(key, _)| key == value)
                    .map(|(_, output)| output.clone())
            }),
            FunctionKind::Identity => value.and_then(|value| T::from_json(&value.to_json())),
        };
        result.or_else(|| self.default.clone())
    }
}

/// The declared value of a paint property
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PropertyValue<T> {
    #[default]
    Undefined,
    Constant(T),
    Camera(ZoomFunction<T>),
    Source(PropertyFunction<T>),
}

impl<T: PropertyType> PropertyValue<T> {
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(PropertyValue::Undefined),
            Value::Object(object) if object.contains_key("property") => {
                PropertyFunction::parse(object).map(PropertyValue::Source)
            }
            Value::Object(object) => ZoomFunction::parse(object).map(PropertyValue::Camera),
            other => T::from_json(other)
                .map(PropertyValue::Constant)
                .ok_or_else(|| format!("invalid property value {}", other)),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, PropertyValue::Undefined)
    }

    pub fn is_data_driven(&self) -> bool {
        matches!(self, PropertyValue::Source(_))
    }

    /// Evaluates at `zoom` for a feature; `fallback` covers undefined values
    /// and data-driven values evaluated without a feature.
    pub fn evaluate(&self, zoom: f64, properties: Option<&Properties>, fallback: &T) -> T {
        match self {
            PropertyValue::Undefined => fallback.clone(),
            PropertyValue::Constant(value) => value.clone(),
            PropertyValue::Camera(function) => function.evaluate(zoom),
            PropertyValue::Source(function) => properties
                .and_then(|properties| function.evaluate(properties))
                .unwrap_or_else(|| function.default.clone().unwrap_or_else(|| fallback.clone())),
        }
    }
}
