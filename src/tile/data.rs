//! Decoded vector tile contents and the decoder seam

use crate::tile::error::TileError;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A feature property value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FeatureValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl FeatureValue {
    /// Nested arrays and objects are kept as their JSON text
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FeatureValue::Null,
            serde_json::Value::Bool(b) => FeatureValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(FeatureValue::Number)
                .unwrap_or(FeatureValue::Null),
            serde_json::Value::String(s) => FeatureValue::String(s.clone()),
            other => FeatureValue::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FeatureValue::Null => serde_json::Value::Null,
            FeatureValue::Bool(b) => serde_json::Value::Bool(*b),
            FeatureValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FeatureValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Null => write!(f, "null"),
            FeatureValue::Bool(b) => write!(f, "{}", b),
            FeatureValue::Number(n) => write!(f, "{}", n),
            FeatureValue::String(s) => write!(f, "{}", s),
        }
    }
}

pub type Properties = FxHashMap<String, FeatureValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

impl GeometryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryType::Point => "Point",
            GeometryType::LineString => "LineString",
            GeometryType::Polygon => "Polygon",
        }
    }
}

/// One feature in tile coordinates (`0..extent` on both axes)
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: Option<FeatureValue>,
    pub geometry_type: GeometryType,
    /// Points: one ring holding every point. Lines: one entry per line.
    /// Polygons: exterior ring first, then holes.
    pub geometry: Vec<Vec<[f32; 2]>>,
    pub properties: Properties,
}

impl Feature {
    pub fn property(&self, key: &str) -> Option<&FeatureValue> {
        self.properties.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeometryTileLayer {
    pub name: String,
    pub features: Vec<Feature>,
}

/// Decoded contents of one vector tile
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryTileData {
    pub extent: u32,
    pub layers: FxHashMap<String, GeometryTileLayer>,
}

impl GeometryTileData {
    pub fn layer(&self, name: &str) -> Option<&GeometryTileLayer> {
        self.layers.get(name)
    }

    pub fn feature_count(&self) -> usize {
        self.layers.values().map(|layer| layer.features.len()).sum()
    }
}

/// Turns fetched tile bytes into [`GeometryTileData`]. Runs on worker
/// threads.
pub trait TileDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<GeometryTileData, TileError>;
}

/// Decodes the JSON vector tile format:
///
/// ```json
/// {"extent": 4096,
///  "layers": {"roads": [{"id": 1, "type": "LineString",
///                        "geometry": [[[0, 0], [100, 100]]],
///                        "properties": {"class": "major"}}]}}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTileDecoder;

#[derive(Deserialize)]
struct RawTile {
    #[serde(default = "default_extent")]
    extent: u32,
    #[serde(default)]
    layers: BTreeMap<String, Vec<RawFeature>>,
}

#[derive(Deserialize)]
struct RawFeature {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(rename = "type")]
    geometry_type: GeometryType,
    geometry: Vec<Vec<[f32; 2]>>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

fn default_extent() -> u32 {
    crate::constants::DEFAULT_TILE_EXTENT
}

impl TileDecoder for JsonTileDecoder {
    fn decode(&self, data: &[u8]) -> Result<GeometryTileData, TileError> {
        let raw: RawTile =
            serde_json::from_slice(data).map_err(|err| TileError::Parse(err.to_string()))?;
        if raw.extent == 0 {
            return Err(TileError::Parse("tile extent must be positive".into()));
        }

        let mut layers = FxHashMap::default();
        for (name, raw_features) in raw.layers {
            let mut features = Vec::with_capacity(raw_features.len());
            for raw_feature in raw_features {
                if raw_feature.geometry.iter().all(|part| part.is_empty()) {
                    log::debug!("skipping feature without geometry in layer {}", name);
                    continue;
                }
                features.push(Feature {
                    id: raw_feature.id.as_ref().map(FeatureValue::from_json),
                    geometry_type: raw_feature.geometry_type,
                    geometry: raw_feature.geometry,
                    properties: raw_feature
                        .properties
                        .iter()
                        .map(|(key, value)| (key.clone(), FeatureValue::from_json(value)))
                        .collect(),
                });
            }
            layers.insert(name.clone(), GeometryTileLayer { name, features });
        }

        Ok(GeometryTileData {
            extent: raw.extent,
            layers,
        })
    }
}
