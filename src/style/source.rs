//! Tile sources declared by a style

use crate::constants::{
    DEFAULT_SOURCE_MAX_ZOOM, DEFAULT_SOURCE_MIN_ZOOM, RASTER_TILE_SIZE, TILE_SIZE,
};
use crate::storage::TileScheme;
use crate::{MapError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Vector,
    Raster,
}

/// A `sources` entry. Either `tiles` is given inline or `url` points at a
/// TileJSON document that provides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tiles: Vec<String>,
    #[serde(default = "default_min_zoom", rename = "minzoom")]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom", rename = "maxzoom")]
    pub max_zoom: u8,
    #[serde(default, rename = "tileSize")]
    pub tile_size: Option<u32>,
    #[serde(default)]
    pub scheme: TileScheme,
    #[serde(default)]
    pub attribution: Option<String>,
}

fn default_min_zoom() -> u8 {
    DEFAULT_SOURCE_MIN_ZOOM
}

fn default_max_zoom() -> u8 {
    DEFAULT_SOURCE_MAX_ZOOM
}

/// The fields of a TileJSON document a source takes over
#[derive(Debug, Clone, Deserialize)]
pub struct TileJson {
    pub tiles: Vec<String>,
    #[serde(default = "default_min_zoom", rename = "minzoom")]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom", rename = "maxzoom")]
    pub max_zoom: u8,
    #[serde(default)]
    pub scheme: TileScheme,
    #[serde(default)]
    pub attribution: Option<String>,
}

impl TileJson {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let tilejson: TileJson = serde_json::from_slice(data)?;
        if tilejson.tiles.is_empty() {
            return Err(MapError::Style("TileJSON lists no tile URLs".into()));
        }
        Ok(tilejson)
    }
}

impl SourceSpec {
    pub fn validate(&self, id: &str) -> Result<()> {
        if self.tiles.is_empty() && self.url.is_none() {
            return Err(MapError::Style(format!("source {}: needs tiles or url", id)));
        }
        if self.min_zoom > self.max_zoom {
            return Err(MapError::Style(format!(
                "source {}: minzoom {} above maxzoom {}",
                id, self.min_zoom, self.max_zoom
            )));
        }
        Ok(())
    }

    /// Tile templates are known, either inline or from a loaded TileJSON
    pub fn is_resolved(&self) -> bool {
        !self.tiles.is_empty()
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size.unwrap_or(match self.kind {
            SourceKind::Vector => TILE_SIZE,
            SourceKind::Raster => RASTER_TILE_SIZE,
        })
    }

    /// Inline values win over the TileJSON's
    pub fn apply_tilejson(&mut self, tilejson: TileJson) {
        if self.tiles.is_empty() {
            self.tiles = tilejson.tiles;
            self.min_zoom = tilejson.min_zoom;
            self.max_zoom = tilejson.max_zoom;
            self.scheme = tilejson.scheme;
        }
        if self.attribution.is_none() {
            self.attribution = tilejson.attribution;
        }
    }

    /// Templates rotate by tile position so requests spread across hosts
    pub fn template_for(&self, x: u32, y: u32) -> Option<&str> {
        if self.tiles.is_empty() {
            return None;
        }
        let index = (x as usize + y as usize) % self.tiles.len();
        Some(self.tiles[index].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let spec: SourceSpec =
            serde_json::from_str(r#"{"type": "vector", "tiles": ["https://a/{z}/{x}/{y}.json"]}"#)
                .unwrap();
        assert_eq!(spec.min_zoom, 0);
        assert_eq!(spec.max_zoom, 22);
        assert_eq!(spec.tile_size(), 512);
        assert_eq!(spec.scheme, TileScheme::Xyz);
        assert!(spec.validate("base").is_ok());

        let empty: SourceSpec = serde_json::from_str(r#"{"type": "raster"}"#).unwrap();
        assert_eq!(empty.tile_size(), 256);
        assert!(empty.validate("sat").is_err());
    }

    #[test]
    fn test_tilejson_fills_in_templates() {
        let mut spec: SourceSpec =
            serde_json::from_str(r#"{"type": "vector", "url": "https://a/tiles.json"}"#).unwrap();
        assert!(!spec.is_resolved());

        let tilejson = TileJson::parse(
            br#"{
                "tiles": ["https://a/{z}/{x}/{y}", "https://b/{z}/{x}/{y}"],
                "maxzoom": 14,
                "scheme": "tms"
            }"#,
        )
        .unwrap();
        spec.apply_tilejson(tilejson);
        assert!(spec.is_resolved());
        assert_eq!(spec.max_zoom, 14);
        assert_eq!(spec.scheme, TileScheme::Tms);
        assert_eq!(spec.template_for(0, 0), Some("https://a/{z}/{x}/{y}"));
        assert_eq!(spec.template_for(1, 0), Some("https://b/{z}/{x}/{y}"));

        assert!(TileJson::parse(br#"{"tiles": []}"#).is_err());
    }
}
