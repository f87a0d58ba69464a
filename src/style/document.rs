//! The style document

use crate::core::geo::LatLng;
use crate::style::layer::StyleLayer;
use crate::style::source::SourceSpec;
use crate::style::transition::TransitionOptions;
use crate::{MapError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

/// A parsed style: sources, ordered layers and the glyph and sprite
/// locations.
#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    pub version: u64,
    pub name: Option<String>,
    pub sources: BTreeMap<String, SourceSpec>,
    layers: Vec<StyleLayer>,
    pub glyphs: Option<String>,
    pub sprite: Option<String>,
    pub transition: TransitionOptions,
    pub center: Option<LatLng>,
    pub zoom: Option<f64>,
}

fn message(err: MapError) -> String {
    match err {
        MapError::Style(message) => message,
        other => other.to_string(),
    }
}

impl Style {
    /// Parses a style document. Every problem found is reported together in
    /// a single [`MapError::Style`].
    pub fn parse(json: &str, now: Instant) -> Result<Self> {
        let root: Value = serde_json::from_str(json)?;
        let root = root
            .as_object()
            .ok_or_else(|| MapError::Style("style must be a JSON object".into()))?;
        let mut errors = Vec::new();

        let version = root.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version != 8 {
            errors.push(format!("unsupported style version {}", version));
        }

        let transition = match root.get("transition") {
            None => TransitionOptions::default(),
            Some(value) => TransitionOptions::parse(value).unwrap_or_else(|e| {
                errors.push(e);
                TransitionOptions::default()
            }),
        };

        let mut sources = BTreeMap::new();
        match root.get("sources").and_then(Value::as_object) {
            None => errors.push("style requires a sources object".into()),
            Some(entries) => {
                for (id, value) in entries {
                    match serde_json::from_value::<SourceSpec>(value.clone()) {
                        Ok(spec) => match spec.validate(id) {
                            Ok(()) => {
                                sources.insert(id.clone(), spec);
                            }
                            Err(err) => errors.push(message(err)),
                        },
                        Err(err) => errors.push(format!("source {}: {}", id, err)),
                    }
                }
            }
        }

        let mut layers: Vec<StyleLayer> = Vec::new();
        match root.get("layers").and_then(Value::as_array) {
            None => errors.push("style requires a layers array".into()),
            Some(entries) => {
                for value in entries {
                    match StyleLayer::from_json(value, now) {
                        Ok(layer) => {
                            if layers.iter().any(|l| l.id == layer.id) {
                                errors.push(format!("duplicate layer id {}", layer.id));
                                continue;
                            }
                            if let Some(source) = &layer.source {
                                if !sources.contains_key(source) {
                                    errors.push(format!(
                                        "layer {}: unknown source {}",
                                        layer.id, source
                                    ));
                                    continue;
                                }
                            }
                            layers.push(layer);
                        }
                        Err(err) => errors.push(message(err)),
                    }
                }
            }
        }

        let glyphs = root.get("glyphs").and_then(Value::as_str).map(str::to_owned);
        if let Some(template) = &glyphs {
            if !template.contains("{range}") {
                errors.push("glyphs URL must contain {range}".into());
            }
        }

        let center = root
            .get("center")
            .and_then(Value::as_array)
            .and_then(|pair| match pair.as_slice() {
                [lng, lat] => Some(LatLng::new(lat.as_f64()?, lng.as_f64()?)),
                _ => None,
            });

        if !errors.is_empty() {
            return Err(MapError::Style(errors.join("; ")));
        }

        Ok(Style {
            version,
            name: root.get("name").and_then(Value::as_str).map(str::to_owned),
            sources,
            layers,
            glyphs,
            sprite: root.get("sprite").and_then(Value::as_str).map(str::to_owned),
            transition,
            center,
            zoom: root.get("zoom").and_then(Value::as_f64),
        })
    }

    pub fn layers(&self) -> &[StyleLayer] {
        &self.layers
    }

    pub fn layer(&self, id: &str) -> Option<&StyleLayer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    pub fn layer_mut(&mut self, id: &str) -> Option<&mut StyleLayer> {
        self.layers.iter_mut().find(|layer| layer.id == id)
    }

    /// Layers drawing from `source_id`, in draw order
    pub fn layers_for_source<'a>(
        &'a self,
        source_id: &'a str,
    ) -> impl Iterator<Item = &'a StyleLayer> + 'a {
        self.layers
            .iter()
            .filter(move |layer| layer.source.as_deref() == Some(source_id))
    }

    pub fn source(&self, id: &str) -> Option<&SourceSpec> {
        self.sources.get(id)
    }

    pub fn source_mut(&mut self, id: &str) -> Option<&mut SourceSpec> {
        self.sources.get_mut(id)
    }

    /// Sets a paint property on a layer. Returns the layer's source when
    /// the value changed, so the caller can rebuild that source's tiles.
    pub fn set_paint_property(
        &mut self,
        layer_id: &str,
        name: &str,
        value: &Value,
        now: Instant,
    ) -> Result<Option<String>> {
        let defaults = self.transition;
        let layer = self
            .layer_mut(layer_id)
            .ok_or_else(|| MapError::Style(format!("no layer {}", layer_id)))?;
        let changed = layer.set_paint_property(name, value, &defaults, now)?;
        Ok(if changed {
            Some(layer.source.clone().unwrap_or_default())
        } else {
            None
        })
    }

    pub fn has_transition(&self, now: Instant) -> bool {
        self.layers.iter().any(|layer| layer.has_transition(now))
    }

    pub fn prune_transitions(&mut self, now: Instant) {
        for layer in &mut self.layers {
            layer.prune_transitions(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STYLE: &str = r##"{
        "version": 8,
        "name": "test",
        "center": [13.4, 52.5],
        "zoom": 10,
        "glyphs": "https://fonts/{fontstack}/{range}.pbf",
        "sprite": "https://sprites/base",
        "transition": {"duration": 300},
        "sources": {
            "base": {"type": "vector", "tiles": ["https://t/{z}/{x}/{y}.json"], "maxzoom": 14}
        },
        "layers": [
            {"id": "bg", "type": "background", "paint": {"background-color": "#eee"}},
            {"id": "water", "type": "fill", "source": "base", "source-layer": "water"},
            {"id": "roads", "type": "line", "source": "base", "source-layer": "road"}
        ]
    }"##;

    #[test]
    fn test_parse_style() {
        let style = Style::parse(STYLE, Instant::now()).unwrap();
        assert_eq!(style.name.as_deref(), Some("test"));
        assert_eq!(style.layers().len(), 3);
        assert_eq!(style.layers_for_source("base").count(), 2);
        assert_eq!(style.source("base").unwrap().max_zoom, 14);
        assert_eq!(style.center, Some(LatLng::new(52.5, 13.4)));
        assert_eq!(
            style.transition.duration,
            Some(std::time::Duration::from_millis(300))
        );
    }

    #[test]
    fn test_errors_are_aggregated() {
        let broken = r#"{
            "version": 7,
            "sources": {"base": {"type": "vector"}},
            "layers": [
                {"id": "a", "type": "fill", "source": "missing"},
                {"id": "b", "type": "hologram", "source": "base"}
            ]
        }"#;
        match Style::parse(broken, Instant::now()) {
            Err(MapError::Style(message)) => {
                assert!(message.contains("version 7"), "{}", message);
                assert!(message.contains("needs tiles or url"), "{}", message);
                assert!(message.contains("unknown source missing"), "{}", message);
                assert!(message.contains("hologram"), "{}", message);
            }
            other => panic!("expected a style error, got {:?}", other),
        }
        assert!(matches!(
            Style::parse("not json", Instant::now()),
            Err(MapError::Serialization(_))
        ));
    }

    #[test]
    fn test_set_paint_property_reports_source() {
        let now = Instant::now();
        let mut style = Style::parse(STYLE, now).unwrap();
        let changed = style
            .set_paint_property("roads", "line-width", &serde_json::json!(4), now)
            .unwrap();
        assert_eq!(changed.as_deref(), Some("base"));
        let unchanged = style
            .set_paint_property("roads", "line-width", &serde_json::json!(4), now)
            .unwrap();
        assert_eq!(unchanged, None);
        assert!(style
            .set_paint_property("nope", "line-width", &serde_json::json!(4), now)
            .is_err());
    }
}
