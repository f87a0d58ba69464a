//! Style layers and their paint properties

use crate::style::color::Color;
use crate::style::filter::Filter;
use crate::style::function::{PropertyType, PropertyValue};
use crate::style::transition::{PropertyEvaluationParameters, TransitionOptions, Transitioning};
use crate::tile::data::Properties;
use crate::{MapError, Result};
use serde_json::Value;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Fill,
    Line,
    Circle,
    Raster,
    Background,
}

impl LayerKind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "fill" => LayerKind::Fill,
            "line" => LayerKind::Line,
            "circle" => LayerKind::Circle,
            "raster" => LayerKind::Raster,
            "background" => LayerKind::Background,
            _ => return None,
        })
    }

    /// Whether the layer draws features from a source
    pub fn uses_source(&self) -> bool {
        !matches!(self, LayerKind::Background)
    }
}

/// One paint property: its declared value, transition options and the
/// transition state derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct PaintProperty<T> {
    default: T,
    transition: TransitionOptions,
    current: Transitioning<T>,
}

impl<T: PropertyType> PaintProperty<T> {
    pub fn new(default: T, now: Instant) -> Self {
        Self {
            default,
            transition: TransitionOptions::default(),
            current: Transitioning::settled(PropertyValue::Undefined, now),
        }
    }

    pub fn value(&self) -> &PropertyValue<T> {
        self.current.value()
    }

    /// Replaces the declared value. A transition starts only when the value
    /// actually changed; returns whether it did.
    pub fn set(
        &mut self,
        value: PropertyValue<T>,
        defaults: &TransitionOptions,
        now: Instant,
    ) -> bool {
        if *self.current.value() == value {
            return false;
        }
        let options = self.transition.reverse_merge(defaults);
        let prior = std::mem::replace(
            &mut self.current,
            Transitioning::settled(PropertyValue::Undefined, now),
        );
        self.current = Transitioning::new(value, prior, options, now);
        true
    }

    pub fn set_transition(&mut self, options: TransitionOptions) {
        self.transition = options;
    }

    pub fn evaluate(
        &self,
        params: &PropertyEvaluationParameters,
        properties: Option<&Properties>,
    ) -> T {
        self.current.evaluate(params, properties, &self.default)
    }

    pub fn has_transition(&self, now: Instant) -> bool {
        self.current.has_transition(now)
    }

    pub fn is_data_driven(&self) -> bool {
        self.current.value().is_data_driven()
    }

    fn prune(&mut self, now: Instant) {
        self.current.prune(now);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillPaint {
    pub color: PaintProperty<Color>,
    pub opacity: PaintProperty<f32>,
    pub outline_color: PaintProperty<Color>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinePaint {
    pub color: PaintProperty<Color>,
    pub width: PaintProperty<f32>,
    pub opacity: PaintProperty<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CirclePaint {
    pub color: PaintProperty<Color>,
    pub radius: PaintProperty<f32>,
    pub opacity: PaintProperty<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterPaint {
    pub opacity: PaintProperty<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundPaint {
    pub color: PaintProperty<Color>,
    pub opacity: PaintProperty<f32>,
}

/// Paint properties per layer kind
#[derive(Debug, Clone, PartialEq)]
pub enum LayerPaint {
    Fill(FillPaint),
    Line(LinePaint),
    Circle(CirclePaint),
    Raster(RasterPaint),
    Background(BackgroundPaint),
}

/// Paint values resolved for one zoom, time and feature
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvaluatedPaint {
    Fill {
        color: Color,
        opacity: f32,
        outline_color: Color,
    },
    Line {
        color: Color,
        width: f32,
        opacity: f32,
    },
    Circle {
        color: Color,
        radius: f32,
        opacity: f32,
    },
    Raster {
        opacity: f32,
    },
    Background {
        color: Color,
        opacity: f32,
    },
}

impl LayerPaint {
    fn new(kind: LayerKind, now: Instant) -> Self {
        match kind {
            LayerKind::Fill => LayerPaint::Fill(FillPaint {
                color: PaintProperty::new(Color::BLACK, now),
                opacity: PaintProperty::new(1.0, now),
                outline_color: PaintProperty::new(Color::BLACK, now),
            }),
            LayerKind::Line => LayerPaint::Line(LinePaint {
                color: PaintProperty::new(Color::BLACK, now),
                width: PaintProperty::new(1.0, now),
                opacity: PaintProperty::new(1.0, now),
            }),
            LayerKind::Circle => LayerPaint::Circle(CirclePaint {
                color: PaintProperty::new(Color::BLACK, now),
                radius: PaintProperty::new(5.0, now),
                opacity: PaintProperty::new(1.0, now),
            }),
            LayerKind::Raster => LayerPaint::Raster(RasterPaint {
                opacity: PaintProperty::new(1.0, now),
            }),
            LayerKind::Background => LayerPaint::Background(BackgroundPaint {
                color: PaintProperty::new(Color::BLACK, now),
                opacity: PaintProperty::new(1.0, now),
            }),
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerPaint::Fill(_) => LayerKind::Fill,
            LayerPaint::Line(_) => LayerKind::Line,
            LayerPaint::Circle(_) => LayerKind::Circle,
            LayerPaint::Raster(_) => LayerKind::Raster,
            LayerPaint::Background(_) => LayerKind::Background,
        }
    }

    pub fn evaluate(
        &self,
        params: &PropertyEvaluationParameters,
        properties: Option<&Properties>,
    ) -> EvaluatedPaint {
        match self {
            LayerPaint::Fill(p) => EvaluatedPaint::Fill {
                color: p.color.evaluate(params, properties),
                opacity: p.opacity.evaluate(params, properties),
                outline_color: p.outline_color.evaluate(params, properties),
            },
            LayerPaint::Line(p) => EvaluatedPaint::Line {
                color: p.color.evaluate(params, properties),
                width: p.width.evaluate(params, properties),
                opacity: p.opacity.evaluate(params, properties),
            },
            LayerPaint::Circle(p) => EvaluatedPaint::Circle {
                color: p.color.evaluate(params, properties),
                radius: p.radius.evaluate(params, properties),
                opacity: p.opacity.evaluate(params, properties),
            },
            LayerPaint::Raster(p) => EvaluatedPaint::Raster {
                opacity: p.opacity.evaluate(params, properties),
            },
            LayerPaint::Background(p) => EvaluatedPaint::Background {
                color: p.color.evaluate(params, properties),
                opacity: p.opacity.evaluate(params, properties),
            },
        }
    }

    /// Any property whose value depends on feature data
    pub fn is_data_driven(&self) -> bool {
        match self {
            LayerPaint::Fill(p) => {
                p.color.is_data_driven()
                    || p.opacity.is_data_driven()
                    || p.outline_color.is_data_driven()
            }
            LayerPaint::Line(p) => {
                p.color.is_data_driven() || p.width.is_data_driven() || p.opacity.is_data_driven()
            }
            LayerPaint::Circle(p) => {
                p.color.is_data_driven() || p.radius.is_data_driven() || p.opacity.is_data_driven()
            }
            LayerPaint::Raster(p) => p.opacity.is_data_driven(),
            LayerPaint::Background(p) => p.color.is_data_driven() || p.opacity.is_data_driven(),
        }
    }

    pub fn has_transition(&self, now: Instant) -> bool {
        match self {
            LayerPaint::Fill(p) => {
                p.color.has_transition(now)
                    || p.opacity.has_transition(now)
                    || p.outline_color.has_transition(now)
            }
            LayerPaint::Line(p) => {
                p.color.has_transition(now)
                    || p.width.has_transition(now)
                    || p.opacity.has_transition(now)
            }
            LayerPaint::Circle(p) => {
                p.color.has_transition(now)
                    || p.radius.has_transition(now)
                    || p.opacity.has_transition(now)
            }
            LayerPaint::Raster(p) => p.opacity.has_transition(now),
            LayerPaint::Background(p) => {
                p.color.has_transition(now) || p.opacity.has_transition(now)
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        match self {
            LayerPaint::Fill(p) => {
                p.color.prune(now);
                p.opacity.prune(now);
                p.outline_color.prune(now);
            }
            LayerPaint::Line(p) => {
                p.color.prune(now);
                p.width.prune(now);
                p.opacity.prune(now);
            }
            LayerPaint::Circle(p) => {
                p.color.prune(now);
                p.radius.prune(now);
                p.opacity.prune(now);
            }
            LayerPaint::Raster(p) => p.opacity.prune(now),
            LayerPaint::Background(p) => {
                p.color.prune(now);
                p.opacity.prune(now);
            }
        }
    }

    /// Sets `name` (or `name-transition`); returns whether anything changed
    fn set(
        &mut self,
        name: &str,
        value: &Value,
        defaults: &TransitionOptions,
        now: Instant,
    ) -> Result<bool> {
        if let Some(property) = name.strip_suffix("-transition") {
            let options = TransitionOptions::parse(value).map_err(MapError::Style)?;
            return self.with_property(property, |slot| {
                slot.set_transition(options);
                Ok(false)
            });
        }
        self.with_property(name, |slot| slot.set_json(value, defaults, now))
    }

    fn with_property<F>(&mut self, name: &str, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut dyn DynPaintProperty) -> Result<bool>,
    {
        let slot: &mut dyn DynPaintProperty = match (self, name) {
            (LayerPaint::Fill(p), "fill-color") => &mut p.color,
            (LayerPaint::Fill(p), "fill-opacity") => &mut p.opacity,
            (LayerPaint::Fill(p), "fill-outline-color") => &mut p.outline_color,
            (LayerPaint::Line(p), "line-color") => &mut p.color,
            (LayerPaint::Line(p), "line-width") => &mut p.width,
            (LayerPaint::Line(p), "line-opacity") => &mut p.opacity,
            (LayerPaint::Circle(p), "circle-color") => &mut p.color,
            (LayerPaint::Circle(p), "circle-radius") => &mut p.radius,
            (LayerPaint::Circle(p), "circle-opacity") => &mut p.opacity,
            (LayerPaint::Raster(p), "raster-opacity") => &mut p.opacity,
            (LayerPaint::Background(p), "background-color") => &mut p.color,
            (LayerPaint::Background(p), "background-opacity") => &mut p.opacity,
            (_, other) => return Err(MapError::Style(format!("unknown paint property {}", other))),
        };
        apply(slot)
    }
}

/// Type-erased access to a [`PaintProperty`] for setting from JSON
trait DynPaintProperty {
    fn set_json(
        &mut self,
        value: &Value,
        defaults: &TransitionOptions,
        now: Instant,
    ) -> Result<bool>;
    fn set_transition(&mut self, options: TransitionOptions);
}

impl<T: PropertyType> DynPaintProperty for PaintProperty<T> {
    fn set_json(
        &mut self,
        value: &Value,
        defaults: &TransitionOptions,
        now: Instant,
    ) -> Result<bool> {
        let parsed = PropertyValue::parse(value).map_err(MapError::Style)?;
        Ok(self.set(parsed, defaults, now))
    }

    fn set_transition(&mut self, options: TransitionOptions) {
        PaintProperty::set_transition(self, options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    None,
}

/// A layer of the style document
#[derive(Debug, Clone, PartialEq)]
pub struct StyleLayer {
    pub id: String,
    pub source: Option<String>,
    pub source_layer: Option<String>,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub filter: Filter,
    pub visibility: Visibility,
    pub paint: LayerPaint,
}

impl StyleLayer {
    pub fn new(id: impl Into<String>, kind: LayerKind, now: Instant) -> Self {
        Self {
            id: id.into(),
            source: None,
            source_layer: None,
            min_zoom: 0.0,
            max_zoom: f64::INFINITY,
            filter: Filter::Always,
            visibility: Visibility::Visible,
            paint: LayerPaint::new(kind, now),
        }
    }

    /// Builds a layer from its style JSON. Paint values take effect
    /// immediately; only later changes transition.
    pub fn from_json(value: &Value, now: Instant) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| MapError::Style("layer must be an object".into()))?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MapError::Style("layer requires an id".into()))?;
        let kind_name = object.get("type").and_then(Value::as_str).unwrap_or_default();
        let kind = LayerKind::parse(kind_name).ok_or_else(|| {
            MapError::Style(format!("layer {}: unsupported type '{}'", id, kind_name))
        })?;

        let mut layer = StyleLayer::new(id, kind, now);
        let context = |err: MapError| MapError::Style(format!("layer {}: {}", id, err));

        layer.source = object.get("source").and_then(Value::as_str).map(str::to_owned);
        if kind.uses_source() && layer.source.is_none() {
            return Err(MapError::Style(format!("layer {}: missing source", id)));
        }
        layer.source_layer = object
            .get("source-layer")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Some(min) = object.get("minzoom").and_then(Value::as_f64) {
            layer.min_zoom = min;
        }
        if let Some(max) = object.get("maxzoom").and_then(Value::as_f64) {
            layer.max_zoom = max;
        }
        if let Some(filter) = object.get("filter") {
            layer.filter = Filter::parse(filter).map_err(|e| context(MapError::Style(e)))?;
        }
        if let Some(layout) = object.get("layout").and_then(Value::as_object) {
            layer.visibility = match layout.get("visibility").and_then(Value::as_str) {
                Some("none") => Visibility::None,
                _ => Visibility::Visible,
            };
        }
        if let Some(paint) = object.get("paint").and_then(Value::as_object) {
            // Values before transition options, so initial values are not animated
            let immediate = TransitionOptions::default();
            let (transitions, values): (Vec<_>, Vec<_>) =
                paint.iter().partition(|(name, _)| name.ends_with("-transition"));
            for (name, value) in values.into_iter().chain(transitions) {
                layer
                    .paint
                    .set(name, value, &immediate, now)
                    .map_err(context)?;
            }
        }
        Ok(layer)
    }

    pub fn kind(&self) -> LayerKind {
        self.paint.kind()
    }

    /// Visible at this zoom: layout visibility and the min/max zoom range
    pub fn is_visible(&self, zoom: f64) -> bool {
        self.visibility == Visibility::Visible && zoom >= self.min_zoom && zoom < self.max_zoom
    }

    /// Sets one paint property from its JSON value. Returns true when the
    /// value changed, which starts a transition using the property's own
    /// options merged over `defaults`.
    pub fn set_paint_property(
        &mut self,
        name: &str,
        value: &Value,
        defaults: &TransitionOptions,
        now: Instant,
    ) -> Result<bool> {
        self.paint.set(name, value, defaults, now)
    }

    pub fn set_visibility(&mut self, visibility: Visibility) -> bool {
        let changed = self.visibility != visibility;
        self.visibility = visibility;
        changed
    }

    pub fn evaluate(
        &self,
        params: &PropertyEvaluationParameters,
        properties: Option<&Properties>,
    ) -> EvaluatedPaint {
        self.paint.evaluate(params, properties)
    }

    pub fn has_transition(&self, now: Instant) -> bool {
        self.paint.has_transition(now)
    }

    pub fn prune_transitions(&mut self, now: Instant) {
        self.paint.prune(now);
    }
}
