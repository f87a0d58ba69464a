//! Style documents and paint property evaluation

pub mod color;
pub mod document;
pub mod filter;
pub mod function;
pub mod glyphs;
pub mod layer;
pub mod source;
pub mod sprite;
pub mod transition;

pub use color::Color;
pub use document::Style;
pub use filter::Filter;
pub use function::{
    interpolation_factor, PropertyFunction, PropertyType, PropertyValue, ZoomFunction,
};
pub use glyphs::{glyph_range, GlyphManager, GlyphRange};
pub use layer::{EvaluatedPaint, LayerKind, LayerPaint, PaintProperty, StyleLayer, Visibility};
pub use source::{SourceKind, SourceSpec, TileJson};
pub use sprite::{SpriteImage, SpriteLoader, SpriteSheet};
pub use transition::{PropertyEvaluationParameters, TransitionOptions, Transitioning};

use crate::storage::Response;
use crate::MapError;
use std::sync::Arc;

/// Style-level completions posted back to the owning thread
#[derive(Debug)]
pub enum StyleEvent {
    Style {
        generation: u64,
        response: Response,
    },
    Source {
        generation: u64,
        source_id: String,
        response: Response,
    },
    Glyphs {
        font_stack: String,
        range: GlyphRange,
        response: Response,
    },
    SpriteJson {
        generation: u64,
        response: Response,
    },
    SpriteImage {
        generation: u64,
        response: Response,
    },
    SpriteParsed {
        generation: u64,
        result: Result<SpriteSheet, String>,
    },
}

/// Style notifications, delivered on the owning thread
pub trait StyleObserver {
    fn on_style_loaded(&self, _style: &Style) {}

    fn on_style_error(&self, _error: &MapError) {}

    /// A TileJSON-backed source now knows its tile URLs
    fn on_source_loaded(&self, _source_id: &str) {}

    fn on_glyphs_loaded(&self, _font_stack: &str, _range: GlyphRange, _data: &Arc<Vec<u8>>) {}

    fn on_sprite_loaded(&self, _sprite: &Arc<SpriteSheet>) {}
}
