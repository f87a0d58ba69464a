//! # mapflow
//!
//! The resource pipeline behind a vector map renderer.
//!
//! mapflow discovers, fetches, decodes, caches and hands off map tiles and
//! style resources to a renderer. Network and disk I/O run on a tokio
//! runtime, CPU-heavy decoding runs on a fixed pool of worker threads, and
//! every tile, bucket and style object is owned by a single thread that
//! drives the [`Session`].

pub mod actor;
pub mod core;
pub mod map;
pub mod prelude;
pub mod runtime;
pub mod storage;
pub mod style;
pub mod tile;
pub use crate::core::constants;

// Re-export public API
pub use core::{
    config::{PipelineConfig, PipelineProfile},
    tile_id::{CanonicalTileId, OverscaledTileId, UnwrappedTileId},
};

pub use map::{PipelineContext, Session};

pub use storage::{
    AsyncRequest, ErrorReason, FileSource, RequestManager, Resource, ResourceCache, ResourceKind,
    Response,
};

pub use tile::{Renderer, Tile, TileError, TileObserver, TilePyramid, TileState};

pub use style::{Style, StyleLayer, StyleObserver};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, MapError>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Style error: {0}")]
    Style(String),

    #[error("Invalid tile: {0}")]
    InvalidTile(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Pipeline shut down")]
    Shutdown,
}

impl From<bincode::Error> for MapError {
    fn from(err: bincode::Error) -> Self {
        MapError::Cache(err.to_string())
    }
}

/// Error type alias for convenience
pub type Error = MapError;
