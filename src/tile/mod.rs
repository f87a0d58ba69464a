//! Tile loading, decoding and layout
//!
//! A [`TilePyramid`] per source decides which tiles exist. Each [`Tile`]
//! fetches its bytes through the shared file source and hands them to its
//! own [`TileWorker`](worker::TileWorker) actor, which decodes them and
//! builds render buckets on the worker pool. Results come back as
//! [`TileEvent`]s through the owning thread's inbox.

pub mod bucket;
pub mod cover;
pub mod data;
pub mod error;
pub mod lifecycle;
pub mod pyramid;
pub mod raster;
pub mod worker;

pub use bucket::{build_buckets, triangulate, Bucket, Vertex};
pub use cover::{covering_zoom, tile_cover, tile_cover_bounds};
pub use data::{
    Feature, FeatureValue, GeometryTileData, GeometryTileLayer, GeometryType, JsonTileDecoder,
    Properties,
    TileDecoder,
};
pub use error::TileError;
pub use lifecycle::{Tile, TileNotification, TileState};
pub use pyramid::TilePyramid;
pub use raster::RasterData;
pub use worker::{ParseOutput, TileWorker, WorkerMessage};

use crate::actor::{Post, ThreadPool};
use crate::core::tile_id::OverscaledTileId;
use crate::storage::{BackoffPolicy, FileSource, Response};
use std::sync::Arc;

/// A completion for one tile, posted from I/O or worker threads
#[derive(Debug)]
pub struct TileEvent {
    pub source_id: String,
    pub id: OverscaledTileId,
    /// The tile's correlation id when the work was started
    pub correlation: u64,
    pub kind: TileEventKind,
}

#[derive(Debug)]
pub enum TileEventKind {
    Response(Response),
    Parsed(Result<ParseOutput, TileError>),
}

/// Everything a tile needs to load itself
#[derive(Clone)]
pub struct TileContext {
    pub file_source: Arc<dyn FileSource>,
    pub pool: Arc<ThreadPool>,
    pub sink: Arc<dyn Post<TileEvent>>,
    pub decoder: Arc<dyn TileDecoder>,
    /// Backoff between whole-tile reloads after the file source gave up
    pub retry: BackoffPolicy,
    pub retry_failed_tiles: bool,
    pub pixel_ratio: f32,
}

/// Tile notifications, delivered on the owning thread right after the
/// transition they describe.
pub trait TileObserver {
    fn on_tile_loaded(&self, _tile: &Tile, _first_load: bool) {}

    fn on_tile_error(&self, _tile: &Tile, _error: &TileError) {}

    /// A ready tile was laid out again after a style change
    fn on_placement_redone(&self, _tile: &Tile) {}
}

/// Receives render data. Buckets are shared and must not be modified.
pub trait Renderer {
    fn upload_bucket(&mut self, tile: &OverscaledTileId, bucket: &Arc<Bucket>);

    fn upload_raster(&mut self, tile: &OverscaledTileId, raster: &Arc<RasterData>);
}
