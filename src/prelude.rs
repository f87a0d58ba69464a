//! Prelude module for common mapflow types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use mapflow::prelude::*;`

pub use crate::core::{
    config::{
        CacheConfig, NetworkConfig, PipelineConfig, PipelineProfile, RetryConfig, TileConfig,
        WorkerConfig,
    },
    geo::{LatLng, LatLngBounds},
    tile_id::{CanonicalTileId, OverscaledTileId, UnwrappedTileId},
    viewport::Viewport,
};

pub use crate::actor::{Actor, ActorHandle, ActorRef, OwnerInbox, Post, ThreadPool};

pub use crate::storage::{
    AsyncRequest, BackoffPolicy, ErrorReason, FileSource, Priority, RequestManager, Resource,
    ResourceCache, ResourceKind, Response, StubFileSource,
};

pub use crate::style::{Color, Style, StyleLayer, StyleObserver};

pub use crate::tile::{
    tile_cover, Bucket, RasterData, Renderer, Tile, TileError, TileObserver, TilePyramid, TileState,
};

pub use crate::map::{PipelineContext, Session};

pub use crate::runtime::IoRuntime;

pub use crate::{Error as MapError, Result};

pub use std::{
    sync::{Arc, Weak},
    time::Duration,
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
