//! Off-thread tile parsing

use crate::actor::{Actor, Post};
use crate::core::tile_id::OverscaledTileId;
use crate::style::{PropertyEvaluationParameters, SourceKind, StyleLayer};
use crate::tile::bucket::{build_buckets, Bucket};
use crate::tile::data::{GeometryTileData, TileDecoder};
use crate::tile::error::TileError;
use crate::tile::raster::RasterData;
use crate::tile::{TileEvent, TileEventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Work for a [`TileWorker`]; every message carries the tile's correlation
/// id at the time it was sent.
#[derive(Debug)]
pub enum WorkerMessage {
    /// New tile bytes; `None` for an empty (204) tile
    SetData {
        correlation: u64,
        data: Option<Arc<Vec<u8>>>,
        layers: Arc<Vec<StyleLayer>>,
        params: PropertyEvaluationParameters,
    },
    /// Rebuild buckets from the data already held
    SetLayers {
        correlation: u64,
        layers: Arc<Vec<StyleLayer>>,
        params: PropertyEvaluationParameters,
    },
}

/// What a worker produced for a tile
#[derive(Debug, Clone)]
pub enum ParseOutput {
    Vector {
        data: Arc<GeometryTileData>,
        buckets: Vec<Arc<Bucket>>,
    },
    Raster(Arc<RasterData>),
    /// The source has no data for this tile
    Empty,
}

enum Decoded {
    Vector(Arc<GeometryTileData>),
    Raster(Arc<RasterData>),
    Empty,
}

/// Decodes and lays out one tile. Each tile owns one worker, so its
/// messages are handled in order; work superseded by a newer correlation id
/// only updates the worker's inputs and is never parsed.
pub struct TileWorker {
    source_id: String,
    id: OverscaledTileId,
    kind: SourceKind,
    decoder: Arc<dyn TileDecoder>,
    latest: Arc<AtomicU64>,
    sink: Arc<dyn Post<TileEvent>>,
    raw: Option<Option<Arc<Vec<u8>>>>,
    decoded: Option<Decoded>,
    layers: Arc<Vec<StyleLayer>>,
    params: Option<PropertyEvaluationParameters>,
}

impl TileWorker {
    pub fn new(
        source_id: impl Into<String>,
        id: OverscaledTileId,
        kind: SourceKind,
        decoder: Arc<dyn TileDecoder>,
        latest: Arc<AtomicU64>,
        sink: Arc<dyn Post<TileEvent>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            id,
            kind,
            decoder,
            latest,
            sink,
            raw: None,
            decoded: None,
            layers: Arc::new(Vec::new()),
            params: None,
        }
    }

    fn post(&self, correlation: u64, result: Result<ParseOutput, TileError>) {
        self.sink.post(TileEvent {
            source_id: self.source_id.clone(),
            id: self.id,
            correlation,
            kind: TileEventKind::Parsed(result),
        });
    }

    fn decode(&mut self) -> Result<(), TileError> {
        if self.decoded.is_some() {
            return Ok(());
        }
        let Some(raw) = &self.raw else {
            return Ok(());
        };
        let decoded = match (raw, self.kind) {
            (None, _) => Decoded::Empty,
            (Some(bytes), SourceKind::Vector) => {
                Decoded::Vector(Arc::new(self.decoder.decode(bytes)?))
            }
            (Some(bytes), SourceKind::Raster) => {
                Decoded::Raster(Arc::new(RasterData::decode(bytes)?))
            }
        };
        self.decoded = Some(decoded);
        Ok(())
    }

    fn parse(&mut self, correlation: u64) {
        if let Err(err) = self.decode() {
            log::warn!("tile {} of {} failed to parse: {}", self.id, self.source_id, err);
            self.post(correlation, Err(err));
            return;
        }
        let (Some(decoded), Some(params)) = (&self.decoded, &self.params) else {
            // Layers arrived before any data
            return;
        };
        let output = match decoded {
            Decoded::Empty => ParseOutput::Empty,
            Decoded::Raster(raster) => ParseOutput::Raster(raster.clone()),
            Decoded::Vector(data) => ParseOutput::Vector {
                buckets: build_buckets(data, &self.layers, params),
                data: data.clone(),
            },
        };
        log::debug!("tile {} of {} parsed (correlation {})", self.id, self.source_id, correlation);
        self.post(correlation, Ok(output));
    }
}

impl Actor for TileWorker {
    type Message = WorkerMessage;

    fn handle(&mut self, message: WorkerMessage) {
        let correlation = match message {
            WorkerMessage::SetData {
                correlation,
                data,
                layers,
                params,
            } => {
                self.raw = Some(data);
                self.decoded = None;
                self.layers = layers;
                self.params = Some(params);
                correlation
            }
            WorkerMessage::SetLayers {
                correlation,
                layers,
                params,
            } => {
                self.layers = layers;
                self.params = Some(params);
                correlation
            }
        };
        if correlation < self.latest.load(Ordering::SeqCst) {
            log::debug!(
                "tile {} skipping superseded work {} (latest {})",
                self.id,
                correlation,
                self.latest.load(Ordering::SeqCst)
            );
            return;
        }
        self.parse(correlation);
    }

    fn on_panic(&mut self) {
        log::error!("tile worker for {} of {} panicked", self.id, self.source_id);
        self.decoded = None;
        self.post(
            self.latest.load(Ordering::SeqCst),
            Err(TileError::Parse("tile worker panicked".into())),
        );
    }
}
