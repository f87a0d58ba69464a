//! The set of tiles one source currently needs

use crate::core::config::TileConfig;
use crate::core::tile_id::OverscaledTileId;
use crate::core::viewport::Viewport;
use crate::storage::Priority;
use crate::style::{PropertyEvaluationParameters, SourceSpec, StyleLayer};
use crate::tile::cover::tile_cover;
use crate::tile::lifecycle::{Tile, TileNotification};
use crate::tile::{Renderer, TileContext, TileEvent, TileEventKind, TileObserver};
use lru::LruCache;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::time::Instant;

fn params_for(id: &OverscaledTileId) -> PropertyEvaluationParameters {
    PropertyEvaluationParameters::new(id.overscaled_z as f64, std::time::Instant::now())
}

fn notify(observer: &Option<Weak<dyn TileObserver>>, tile: &Tile, notification: &TileNotification) {
    let Some(observer) = observer.as_ref().and_then(Weak::upgrade) else {
        return;
    };
    match notification {
        TileNotification::Loaded { first_load } => observer.on_tile_loaded(tile, *first_load),
        TileNotification::Error(error) => observer.on_tile_error(tile, error),
        TileNotification::PlacementRedone => observer.on_placement_redone(tile),
    }
}

/// Tiles of a single source.
///
/// Required tiles live in `tiles`; tiles that fall out of view move into an
/// LRU retention cache so panning back is instant. Tiles evicted from the
/// cache are destroyed, which cancels their fetch and closes their worker.
pub struct TilePyramid {
    source_id: String,
    source: SourceSpec,
    context: TileContext,
    layers: Arc<Vec<StyleLayer>>,
    tiles: BTreeMap<OverscaledTileId, Tile>,
    retained: LruCache<OverscaledTileId, Tile>,
    retained_capacity: usize,
    prefetch_parents: bool,
    ideal: Vec<OverscaledTileId>,
    observer: Option<Weak<dyn TileObserver>>,
}

impl TilePyramid {
    pub fn new(
        source_id: impl Into<String>,
        source: SourceSpec,
        context: TileContext,
        config: &TileConfig,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source,
            context,
            layers: Arc::new(Vec::new()),
            tiles: BTreeMap::new(),
            retained: LruCache::unbounded(),
            retained_capacity: config.retained_tiles,
            prefetch_parents: config.prefetch_parents,
            ideal: Vec::new(),
            observer: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    /// Replaces the source definition, e.g. once its TileJSON arrived, and
    /// reloads the last requested tiles against it.
    pub fn set_source(&mut self, source: SourceSpec) {
        if source == self.source {
            return;
        }
        self.source = source;
        self.tiles.clear();
        self.retained.clear();
        let ideal = std::mem::take(&mut self.ideal);
        self.update(&ideal);
    }

    pub fn set_observer(&mut self, observer: Weak<dyn TileObserver>) {
        self.observer = Some(observer);
    }

    pub fn layers(&self) -> &Arc<Vec<StyleLayer>> {
        &self.layers
    }

    /// Tiles covering the viewport at this source's tile size and zoom range
    pub fn update_viewport(&mut self, viewport: &Viewport) {
        let ideal = tile_cover(
            viewport,
            self.source.tile_size(),
            self.source.min_zoom,
            self.source.max_zoom,
        );
        self.update(&ideal);
    }

    /// Makes `ideal` the required set. Missing tiles are created and loaded
    /// at `Required` priority; their parents, when prefetching is on, at
    /// `Optional` priority as a fallback while the ideal tiles load.
    pub fn update(&mut self, ideal: &[OverscaledTileId]) {
        self.ideal = ideal.to_vec();
        if !self.source.is_resolved() {
            log::debug!("source {} unresolved, deferring {} tiles", self.source_id, ideal.len());
            return;
        }

        let mut wanted: BTreeMap<OverscaledTileId, Priority> =
            ideal.iter().map(|id| (*id, Priority::Required)).collect();
        if self.prefetch_parents {
            for id in ideal {
                if let Some(parent) = id.parent() {
                    if parent.overscaled_z >= self.source.min_zoom {
                        wanted.entry(parent).or_insert(Priority::Optional);
                    }
                }
            }
        }

        let mut next = BTreeMap::new();
        let mut created = 0;
        for (id, priority) in wanted {
            let tile = match self.tiles.remove(&id).or_else(|| self.retained.pop(&id)) {
                Some(mut tile) => {
                    tile.set_priority(priority, &self.source, &self.context);
                    tile
                }
                None => {
                    created += 1;
                    let kind = self.source.kind;
                    let mut tile = Tile::new(id, &self.source_id, kind, priority, &self.context);
                    tile.load(&self.source, &self.context);
                    tile
                }
            };
            next.insert(id, tile);
        }
        let dropped = std::mem::replace(&mut self.tiles, next);
        for (id, tile) in dropped {
            self.retain(id, tile);
        }
        if created > 0 {
            log::debug!(
                "source {}: {} new tiles, {} required, {} retained",
                self.source_id,
                created,
                self.tiles.len(),
                self.retained.len()
            );
        }
    }

    fn retain(&mut self, id: OverscaledTileId, tile: Tile) {
        if self.retained_capacity == 0 {
            return;
        }
        self.retained.push(id, tile);
        while self.retained.len() > self.retained_capacity {
            if let Some((evicted, _)) = self.retained.pop_lru() {
                log::debug!("source {}: evicted tile {}", self.source_id, evicted);
            }
        }
    }

    /// Applies a response or parse result and notifies the observer
    pub fn handle_event(&mut self, event: TileEvent) {
        let tile = match self.tiles.get_mut(&event.id) {
            Some(tile) => tile,
            None => match self.retained.peek_mut(&event.id) {
                Some(tile) => tile,
                None => {
                    log::debug!("source {}: event for destroyed tile {}", self.source_id, event.id);
                    return;
                }
            },
        };
        let notification = match event.kind {
            TileEventKind::Response(response) => tile.on_response(
                event.correlation,
                response,
                &self.layers,
                params_for(&event.id),
                &self.context,
            ),
            TileEventKind::Parsed(result) => {
                tile.on_parsed(event.correlation, result, &self.context)
            }
        };
        if let Some(notification) = notification {
            notify(&self.observer, tile, &notification);
        }
    }

    /// New style layers for this source; loaded tiles re-parse
    pub fn set_layers(&mut self, layers: Arc<Vec<StyleLayer>>) {
        self.layers = layers;
        for (id, tile) in self.tiles.iter_mut().chain(self.retained.iter_mut()) {
            tile.set_layers(&self.layers, params_for(id));
        }
    }

    /// Reloads errored tiles whose backoff elapsed and revalidates expired
    /// ones. Returns how many tiles were acted on.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut acted = 0;
        for tile in self.tiles.values_mut() {
            if tile.retry_due(now) {
                log::info!("retrying tile {} of {}", tile.id(), self.source_id);
                tile.load(&self.source, &self.context);
                acted += 1;
            } else if tile.needs_revalidation(now) {
                tile.revalidate(&self.source, &self.context);
                acted += 1;
            }
        }
        acted
    }

    /// When [`TilePyramid::tick`] next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tiles.values().filter_map(Tile::next_deadline).min()
    }

    pub fn tile(&self, id: &OverscaledTileId) -> Option<&Tile> {
        self.tiles.get(id).or_else(|| self.retained.peek(id))
    }

    /// Required tiles in id order
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    /// Every required tile settled, successfully or not
    pub fn is_loaded(&self) -> bool {
        self.source.is_resolved() && self.tiles.values().all(Tile::is_complete)
    }

    pub fn upload(&self, renderer: &mut dyn Renderer) {
        for tile in self.tiles.values() {
            tile.upload(renderer);
        }
    }
}
