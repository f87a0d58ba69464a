//! The owning-thread session that ties style, tiles and I/O together

use crate::actor::{OwnerInbox, Post, ThreadPool};
use crate::core::config::PipelineConfig;
use crate::core::viewport::Viewport;
use crate::runtime::IoRuntime;
use crate::storage::{
    AsyncRequest, BackoffPolicy, DefaultFileSource, FileSource, HttpFileSource, LocalFileSource,
    NetworkStatus, RequestManager, Resource, ResourceCache, Response,
};
use crate::style::{
    GlyphManager, SpriteLoader, SpriteSheet, Style, StyleEvent, StyleObserver, TileJson,
};
use crate::tile::{
    JsonTileDecoder, Renderer, TileContext, TileDecoder, TileEvent, TileObserver, TilePyramid,
};
use crate::{MapError, Result};
use fxhash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared machinery of a pipeline: worker pool, I/O runtime, cache and the
/// request manager every fetch goes through. One context can back several
/// sessions.
pub struct PipelineContext {
    config: PipelineConfig,
    io: IoRuntime,
    pool: Arc<ThreadPool>,
    network: NetworkStatus,
    cache: Arc<ResourceCache>,
    file_source: RequestManager,
    decoder: Arc<dyn TileDecoder>,
}

impl PipelineContext {
    /// Builds the production stack: an owned I/O runtime, HTTP plus local
    /// file access, and the cache configured in `config`.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let io = IoRuntime::new(&config.network)?;
        let network = NetworkStatus::new();
        let http = HttpFileSource::new(&config.network, io.handle().clone(), network.clone())?;
        let local = LocalFileSource::new(io.handle().clone(), config.network.asset_root.clone());
        let upstream = DefaultFileSource::new(Arc::new(http), Arc::new(local));
        let mut context = Self::with_file_source(config, io, Arc::new(upstream))?;
        context.network = network;
        Ok(context)
    }

    /// Uses `upstream` instead of the network, e.g. a stub in tests
    pub fn with_file_source(
        config: PipelineConfig,
        io: IoRuntime,
        upstream: Arc<dyn FileSource>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ThreadPool::new(config.workers.resolved_threads(), "mapflow-worker")?);
        let cache = Arc::new(ResourceCache::new(&config.cache));
        let file_source = RequestManager::new(
            upstream,
            cache.clone(),
            BackoffPolicy::from(&config.retry),
            io.handle().clone(),
        );
        log::info!(
            "pipeline ready: {} workers, {} byte cache{}",
            pool.threads(),
            config.cache.max_bytes,
            if cache.has_disk() { " with disk tier" } else { "" }
        );
        Ok(Self {
            config,
            io,
            pool,
            network: NetworkStatus::new(),
            cache,
            file_source,
            decoder: Arc::new(JsonTileDecoder),
        })
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn TileDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn io(&self) -> &IoRuntime {
        &self.io
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn file_source(&self) -> &RequestManager {
        &self.file_source
    }
}

/// Everything posted back to a session's thread
#[derive(Debug)]
pub enum SessionEvent {
    Tile(TileEvent),
    Style(StyleEvent),
}

/// A map session: one style, one pyramid per source, one viewport.
///
/// All tile, bucket and style state lives here and is touched only by the
/// thread that owns the session. Fetch and parse results queue up in the
/// session's inbox until [`Session::process_events`] applies them.
pub struct Session {
    context: Arc<PipelineContext>,
    file_source: Arc<dyn FileSource>,
    inbox: OwnerInbox<SessionEvent>,
    tile_sink: Arc<dyn Post<TileEvent>>,
    style_sink: Arc<dyn Post<StyleEvent>>,
    style: Option<Style>,
    generation: u64,
    style_request: Option<AsyncRequest>,
    source_requests: FxHashMap<String, AsyncRequest>,
    pyramids: BTreeMap<String, TilePyramid>,
    glyphs: GlyphManager,
    sprite: Option<SpriteLoader>,
    viewport: Viewport,
    camera_set: bool,
    transitioning: bool,
    tile_observer: Option<Weak<dyn TileObserver>>,
    style_observer: Option<Weak<dyn StyleObserver>>,
}

impl Session {
    pub fn new(context: Arc<PipelineContext>) -> Self {
        let inbox = OwnerInbox::new();
        let sender = inbox.sender();
        Self {
            file_source: Arc::new(context.file_source.clone()),
            tile_sink: sender.map(SessionEvent::Tile),
            style_sink: sender.map(SessionEvent::Style),
            context,
            inbox,
            style: None,
            generation: 0,
            style_request: None,
            source_requests: FxHashMap::default(),
            pyramids: BTreeMap::new(),
            glyphs: GlyphManager::new(None),
            sprite: None,
            viewport: Viewport::default(),
            camera_set: false,
            transitioning: false,
            tile_observer: None,
            style_observer: None,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn set_tile_observer(&mut self, observer: Weak<dyn TileObserver>) {
        for pyramid in self.pyramids.values_mut() {
            pyramid.set_observer(observer.clone());
        }
        self.tile_observer = Some(observer);
    }

    pub fn set_style_observer(&mut self, observer: Weak<dyn StyleObserver>) {
        self.style_observer = Some(observer);
    }

    fn style_observer(&self) -> Option<Arc<dyn StyleObserver>> {
        self.style_observer.as_ref().and_then(Weak::upgrade)
    }

    fn style_error(&self, error: &MapError) {
        log::error!("{}", error);
        if let Some(observer) = self.style_observer() {
            observer.on_style_error(error);
        }
    }

    /// Fetches a style document; the current style stays in place until the
    /// new one has loaded.
    pub fn load_style_url(&mut self, url: &str) {
        self.generation += 1;
        let generation = self.generation;
        let sink = self.style_sink.clone();
        log::info!("loading style {}", url);
        self.style_request = Some(self.file_source.request(
            Resource::style(url),
            Box::new(move |response| sink.post(StyleEvent::Style { generation, response })),
        ));
    }

    /// Replaces the style with an inline document
    pub fn load_style_json(&mut self, json: &str) -> Result<()> {
        self.generation += 1;
        self.style_request = None;
        self.apply_style(json)
    }

    fn apply_style(&mut self, json: &str) -> Result<()> {
        let style = match Style::parse(json, std::time::Instant::now()) {
            Ok(style) => style,
            Err(err) => {
                self.style_error(&err);
                return Err(err);
            }
        };

        self.source_requests.clear();
        self.pyramids.clear();
        self.glyphs.set_url_template(style.glyphs.clone());
        self.sprite = style.sprite.as_ref().map(|base| {
            let pixel_ratio = self.context.config.tiles.pixel_ratio;
            let mut loader = SpriteLoader::new(base.as_str(), pixel_ratio);
            loader.load(self.file_source.as_ref(), &self.style_sink);
            loader
        });
        if !self.camera_set {
            if let Some(center) = style.center {
                self.viewport.set_center(center);
            }
            if let Some(zoom) = style.zoom {
                self.viewport.set_zoom(zoom);
            }
        }

        for (source_id, source) in &style.sources {
            let mut pyramid = TilePyramid::new(
                source_id.as_str(),
                source.clone(),
                self.tile_context(),
                &self.context.config.tiles,
            );
            if let Some(observer) = &self.tile_observer {
                pyramid.set_observer(observer.clone());
            }
            pyramid.set_layers(Arc::new(style.layers_for_source(source_id).cloned().collect()));
            pyramid.update_viewport(&self.viewport);
            self.pyramids.insert(source_id.clone(), pyramid);

            if let (false, Some(url)) = (source.is_resolved(), &source.url) {
                let generation = self.generation;
                let sink = self.style_sink.clone();
                let id = source_id.clone();
                let request = self.file_source.request(
                    Resource::source(url.as_str()),
                    Box::new(move |response| {
                        sink.post(StyleEvent::Source {
                            generation,
                            source_id: id,
                            response,
                        })
                    }),
                );
                self.source_requests.insert(source_id.clone(), request);
            }
        }

        log::info!(
            "style {} loaded: {} sources, {} layers",
            style.name.as_deref().unwrap_or("(unnamed)"),
            style.sources.len(),
            style.layers().len()
        );
        if let Some(observer) = self.style_observer() {
            observer.on_style_loaded(&style);
        }
        self.style = Some(style);
        Ok(())
    }

    fn tile_context(&self) -> TileContext {
        let config = &self.context.config;
        TileContext {
            file_source: self.file_source.clone(),
            pool: self.context.pool.clone(),
            sink: self.tile_sink.clone(),
            decoder: self.context.decoder.clone(),
            retry: BackoffPolicy::from(&config.retry),
            retry_failed_tiles: config.tiles.retry_failed_tiles,
            pixel_ratio: config.tiles.pixel_ratio,
        }
    }

    pub fn style(&self) -> Option<&Style> {
        self.style.as_ref()
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Moves the camera; every source updates its required tiles
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.camera_set = true;
        for pyramid in self.pyramids.values_mut() {
            pyramid.update_viewport(&self.viewport);
        }
    }

    /// Sets a paint property and re-lays out the tiles of the affected
    /// source. Returns whether the value changed.
    pub fn set_paint_property(
        &mut self,
        layer_id: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let style = self
            .style
            .as_mut()
            .ok_or_else(|| MapError::Style("no style loaded".into()))?;
        let now = std::time::Instant::now();
        let Some(source_id) = style.set_paint_property(layer_id, name, value, now)? else {
            return Ok(false);
        };
        self.relayout(Some(&source_id));
        Ok(true)
    }

    fn relayout(&mut self, only: Option<&str>) {
        let Some(style) = &self.style else {
            return;
        };
        for (source_id, pyramid) in &mut self.pyramids {
            if only.map_or(true, |id| id == source_id) {
                pyramid.set_layers(Arc::new(style.layers_for_source(source_id).cloned().collect()));
            }
        }
    }

    /// Requests the glyph ranges `text` needs in `font_stack`
    pub fn request_glyphs(&mut self, font_stack: &str, text: &str) -> usize {
        self.glyphs
            .request_text(font_stack, text, self.file_source.as_ref(), &self.style_sink)
    }

    pub fn glyphs(&self) -> &GlyphManager {
        &self.glyphs
    }

    pub fn sprite(&self) -> Option<&Arc<SpriteSheet>> {
        self.sprite.as_ref().and_then(SpriteLoader::sheet)
    }

    pub fn pyramid(&self, source_id: &str) -> Option<&TilePyramid> {
        self.pyramids.get(source_id)
    }

    pub fn pyramids(&self) -> impl Iterator<Item = &TilePyramid> {
        self.pyramids.values()
    }

    /// Applies every queued result, then retries and revalidates tiles that
    /// are due. Returns how many events were applied.
    pub fn process_events(&mut self) -> usize {
        let events = self.inbox.drain();
        let count = events.len();
        for event in events {
            match event {
                SessionEvent::Tile(event) => match self.pyramids.get_mut(&event.source_id) {
                    Some(pyramid) => pyramid.handle_event(event),
                    None => log::debug!("dropping event for removed source {}", event.source_id),
                },
                SessionEvent::Style(event) => self.handle_style_event(event),
            }
        }

        let now = tokio::time::Instant::now();
        for pyramid in self.pyramids.values_mut() {
            pyramid.tick(now);
        }

        // Buckets carry baked colors; lay out once more when transitions end
        let still = self
            .style
            .as_ref()
            .map_or(false, |style| style.has_transition(std::time::Instant::now()));
        if self.transitioning && !still {
            if let Some(style) = self.style.as_mut() {
                style.prune_transitions(std::time::Instant::now());
            }
            self.relayout(None);
        }
        self.transitioning = still;
        count
    }

    fn handle_style_event(&mut self, event: StyleEvent) {
        match event {
            StyleEvent::Style { generation, response } => {
                if generation != self.generation {
                    return;
                }
                self.style_request = None;
                match body(response, "style") {
                    Ok(data) => {
                        let _ = self.apply_style(&String::from_utf8_lossy(&data));
                    }
                    Err(err) => self.style_error(&err),
                }
            }
            StyleEvent::Source {
                generation,
                source_id,
                response,
            } => {
                let current = generation == self.generation;
                if !current || self.source_requests.remove(&source_id).is_none() {
                    return;
                }
                let tilejson = body(response, &format!("source {}", source_id))
                    .and_then(|data| TileJson::parse(&data));
                match tilejson {
                    Ok(tilejson) => self.apply_tilejson(&source_id, tilejson),
                    Err(err) => self.style_error(&err),
                }
            }
            StyleEvent::Glyphs {
                font_stack,
                range,
                response,
            } => match self.glyphs.on_response(&font_stack, range, response) {
                Some(Ok(data)) => {
                    if let Some(observer) = self.style_observer() {
                        observer.on_glyphs_loaded(&font_stack, range, &data);
                    }
                }
                Some(Err(err)) => self.style_error(&err),
                None => {}
            },
            StyleEvent::SpriteJson { generation, response } => {
                let pool = self.context.pool.clone();
                let error = self
                    .sprite
                    .as_mut()
                    .and_then(|sprite| {
                        sprite.on_json(generation, response, &pool, &self.style_sink)
                    });
                if let Some(err) = error {
                    self.style_error(&err);
                }
            }
            StyleEvent::SpriteImage { generation, response } => {
                let pool = self.context.pool.clone();
                let error = self
                    .sprite
                    .as_mut()
                    .and_then(|sprite| {
                        sprite.on_image(generation, response, &pool, &self.style_sink)
                    });
                if let Some(err) = error {
                    self.style_error(&err);
                }
            }
            StyleEvent::SpriteParsed { generation, result } => {
                match self.sprite.as_mut().and_then(|sprite| sprite.on_parsed(generation, result)) {
                    Some(Ok(sheet)) => {
                        if let Some(observer) = self.style_observer() {
                            observer.on_sprite_loaded(&sheet);
                        }
                    }
                    Some(Err(err)) => self.style_error(&err),
                    None => {}
                }
            }
        }
    }

    fn apply_tilejson(&mut self, source_id: &str, tilejson: TileJson) {
        let Some(source) = self.style.as_mut().and_then(|style| style.source_mut(source_id)) else {
            return;
        };
        source.apply_tilejson(tilejson);
        let resolved = source.clone();
        log::info!("source {} resolved with {} tile URLs", source_id, resolved.tiles.len());
        if let Some(pyramid) = self.pyramids.get_mut(source_id) {
            pyramid.set_source(resolved);
            pyramid.update_viewport(&self.viewport);
        }
        if let Some(observer) = self.style_observer() {
            observer.on_source_loaded(source_id);
        }
    }

    /// Nothing is being fetched or parsed for the current style and viewport
    pub fn is_fully_loaded(&self) -> bool {
        self.style.is_some()
            && self.style_request.is_none()
            && self.source_requests.is_empty()
            && self.glyphs.pending() == 0
            && !self.sprite.as_ref().map_or(false, SpriteLoader::is_loading)
            && self.pyramids.values().all(TilePyramid::is_loaded)
    }

    /// When a pyramid next wants to retry or revalidate a tile
    pub fn next_deadline(&self) -> Option<tokio::time::Instant> {
        self.pyramids.values().filter_map(TilePyramid::next_deadline).min()
    }

    /// Blocks the calling thread, applying results as they arrive, until
    /// the session is fully loaded or `timeout` elapses. Must not be called
    /// from inside the I/O runtime.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            self.process_events();
            if self.is_fully_loaded() {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                log::warn!("session still loading after {:?}", timeout);
                return false;
            }
            let mut wait = deadline - now;
            if let Some(next) = self.next_deadline() {
                wait = wait.min(next.saturating_duration_since(tokio::time::Instant::now()));
            }
            self.inbox.wait(wait.max(Duration::from_millis(1)));
        }
    }

    /// Hands every renderable tile to the renderer
    pub fn upload(&self, renderer: &mut dyn Renderer) {
        for pyramid in self.pyramids.values() {
            pyramid.upload(renderer);
        }
    }
}

fn body(response: Response, what: &str) -> Result<Arc<Vec<u8>>> {
    if let Some(error) = response.error {
        return Err(MapError::Style(format!("{} failed to load: {}", what, error)));
    }
    response
        .data
        .ok_or_else(|| MapError::Style(format!("{} is empty", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StubFileSource;
    use crate::tile::{Tile, TileError};
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Events {
        log: RefCell<Vec<String>>,
    }

    impl TileObserver for Events {
        fn on_tile_loaded(&self, tile: &Tile, first_load: bool) {
            self.log.borrow_mut().push(format!("tile {} {}", tile.id(), first_load));
        }

        fn on_tile_error(&self, tile: &Tile, error: &TileError) {
            self.log.borrow_mut().push(format!("error {} {}", tile.id(), error));
        }
    }

    impl StyleObserver for Events {
        fn on_style_loaded(&self, style: &Style) {
            self.log.borrow_mut().push(format!("style {}", style.layers().len()));
        }

        fn on_style_error(&self, error: &MapError) {
            self.log.borrow_mut().push(format!("style error {}", error));
        }

        fn on_source_loaded(&self, source_id: &str) {
            self.log.borrow_mut().push(format!("source {}", source_id));
        }
    }

    fn session(stub: Arc<StubFileSource>) -> Session {
        let context = PipelineContext::with_file_source(
            PipelineConfig::for_testing(),
            IoRuntime::current().unwrap(),
            stub,
        )
        .unwrap();
        Session::new(Arc::new(context))
    }

    async fn settle(session: &mut Session) {
        for _ in 0..500 {
            session.process_events();
            if session.is_fully_loaded() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never settled");
    }

    #[tokio::test]
    async fn test_style_url_tilejson_and_tiles() {
        let stub = Arc::new(StubFileSource::new(tokio::runtime::Handle::current()));
        stub.add_data(
            "https://s/style.json",
            json!({
                "version": 8,
                "center": [0.0, 0.0],
                "zoom": 0,
                "sources": {"base": {"type": "vector", "url": "https://s/base.json"}},
                "layers": [{"id": "land", "type": "fill", "source": "base", "source-layer": "land"}]
            })
            .to_string(),
        );
        stub.add_data(
            "https://s/base.json",
            json!({"tiles": ["https://s/{z}/{x}/{y}.json"], "maxzoom": 4}).to_string(),
        );
        stub.add_data(
            "https://s/0/0/0.json",
            r#"{"layers": {"land": [{"type": "Polygon", "geometry": [[[0,0],[9,0],[9,9]]]}]}}"#,
        );

        let events = Arc::new(Events::default());
        let tile_observer: Arc<dyn TileObserver> = events.clone();
        let style_observer: Arc<dyn StyleObserver> = events.clone();
        let mut session = session(stub.clone());
        session.set_tile_observer(Arc::downgrade(&tile_observer));
        session.set_style_observer(Arc::downgrade(&style_observer));

        session.load_style_url("https://s/style.json");
        settle(&mut session).await;

        let log = events.log.borrow().clone();
        assert_eq!(log, vec!["style 1", "source base", "tile 0/0/0 true"]);
        let pyramid = session.pyramid("base").unwrap();
        assert_eq!(pyramid.len(), 1);
        assert_eq!(pyramid.tiles().next().unwrap().buckets().len(), 1);
        assert_eq!(stub.request_count("https://s/0/0/0.json"), 1);
    }

    #[tokio::test]
    async fn test_broken_style_reports_every_problem() {
        let stub = Arc::new(StubFileSource::new(tokio::runtime::Handle::current()));
        let events = Arc::new(Events::default());
        let style_observer: Arc<dyn StyleObserver> = events.clone();
        let mut session = session(stub);
        session.set_style_observer(Arc::downgrade(&style_observer));

        let style = json!({
            "version": 7,
            "sources": {},
            "layers": [{"id": "x", "type": "fill", "source": "nope"}]
        });
        let err = session.load_style_json(&style.to_string()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("version 7"), "{}", message);
        assert!(message.contains("nope"), "{}", message);
        assert!(session.style().is_none());
        assert_eq!(events.log.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_paint_change_relays_out_without_refetch() {
        let stub = Arc::new(StubFileSource::new(tokio::runtime::Handle::current()));
        stub.add_data(
            "https://s/0/0/0.json",
            r#"{"layers": {"land": [{"type": "Polygon", "geometry": [[[0,0],[9,0],[9,9]]]}]}}"#,
        );
        let mut session = session(stub.clone());
        session
            .load_style_json(
                &json!({
                    "version": 8,
                    "sources": {
                        "base": {"type": "vector", "tiles": ["https://s/{z}/{x}/{y}.json"]}
                    },
                    "layers": [{
                        "id": "land",
                        "type": "fill",
                        "source": "base",
                        "source-layer": "land",
                        "paint": {"fill-color": "#ff0000"}
                    }]
                })
                .to_string(),
            )
            .unwrap();
        settle(&mut session).await;

        assert!(session.set_paint_property("land", "fill-color", &json!("#0000ff")).unwrap());
        assert!(!session.set_paint_property("land", "fill-color", &json!("#0000ff")).unwrap());
        settle(&mut session).await;

        let tile = session.pyramid("base").unwrap().tiles().next().unwrap();
        assert_eq!(tile.buckets()[0].vertices[0].color, [0, 0, 255, 255]);
        assert_eq!(stub.request_count("https://s/0/0/0.json"), 1);
    }
}
