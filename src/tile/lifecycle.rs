//! Per-tile loading state machine

use crate::actor::ActorHandle;
use crate::core::tile_id::OverscaledTileId;
use crate::storage::{
    expiration_timeout, interpolate_expiration, now, AsyncRequest, Priority, Resource, Response,
    Timestamp,
};
use crate::style::{PropertyEvaluationParameters, SourceKind, SourceSpec, StyleLayer};
use crate::tile::bucket::Bucket;
use crate::tile::data::GeometryTileData;
use crate::tile::raster::RasterData;
use crate::tile::worker::{ParseOutput, TileWorker, WorkerMessage};
use crate::tile::{Renderer, TileContext, TileError, TileEvent, TileEventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Unloaded,
    Loading,
    Parsing,
    Ready,
    Errored,
}

/// What observers should hear about after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum TileNotification {
    Loaded { first_load: bool },
    Error(TileError),
    PlacementRedone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseReason {
    Data,
    Layers,
}

/// One tile of one source, owned by the thread driving the session.
///
/// Every state transition bumps the correlation id; parse results and
/// responses carrying an older id are dropped.
pub struct Tile {
    id: OverscaledTileId,
    source_id: String,
    kind: SourceKind,
    priority: Priority,
    state: TileState,
    correlation: u64,
    latest: Arc<AtomicU64>,
    worker: ActorHandle<TileWorker>,
    request: Option<AsyncRequest>,
    request_correlation: u64,
    parse_reason: ParseReason,
    data: Option<Arc<GeometryTileData>>,
    raster: Option<Arc<RasterData>>,
    buckets: Vec<Arc<Bucket>>,
    loaded_once: bool,
    error: Option<TileError>,
    failures: u32,
    retry_at: Option<Instant>,
    revalidate_at: Option<Instant>,
    expired_requests: u32,
    expires: Option<Timestamp>,
    modified: Option<Timestamp>,
    etag: Option<String>,
}

impl Tile {
    pub fn new(
        id: OverscaledTileId,
        source_id: impl Into<String>,
        kind: SourceKind,
        priority: Priority,
        context: &TileContext,
    ) -> Self {
        let source_id = source_id.into();
        let latest = Arc::new(AtomicU64::new(0));
        let worker = TileWorker::new(
            source_id.clone(),
            id,
            kind,
            context.decoder.clone(),
            latest.clone(),
            context.sink.clone(),
        );
        Self {
            id,
            source_id,
            kind,
            priority,
            state: TileState::Unloaded,
            correlation: 0,
            latest,
            worker: ActorHandle::spawn(&context.pool, worker),
            request: None,
            request_correlation: 0,
            parse_reason: ParseReason::Data,
            data: None,
            raster: None,
            buckets: Vec::new(),
            loaded_once: false,
            error: None,
            failures: 0,
            retry_at: None,
            revalidate_at: None,
            expired_requests: 0,
            expires: None,
            modified: None,
            etag: None,
        }
    }

    pub fn id(&self) -> OverscaledTileId {
        self.id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Changes how urgently the tile is fetched. A tile still waiting for
    /// its data asks again when the priority goes up.
    pub fn set_priority(
        &mut self,
        priority: Priority,
        source: &SourceSpec,
        context: &TileContext,
    ) {
        let raised = priority > self.priority;
        self.priority = priority;
        if raised && self.state == TileState::Loading && self.request.is_some() {
            self.load(source, context);
        }
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn correlation(&self) -> u64 {
        self.correlation
    }

    pub fn error(&self) -> Option<&TileError> {
        self.error.as_ref()
    }

    pub fn data(&self) -> Option<&Arc<GeometryTileData>> {
        self.data.as_ref()
    }

    pub fn raster(&self) -> Option<&Arc<RasterData>> {
        self.raster.as_ref()
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    /// Consecutive failed loads
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_loaded_once(&self) -> bool {
        self.loaded_once
    }

    /// Whether a request for this tile is outstanding
    pub fn is_requesting(&self) -> bool {
        self.request.is_some()
    }

    /// Tiles keep drawing their last parsed content while revalidating or
    /// re-parsing.
    pub fn is_renderable(&self) -> bool {
        self.loaded_once && self.state != TileState::Errored
    }

    /// Settled either way: nothing left to fetch or parse
    pub fn is_complete(&self) -> bool {
        matches!(self.state, TileState::Ready | TileState::Errored)
    }

    fn transition(&mut self, state: TileState) {
        self.correlation += 1;
        self.latest.store(self.correlation, Ordering::SeqCst);
        log::debug!(
            "tile {} of {}: {:?} -> {:?} (correlation {})",
            self.id,
            self.source_id,
            self.state,
            state,
            self.correlation
        );
        self.state = state;
    }

    /// Starts fetching the tile from scratch
    pub fn load(&mut self, source: &SourceSpec, context: &TileContext) {
        self.retry_at = None;
        self.transition(TileState::Loading);
        let resource = match self.resource(source, context) {
            Some(resource) => resource,
            None => {
                log::warn!("source {} has no tile URLs yet", self.source_id);
                return;
            }
        };
        self.send_request(resource, context);
    }

    /// Asks the server whether the data we hold is still current. The tile
    /// stays renderable with its current buckets meanwhile.
    pub fn revalidate(&mut self, source: &SourceSpec, context: &TileContext) {
        self.revalidate_at = None;
        let Some(resource) = self.resource(source, context) else {
            return;
        };
        log::debug!("revalidating tile {} of {}", self.id, self.source_id);
        let resource = resource.with_validators(self.etag.clone(), self.modified, self.expires);
        self.send_request(resource, context);
    }

    fn resource(&self, source: &SourceSpec, context: &TileContext) -> Option<Resource> {
        let canonical = self.id.canonical;
        let template = source.template_for(canonical.x, canonical.y)?;
        Some(
            Resource::tile(template, context.pixel_ratio, &canonical, source.scheme)
                .with_priority(self.priority),
        )
    }

    fn send_request(&mut self, resource: Resource, context: &TileContext) {
        let sink = context.sink.clone();
        let source_id = self.source_id.clone();
        let id = self.id;
        let correlation = self.correlation;
        self.request_correlation = correlation;
        // Replacing the handle cancels any previous request
        self.request = Some(context.file_source.request(
            resource,
            Box::new(move |response| {
                sink.post(TileEvent {
                    source_id,
                    id,
                    correlation,
                    kind: TileEventKind::Response(response),
                })
            }),
        ));
    }

    /// Applies a completed request. Successful data moves the tile to
    /// `Parsing`; errors either settle it as `Errored` or, while it still
    /// holds older data, only push the next revalidation back.
    pub fn on_response(
        &mut self,
        correlation: u64,
        response: Response,
        layers: &Arc<Vec<StyleLayer>>,
        params: PropertyEvaluationParameters,
        context: &TileContext,
    ) -> Option<TileNotification> {
        if self.request.is_none() || correlation != self.request_correlation {
            log::debug!("tile {} dropping stale response {}", self.id, correlation);
            return None;
        }
        self.request = None;
        let timestamp = now();

        if let Some(error) = &response.error {
            self.failures += 1;
            let error = TileError::from(error);
            if self.loaded_once {
                let delay = context.retry.delay_for(self.failures);
                log::warn!(
                    "revalidating tile {} of {} failed ({}), keeping stale data for {:?}",
                    self.id,
                    self.source_id,
                    error,
                    delay
                );
                self.revalidate_at = Some(Instant::now() + delay);
                return None;
            }
            return Some(self.fail(error, context));
        }

        let (expires, expired) = interpolate_expiration(response.expires, self.expires, timestamp);
        self.expired_requests = if expired { self.expired_requests + 1 } else { 0 };
        self.expires = expires;
        if response.modified.is_some() {
            self.modified = response.modified;
        }
        if response.etag.is_some() {
            self.etag = response.etag.clone();
        }
        self.failures = 0;
        self.revalidate_at = expiration_timeout(self.expires, self.expired_requests, timestamp)
            .map(|delay| Instant::now() + delay);

        if response.not_modified {
            log::debug!("tile {} of {} not modified", self.id, self.source_id);
            return None;
        }

        self.transition(TileState::Parsing);
        self.parse_reason = ParseReason::Data;
        self.worker.send(WorkerMessage::SetData {
            correlation: self.correlation,
            data: response.data,
            layers: layers.clone(),
            params,
        });
        None
    }

    fn fail(&mut self, error: TileError, context: &TileContext) -> TileNotification {
        self.transition(TileState::Errored);
        self.data = None;
        self.raster = None;
        self.buckets.clear();
        if !error.is_permanent() && context.retry_failed_tiles {
            let delay = context.retry.delay_for(self.failures);
            log::warn!(
                "tile {} of {} failed ({}), retrying in {:?}",
                self.id,
                self.source_id,
                error,
                delay
            );
            self.retry_at = Some(Instant::now() + delay);
        } else {
            log::error!("tile {} of {} failed: {}", self.id, self.source_id, error);
        }
        self.error = Some(error.clone());
        TileNotification::Error(error)
    }

    /// Applies a worker result
    pub fn on_parsed(
        &mut self,
        correlation: u64,
        result: Result<ParseOutput, TileError>,
        context: &TileContext,
    ) -> Option<TileNotification> {
        if correlation != self.correlation || self.state != TileState::Parsing {
            log::debug!(
                "tile {} discarding parse result {} (current {})",
                self.id,
                correlation,
                self.correlation
            );
            return None;
        }
        let output = match result {
            Ok(output) => output,
            Err(error) => return Some(self.fail(error, context)),
        };

        match output {
            ParseOutput::Vector { data, buckets } => {
                self.data = Some(data);
                self.raster = None;
                self.buckets = buckets;
            }
            ParseOutput::Raster(raster) => {
                self.data = None;
                self.raster = Some(raster);
                self.buckets.clear();
            }
            ParseOutput::Empty => {
                self.data = None;
                self.raster = None;
                self.buckets.clear();
            }
        }
        self.transition(TileState::Ready);
        self.error = None;

        if self.parse_reason == ParseReason::Layers {
            return Some(TileNotification::PlacementRedone);
        }
        let first_load = !self.loaded_once;
        self.loaded_once = true;
        log::info!("tile {} of {} ready ({} buckets)", self.id, self.source_id, self.buckets.len());
        Some(TileNotification::Loaded { first_load })
    }

    /// Rebuilds buckets for new style layers without fetching again. Tiles
    /// still loading pick the layers up when their data arrives.
    pub fn set_layers(
        &mut self,
        layers: &Arc<Vec<StyleLayer>>,
        params: PropertyEvaluationParameters,
    ) {
        match self.state {
            TileState::Ready | TileState::Parsing => {
                if self.state == TileState::Ready {
                    self.parse_reason = ParseReason::Layers;
                }
                self.transition(TileState::Parsing);
                self.worker.send(WorkerMessage::SetLayers {
                    correlation: self.correlation,
                    layers: layers.clone(),
                    params,
                });
            }
            TileState::Unloaded | TileState::Loading | TileState::Errored => {}
        }
    }

    /// An errored tile whose backoff has elapsed
    pub fn retry_due(&self, now: Instant) -> bool {
        self.state == TileState::Errored && self.retry_at.map_or(false, |at| at <= now)
    }

    /// A loaded tile whose data expired and is not being fetched already
    pub fn needs_revalidation(&self, now: Instant) -> bool {
        self.loaded_once
            && self.state != TileState::Errored
            && self.request.is_none()
            && self.revalidate_at.map_or(false, |at| at <= now)
    }

    /// Earliest time this tile wants attention again
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.retry_at, self.revalidate_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
        .filter(|_| self.state != TileState::Loading)
    }

    /// Hands the tile's render data to the renderer
    pub fn upload(&self, renderer: &mut dyn Renderer) {
        if !self.is_renderable() {
            return;
        }
        for bucket in &self.buckets {
            renderer.upload_bucket(&self.id, bucket);
        }
        if let Some(raster) = &self.raster {
            renderer.upload_raster(&self.id, raster);
        }
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        if self.request.is_some() || self.state == TileState::Parsing {
            log::debug!("tile {} of {} destroyed while busy", self.id, self.source_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{OwnerInbox, ThreadPool};
    use crate::core::tile_id::CanonicalTileId;
    use crate::storage::{BackoffPolicy, ErrorReason, StubFileSource, StubReply};
    use crate::tile::data::JsonTileDecoder;
    use crate::tile::TileEventKind;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    const TILE_JSON: &str = r#"{"layers": {"water": [
        {"type": "Polygon", "geometry": [[[0,0],[10,0],[10,10],[0,10]]]}
    ]}}"#;

    struct Fixture {
        inbox: OwnerInbox<TileEvent>,
        pending: RefCell<VecDeque<TileEvent>>,
        stub: Arc<StubFileSource>,
        context: TileContext,
        source: SourceSpec,
        layers: Arc<Vec<StyleLayer>>,
    }

    fn fixture() -> Fixture {
        fixture_with(StubFileSource::new(tokio::runtime::Handle::current()))
    }

    fn fixture_with(stub: StubFileSource) -> Fixture {
        let inbox = OwnerInbox::new();
        let stub = Arc::new(stub);
        let context = TileContext {
            file_source: stub.clone(),
            pool: Arc::new(ThreadPool::new(2, "tile-test").unwrap()),
            sink: Arc::new(inbox.sender()),
            decoder: Arc::new(JsonTileDecoder),
            retry: BackoffPolicy {
                jitter_ratio: 0.0,
                ..BackoffPolicy::default()
            },
            retry_failed_tiles: true,
            pixel_ratio: 1.0,
        };
        let source: SourceSpec = serde_json::from_value(json!({
            "type": "vector",
            "tiles": ["https://t/{z}/{x}/{y}.json"]
        }))
        .unwrap();
        let layer = StyleLayer::from_json(
            &json!({"id": "water", "type": "fill", "source": "s", "source-layer": "water"}),
            std::time::Instant::now(),
        )
        .unwrap();
        Fixture {
            inbox,
            pending: RefCell::new(VecDeque::new()),
            stub,
            context,
            source,
            layers: Arc::new(vec![layer]),
        }
    }

    fn tile(fixture: &Fixture) -> Tile {
        let id = OverscaledTileId::from_canonical(CanonicalTileId::new(1, 1, 0).unwrap());
        Tile::new(id, "s", SourceKind::Vector, Priority::Required, &fixture.context)
    }

    fn params() -> PropertyEvaluationParameters {
        PropertyEvaluationParameters::new(1.0, std::time::Instant::now())
    }

    async fn next_event(fixture: &Fixture) -> TileEvent {
        for _ in 0..500 {
            let mut pending = fixture.pending.borrow_mut();
            pending.extend(fixture.inbox.drain());
            if let Some(event) = pending.pop_front() {
                return event;
            }
            drop(pending);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no tile event arrived");
    }

    fn apply(fixture: &Fixture, tile: &mut Tile, event: TileEvent) -> Option<TileNotification> {
        match event.kind {
            TileEventKind::Response(response) => tile.on_response(
                event.correlation,
                response,
                &fixture.layers,
                params(),
                &fixture.context,
            ),
            TileEventKind::Parsed(result) => {
                tile.on_parsed(event.correlation, result, &fixture.context)
            }
        }
    }

    #[tokio::test]
    async fn test_load_parse_ready() {
        let fixture = fixture();
        fixture.stub.add_data("https://t/1/1/0.json", TILE_JSON);
        let mut tile = tile(&fixture);
        assert_eq!(tile.state(), TileState::Unloaded);

        tile.load(&fixture.source, &fixture.context);
        assert_eq!(tile.state(), TileState::Loading);

        let event = next_event(&fixture).await;
        assert!(apply(&fixture, &mut tile, event).is_none());
        assert_eq!(tile.state(), TileState::Parsing);

        let event = next_event(&fixture).await;
        assert_eq!(
            apply(&fixture, &mut tile, event),
            Some(TileNotification::Loaded { first_load: true })
        );
        assert_eq!(tile.state(), TileState::Ready);
        assert_eq!(tile.buckets().len(), 1);
        assert!(tile.is_renderable());
    }

    #[tokio::test]
    async fn test_style_change_discards_first_parse() {
        let fixture = fixture();
        fixture.stub.add_data("https://t/1/1/0.json", TILE_JSON);
        let mut tile = tile(&fixture);
        tile.load(&fixture.source, &fixture.context);
        let event = next_event(&fixture).await;
        apply(&fixture, &mut tile, event);
        let first = tile.correlation();

        // Layers change before the first parse comes back
        tile.set_layers(&Arc::new(Vec::new()), params());
        assert!(tile.correlation() > first);

        let mut notifications = Vec::new();
        while tile.state() != TileState::Ready {
            let event = next_event(&fixture).await;
            if let TileEventKind::Parsed(_) = &event.kind {
                if event.correlation == first {
                    assert!(apply(&fixture, &mut tile, event).is_none());
                    continue;
                }
            }
            notifications.extend(apply(&fixture, &mut tile, event));
        }
        assert_eq!(notifications, vec![TileNotification::Loaded { first_load: true }]);
        // The empty layer set produced no buckets
        assert!(tile.buckets().is_empty());

        // A style change on a ready tile re-parses without fetching
        tile.set_layers(&fixture.layers, params());
        assert_eq!(tile.state(), TileState::Parsing);
        let event = next_event(&fixture).await;
        assert_eq!(apply(&fixture, &mut tile, event), Some(TileNotification::PlacementRedone));
        assert_eq!(tile.buckets().len(), 1);
        assert_eq!(fixture.stub.request_count("https://t/1/1/0.json"), 1);
    }

    #[tokio::test]
    async fn test_reload_ignores_response_already_posted() {
        const TWO_FEATURES: &str = r#"{"layers": {"water": [
            {"type": "Polygon", "geometry": [[[0,0],[10,0],[10,10],[0,10]]]},
            {"type": "Polygon", "geometry": [[[20,20],[30,20],[30,30]]]}
        ]}}"#;
        let stub = StubFileSource::with_handler(tokio::runtime::Handle::current(), |_, previous| {
            if previous == 0 {
                StubReply::now(Response::with_data(TILE_JSON))
            } else {
                StubReply::after(Duration::from_millis(30), Response::with_data(TWO_FEATURES))
            }
        });
        let fixture = fixture_with(stub);
        let mut tile = tile(&fixture);

        tile.load(&fixture.source, &fixture.context);
        let first_request = tile.correlation();
        let stale = next_event(&fixture).await;
        assert_eq!(stale.correlation, first_request);

        // Reload while the first response sits in the inbox
        tile.load(&fixture.source, &fixture.context);
        assert!(tile.correlation() > first_request);
        assert!(apply(&fixture, &mut tile, stale).is_none());
        assert_eq!(tile.state(), TileState::Loading);

        let mut notifications = Vec::new();
        while tile.state() != TileState::Ready {
            let event = next_event(&fixture).await;
            notifications.extend(apply(&fixture, &mut tile, event));
        }
        assert_eq!(notifications, vec![TileNotification::Loaded { first_load: true }]);
        assert_eq!(tile.buckets().len(), 1);
        assert_eq!(tile.buckets()[0].feature_count, 2);
        assert_eq!(fixture.stub.request_count("https://t/1/1/0.json"), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let fixture = fixture();
        let mut tile = tile(&fixture);
        tile.load(&fixture.source, &fixture.context);
        let event = next_event(&fixture).await;

        let notification = apply(&fixture, &mut tile, event);
        assert!(matches!(notification, Some(TileNotification::Error(TileError::NotFound(_)))));
        assert_eq!(tile.state(), TileState::Errored);
        assert!(!tile.retry_due(Instant::now() + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_transient_error_schedules_retry() {
        let fixture = fixture();
        fixture
            .stub
            .add("https://t/1/1/0.json", Response::with_error(ErrorReason::Server, "503"));
        let mut tile = tile(&fixture);
        tile.load(&fixture.source, &fixture.context);
        let event = next_event(&fixture).await;
        apply(&fixture, &mut tile, event);

        assert_eq!(tile.state(), TileState::Errored);
        assert_eq!(tile.failures(), 1);
        assert!(!tile.retry_due(Instant::now()));
        assert!(tile.retry_due(Instant::now() + Duration::from_secs(2)));

        fixture.stub.add_data("https://t/1/1/0.json", TILE_JSON);
        tile.load(&fixture.source, &fixture.context);
        assert_eq!(tile.state(), TileState::Loading);
        let event = next_event(&fixture).await;
        apply(&fixture, &mut tile, event);
        let event = next_event(&fixture).await;
        assert_eq!(
            apply(&fixture, &mut tile, event),
            Some(TileNotification::Loaded { first_load: true })
        );
        assert_eq!(tile.failures(), 0);
    }

    #[tokio::test]
    async fn test_expired_tile_revalidates_and_keeps_buckets() {
        let fixture = fixture();
        let expired = Response {
            expires: Some(now() - chrono::Duration::seconds(10)),
            ..Response::with_data(TILE_JSON)
        };
        fixture.stub.add("https://t/1/1/0.json", expired);
        let mut tile = tile(&fixture);
        tile.load(&fixture.source, &fixture.context);
        while tile.state() != TileState::Ready {
            let event = next_event(&fixture).await;
            apply(&fixture, &mut tile, event);
        }

        // Already expired on arrival: revalidate after one second
        assert!(!tile.needs_revalidation(Instant::now()));
        assert!(tile.needs_revalidation(Instant::now() + Duration::from_secs(2)));

        fixture.stub.add("https://t/1/1/0.json", Response::not_modified());
        tile.revalidate(&fixture.source, &fixture.context);
        assert!(tile.is_requesting());
        assert_eq!(tile.state(), TileState::Ready);
        let event = next_event(&fixture).await;
        assert!(apply(&fixture, &mut tile, event).is_none());
        assert_eq!(tile.state(), TileState::Ready);
        assert_eq!(tile.buckets().len(), 1);
    }
}
