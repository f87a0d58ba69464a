//! Sprite sheet loading

use crate::actor::{Post, TaskHandle, ThreadPool};
use crate::storage::{AsyncRequest, FileSource, Resource, Response};
use crate::style::StyleEvent;
use crate::MapError;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Placement of one icon within the sprite image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpriteImage {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "pixelRatio", default = "default_ratio")]
    pub pixel_ratio: f32,
    #[serde(default)]
    pub sdf: bool,
}

fn default_ratio() -> f32 {
    1.0
}

/// The parsed sprite index and the raw sprite image bytes
#[derive(Debug, Clone, PartialEq)]
pub struct SpriteSheet {
    pub images: FxHashMap<String, SpriteImage>,
    pub png: Arc<Vec<u8>>,
}

impl SpriteSheet {
    /// Parses `sprite.json`. Icons extending past the image bounds are
    /// rejected when the PNG header gives the dimensions.
    pub fn parse(json: &[u8], png: Arc<Vec<u8>>) -> Result<Self, String> {
        let images: FxHashMap<String, SpriteImage> =
            serde_json::from_slice(json).map_err(|err| format!("invalid sprite index: {}", err))?;
        if let Some((width, height)) = png_dimensions(&png) {
            if let Some((name, _)) = images
                .iter()
                .find(|(_, image)| image.x + image.width > width || image.y + image.height > height)
            {
                return Err(format!("sprite image {} lies outside the sheet", name));
            }
        }
        Ok(Self { images, png })
    }

    pub fn image(&self, name: &str) -> Option<&SpriteImage> {
        self.images.get(name)
    }
}

/// Width and height from a PNG IHDR chunk
fn png_dimensions(png: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
    if png.len() < 24 || &png[..8] != SIGNATURE || &png[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(png[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(png[20..24].try_into().ok()?);
    Some((width, height))
}

/// Fetches `sprite.json` and `sprite.png` (with `@2x` for high density
/// displays), then parses the index on the worker pool once both arrived.
pub struct SpriteLoader {
    base: String,
    pixel_ratio: f32,
    generation: u64,
    json_request: Option<AsyncRequest>,
    image_request: Option<AsyncRequest>,
    json: Option<Arc<Vec<u8>>>,
    image: Option<Arc<Vec<u8>>>,
    parse_task: Option<TaskHandle>,
    sheet: Option<Arc<SpriteSheet>>,
    failed: bool,
}

impl SpriteLoader {
    pub fn new(base: impl Into<String>, pixel_ratio: f32) -> Self {
        Self {
            base: base.into(),
            pixel_ratio,
            generation: 0,
            json_request: None,
            image_request: None,
            json: None,
            image: None,
            parse_task: None,
            sheet: None,
            failed: false,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Starts (or restarts) both requests
    pub fn load(&mut self, file_source: &dyn FileSource, sink: &Arc<dyn Post<StyleEvent>>) {
        self.cancel();
        self.generation += 1;
        self.failed = false;
        let generation = self.generation;

        let json_sink = sink.clone();
        self.json_request = Some(file_source.request(
            Resource::sprite_json(&self.base, self.pixel_ratio),
            Box::new(move |response| {
                json_sink.post(StyleEvent::SpriteJson { generation, response })
            }),
        ));
        let image_sink = sink.clone();
        self.image_request = Some(file_source.request(
            Resource::sprite_image(&self.base, self.pixel_ratio),
            Box::new(move |response| {
                image_sink.post(StyleEvent::SpriteImage { generation, response })
            }),
        ));
    }

    fn cancel(&mut self) {
        self.json_request = None;
        self.image_request = None;
        if let Some(task) = self.parse_task.take() {
            task.cancel();
        }
        self.json = None;
        self.image = None;
    }

    pub fn on_json(
        &mut self,
        generation: u64,
        response: Response,
        pool: &ThreadPool,
        sink: &Arc<dyn Post<StyleEvent>>,
    ) -> Option<MapError> {
        if generation != self.generation || self.failed {
            return None;
        }
        self.json_request = None;
        match self.accept(response, "sprite index") {
            Ok(data) => {
                self.json = Some(data);
                self.parse_when_complete(pool, sink);
                None
            }
            Err(err) => Some(err),
        }
    }

    pub fn on_image(
        &mut self,
        generation: u64,
        response: Response,
        pool: &ThreadPool,
        sink: &Arc<dyn Post<StyleEvent>>,
    ) -> Option<MapError> {
        if generation != self.generation || self.failed {
            return None;
        }
        self.image_request = None;
        match self.accept(response, "sprite image") {
            Ok(data) => {
                self.image = Some(data);
                self.parse_when_complete(pool, sink);
                None
            }
            Err(err) => Some(err),
        }
    }

    /// A failure in either half cancels the other
    fn accept(&mut self, response: Response, what: &str) -> Result<Arc<Vec<u8>>, MapError> {
        let failure = match (response.error, response.data) {
            (Some(error), _) => format!("{} {}: {}", what, self.base, error),
            (None, Some(data)) => return Ok(data),
            (None, None) => format!("{} {}: empty response", what, self.base),
        };
        self.cancel();
        self.failed = true;
        Err(MapError::Style(failure))
    }

    fn parse_when_complete(&mut self, pool: &ThreadPool, sink: &Arc<dyn Post<StyleEvent>>) {
        let (Some(json), Some(image)) = (self.json.clone(), self.image.clone()) else {
            return;
        };
        let generation = self.generation;
        let sink = sink.clone();
        self.parse_task = Some(pool.spawn(move || {
            let result = SpriteSheet::parse(&json, image);
            sink.post(StyleEvent::SpriteParsed { generation, result });
        }));
    }

    /// Applies a parse result; returns the notification to deliver
    pub fn on_parsed(
        &mut self,
        generation: u64,
        result: Result<SpriteSheet, String>,
    ) -> Option<Result<Arc<SpriteSheet>, MapError>> {
        if generation != self.generation || self.failed {
            return None;
        }
        self.parse_task = None;
        match result {
            Ok(sheet) => {
                log::info!("sprite {} loaded ({} images)", self.base, sheet.images.len());
                let sheet = Arc::new(sheet);
                self.sheet = Some(sheet.clone());
                Some(Ok(sheet))
            }
            Err(message) => {
                self.failed = true;
                Some(Err(MapError::Style(message)))
            }
        }
    }

    pub fn sheet(&self) -> Option<&Arc<SpriteSheet>> {
        self.sheet.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        !self.failed && self.sheet.is_none() && self.generation > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::OwnerInbox;
    use crate::storage::StubFileSource;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
        png.extend_from_slice(&width.to_be_bytes());
        png.extend_from_slice(&height.to_be_bytes());
        png
    }

    #[test]
    fn test_parse_index() {
        let json = br#"{"airport": {"x": 0, "y": 0, "width": 16, "height": 16, "pixelRatio": 2}}"#;
        let sheet = SpriteSheet::parse(json, Arc::new(png_header(32, 32))).unwrap();
        assert_eq!(sheet.image("airport").unwrap().pixel_ratio, 2.0);

        let outside = br#"{"big": {"x": 20, "y": 0, "width": 16, "height": 16}}"#;
        assert!(SpriteSheet::parse(outside, Arc::new(png_header(32, 32))).is_err());
        assert!(SpriteSheet::parse(b"[]", Arc::new(Vec::new())).is_err());
    }

    #[tokio::test]
    async fn test_loads_both_halves_at_2x() {
        let stub = StubFileSource::new(Handle::current());
        stub.add_data(
            "https://s/base@2x.json",
            br#"{"dot": {"x": 0, "y": 0, "width": 4, "height": 4}}"#.to_vec(),
        );
        stub.add_data("https://s/base@2x.png", png_header(8, 8));
        let pool = ThreadPool::new(1, "sprite-test").unwrap();
        let inbox = OwnerInbox::<StyleEvent>::new();
        let sink: Arc<dyn Post<StyleEvent>> = Arc::new(inbox.sender());

        let mut loader = SpriteLoader::new("https://s/base", 2.0);
        loader.load(&stub, &sink);

        let mut loaded = None;
        for _ in 0..200 {
            for event in inbox.drain() {
                match event {
                    StyleEvent::SpriteJson { generation, response } => {
                        assert!(loader.on_json(generation, response, &pool, &sink).is_none());
                    }
                    StyleEvent::SpriteImage { generation, response } => {
                        assert!(loader.on_image(generation, response, &pool, &sink).is_none());
                    }
                    StyleEvent::SpriteParsed { generation, result } => {
                        loaded = loader.on_parsed(generation, result);
                    }
                    _ => {}
                }
            }
            if loaded.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sheet = loaded.unwrap().unwrap();
        assert!(sheet.image("dot").is_some());
        assert!(!loader.is_loading());
    }

    #[tokio::test]
    async fn test_missing_half_fails() {
        let stub = StubFileSource::new(Handle::current());
        stub.add_data("https://s/base.json", b"{}".to_vec());
        let pool = ThreadPool::new(1, "sprite-test").unwrap();
        let inbox = OwnerInbox::<StyleEvent>::new();
        let sink: Arc<dyn Post<StyleEvent>> = Arc::new(inbox.sender());
        let mut loader = SpriteLoader::new("https://s/base", 1.0);
        loader.load(&stub, &sink);

        let mut error = None;
        for _ in 0..200 {
            for event in inbox.drain() {
                if let StyleEvent::SpriteImage { generation, response } = event {
                    error = loader.on_image(generation, response, &pool, &sink);
                }
            }
            if error.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(error, Some(MapError::Style(_))));
        assert!(!loader.is_loading());
    }
}
