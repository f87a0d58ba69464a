//! Glyph range requests

use crate::actor::Post;
use crate::constants::{GLYPH_MAX_CODEPOINT, GLYPH_RANGE_SIZE};
use crate::storage::{AsyncRequest, FileSource, Resource, Response};
use crate::style::StyleEvent;
use crate::MapError;
use fxhash::FxHashMap;
use std::sync::Arc;

/// Inclusive codepoint range, always aligned to [`GLYPH_RANGE_SIZE`]
pub type GlyphRange = (u32, u32);

/// The range containing `codepoint`; `None` outside the basic
/// multilingual plane.
pub fn glyph_range(codepoint: u32) -> Option<GlyphRange> {
    if codepoint > GLYPH_MAX_CODEPOINT {
        return None;
    }
    let start = codepoint / GLYPH_RANGE_SIZE * GLYPH_RANGE_SIZE;
    Some((start, start + GLYPH_RANGE_SIZE - 1))
}

enum RangeState {
    Loading(#[allow(dead_code)] AsyncRequest),
    Loaded(Arc<Vec<u8>>),
    Failed,
}

/// Fetches glyph ranges per font stack, each at most once. Bytes are
/// handed on untouched; shaping happens elsewhere.
pub struct GlyphManager {
    url_template: Option<String>,
    ranges: FxHashMap<(String, u32), RangeState>,
}

impl GlyphManager {
    pub fn new(url_template: Option<String>) -> Self {
        Self {
            url_template,
            ranges: FxHashMap::default(),
        }
    }

    /// Switching templates drops every range, cancelling pending requests
    pub fn set_url_template(&mut self, url_template: Option<String>) {
        if self.url_template != url_template {
            self.url_template = url_template;
            self.ranges.clear();
        }
    }

    /// Requests every range needed to draw `text`. Returns how many new
    /// requests were issued.
    pub fn request_text(
        &mut self,
        font_stack: &str,
        text: &str,
        file_source: &dyn FileSource,
        sink: &Arc<dyn Post<StyleEvent>>,
    ) -> usize {
        let mut ranges: Vec<GlyphRange> =
            text.chars().filter_map(|c| glyph_range(c as u32)).collect();
        ranges.sort_unstable();
        ranges.dedup();
        ranges
            .into_iter()
            .filter(|range| self.request_range(font_stack, *range, file_source, sink))
            .count()
    }

    /// Returns false when the range was requested before or no glyph URL
    /// is configured.
    pub fn request_range(
        &mut self,
        font_stack: &str,
        range: GlyphRange,
        file_source: &dyn FileSource,
        sink: &Arc<dyn Post<StyleEvent>>,
    ) -> bool {
        let Some(template) = &self.url_template else {
            log::debug!("no glyph URL configured, skipping {} {:?}", font_stack, range);
            return false;
        };
        let key = (font_stack.to_owned(), range.0);
        if self.ranges.contains_key(&key) {
            return false;
        }

        let sink = sink.clone();
        let stack = font_stack.to_owned();
        let request = file_source.request(
            Resource::glyphs(template, font_stack, range.0, range.1),
            Box::new(move |response| {
                sink.post(StyleEvent::Glyphs {
                    font_stack: stack,
                    range,
                    response,
                })
            }),
        );
        self.ranges.insert(key, RangeState::Loading(request));
        true
    }

    /// Records a response. Returns the outcome if the range was pending.
    pub fn on_response(
        &mut self,
        font_stack: &str,
        range: GlyphRange,
        response: Response,
    ) -> Option<Result<Arc<Vec<u8>>, MapError>> {
        let state = self.ranges.get_mut(&(font_stack.to_owned(), range.0))?;
        if !matches!(state, RangeState::Loading(_)) {
            return None;
        }
        if let Some(error) = response.error {
            *state = RangeState::Failed;
            return Some(Err(MapError::Style(format!(
                "glyphs {} {}-{}: {}",
                font_stack, range.0, range.1, error
            ))));
        }
        let data = response.data.unwrap_or_default();
        log::debug!("glyphs {} {}-{} loaded ({} bytes)", font_stack, range.0, range.1, data.len());
        *state = RangeState::Loaded(data.clone());
        Some(Ok(data))
    }

    pub fn glyphs(&self, font_stack: &str, range: GlyphRange) -> Option<&Arc<Vec<u8>>> {
        match self.ranges.get(&(font_stack.to_owned(), range.0)) {
            Some(RangeState::Loaded(data)) => Some(data),
            _ => None,
        }
    }

    pub fn is_loaded(&self, font_stack: &str, range: GlyphRange) -> bool {
        self.glyphs(font_stack, range).is_some()
    }

    pub fn has_failed(&self, font_stack: &str, range: GlyphRange) -> bool {
        matches!(
            self.ranges.get(&(font_stack.to_owned(), range.0)),
            Some(RangeState::Failed)
        )
    }

    /// Ranges still waiting for a response
    pub fn pending(&self) -> usize {
        self.ranges
            .values()
            .filter(|state| matches!(state, RangeState::Loading(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::OwnerInbox;
    use crate::storage::StubFileSource;
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[test]
    fn test_glyph_range() {
        assert_eq!(glyph_range(0), Some((0, 255)));
        assert_eq!(glyph_range('A' as u32), Some((0, 255)));
        assert_eq!(glyph_range(256), Some((256, 511)));
        assert_eq!(glyph_range(0xFFFF), Some((65280, 65535)));
        assert_eq!(glyph_range(0x1F600), None);
    }

    #[tokio::test]
    async fn test_ranges_requested_once() {
        let stub = StubFileSource::new(Handle::current());
        stub.add_data("https://fonts/Open%20Sans/0-255.pbf", vec![1, 2, 3]);
        let inbox = OwnerInbox::<StyleEvent>::new();
        let sink: Arc<dyn Post<StyleEvent>> = Arc::new(inbox.sender());
        let mut glyphs = GlyphManager::new(Some("https://fonts/{fontstack}/{range}.pbf".into()));

        // "Hi" needs 0-255, "Ā" needs 256-511
        assert_eq!(glyphs.request_text("Open Sans", "HiĀ", &stub, &sink), 2);
        assert_eq!(glyphs.request_text("Open Sans", "Hello", &stub, &sink), 0);
        assert_eq!(glyphs.pending(), 2);

        let mut outcomes = Vec::new();
        while outcomes.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            for event in inbox.drain() {
                if let StyleEvent::Glyphs { font_stack, range, response } = event {
                    outcomes.push((range, glyphs.on_response(&font_stack, range, response)));
                }
            }
        }
        outcomes.sort_by_key(|(range, _)| *range);
        assert_eq!(outcomes[0].1.as_ref().unwrap().as_ref().unwrap().as_slice(), &[1, 2, 3]);
        assert!(outcomes[1].1.as_ref().unwrap().is_err());
        assert!(glyphs.is_loaded("Open Sans", (0, 255)));
        assert!(glyphs.has_failed("Open Sans", (256, 511)));
        assert_eq!(stub.request_count("https://fonts/Open%20Sans/256-511.pbf"), 1);
    }

    #[test]
    fn test_without_template_nothing_is_requested() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let stub = StubFileSource::new(runtime.handle().clone());
        let inbox = OwnerInbox::<StyleEvent>::new();
        let sink: Arc<dyn Post<StyleEvent>> = Arc::new(inbox.sender());
        let mut glyphs = GlyphManager::new(None);
        assert_eq!(glyphs.request_text("Open Sans", "abc", &stub, &sink), 0);
        assert_eq!(stub.total_requests(), 0);
    }
}
