//! Resource identity and fetch results

use crate::core::tile_id::CanonicalTileId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type Timestamp = chrono::DateTime<chrono::Utc>;

pub fn now() -> Timestamp {
    chrono::Utc::now()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Style,
    Source,
    Tile,
    Glyphs,
    SpriteImage,
    SpriteJson,
    Image,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Style => "style",
            Self::Source => "source",
            Self::Tile => "tile",
            Self::Glyphs => "glyphs",
            Self::SpriteImage => "sprite-image",
            Self::SpriteJson => "sprite-json",
            Self::Image => "image",
        };
        f.write_str(name)
    }
}

/// Request priority. Required requests are dispatched before optional ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Optional = 0,
    Required = 1,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Required
    }
}

/// Row order of a tile source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileScheme {
    Xyz,
    Tms,
}

impl Default for TileScheme {
    fn default() -> Self {
        Self::Xyz
    }
}

/// Identity of a resource for caching and request coalescing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub url: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileData {
    pub url_template: String,
    pub pixel_ratio: u8,
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

/// A request for bytes. Immutable once created; the revalidation hints do
/// not take part in its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub url: String,
    pub priority: Priority,
    pub tile_data: Option<TileData>,
    pub prior_etag: Option<String>,
    pub prior_modified: Option<Timestamp>,
    pub prior_expires: Option<Timestamp>,
}

impl Resource {
    pub fn new(kind: ResourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            priority: Priority::Required,
            tile_data: None,
            prior_etag: None,
            prior_modified: None,
            prior_expires: None,
        }
    }

    pub fn style(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Style, url)
    }

    pub fn source(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Source, url)
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::new(ResourceKind::Image, url)
    }

    /// Resolves a tile URL template such as
    /// `https://tiles.example.com/{z}/{x}/{y}.pbf`.
    ///
    /// Supported tokens: `{z}`, `{x}`, `{y}`, `{prefix}`, `{quadkey}` and
    /// `{ratio}` (`@2x` for high density displays).
    pub fn tile(
        url_template: &str,
        pixel_ratio: f32,
        id: &CanonicalTileId,
        scheme: TileScheme,
    ) -> Self {
        let ratio = if pixel_ratio > 1.0 { 2 } else { 1 };
        let y = match scheme {
            TileScheme::Xyz => id.y,
            TileScheme::Tms => id.tms_y(),
        };
        let prefix = format!("{:x}{:x}", id.x % 16, id.y % 16);
        let url = url_template
            .replace("{z}", &id.z.to_string())
            .replace("{x}", &id.x.to_string())
            .replace("{y}", &y.to_string())
            .replace("{prefix}", &prefix)
            .replace("{quadkey}", &id.quadkey())
            .replace("{ratio}", if ratio > 1 { "@2x" } else { "" });

        let mut resource = Self::new(ResourceKind::Tile, url);
        resource.tile_data = Some(TileData {
            url_template: url_template.to_string(),
            pixel_ratio: ratio,
            z: id.z,
            x: id.x,
            y,
        });
        resource
    }

    /// Glyph range request for one font stack, e.g. `0-255.pbf`
    pub fn glyphs(url_template: &str, font_stack: &str, start: u32, end: u32) -> Self {
        let url = url_template
            .replace("{fontstack}", &encode_font_stack(font_stack))
            .replace("{range}", &format!("{}-{}", start, end));
        Self::new(ResourceKind::Glyphs, url)
    }

    pub fn sprite_image(base: &str, pixel_ratio: f32) -> Self {
        Self::new(
            ResourceKind::SpriteImage,
            format!("{}{}.png", base, ratio_suffix(pixel_ratio)),
        )
    }

    pub fn sprite_json(base: &str, pixel_ratio: f32) -> Self {
        Self::new(
            ResourceKind::SpriteJson,
            format!("{}{}.json", base, ratio_suffix(pixel_ratio)),
        )
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches the validators of a previously fetched copy so the server
    /// can answer `304 Not Modified`.
    pub fn with_validators(
        mut self,
        etag: Option<String>,
        modified: Option<Timestamp>,
        expires: Option<Timestamp>,
    ) -> Self {
        self.prior_etag = etag;
        self.prior_modified = modified;
        self.prior_expires = expires;
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind,
            url: self.url.clone(),
        }
    }

    pub fn has_validators(&self) -> bool {
        self.prior_etag.is_some() || self.prior_modified.is_some()
    }
}

fn ratio_suffix(pixel_ratio: f32) -> &'static str {
    if pixel_ratio > 1.0 {
        "@2x"
    } else {
        ""
    }
}

fn encode_font_stack(font_stack: &str) -> String {
    font_stack
        .split(',')
        .map(|font| font.trim().replace(' ', "%20"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Why a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorReason {
    /// The resource does not exist; never retried
    NotFound,
    /// 5xx responses
    Server,
    /// DNS, socket, TLS, timeouts and offline mode
    Connection,
    /// 429 responses
    RateLimit,
    Other,
}

impl ErrorReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::Server => "server error",
            Self::Connection => "connection error",
            Self::RateLimit => "rate limited",
            Self::Other => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub reason: ErrorReason,
    pub message: String,
    /// Earliest time the server wants to see a retry
    pub retry_after: Option<Timestamp>,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Result of a completed request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub data: Option<Arc<Vec<u8>>>,
    pub error: Option<ResponseError>,
    /// The server answered successfully with an empty body (204)
    pub no_content: bool,
    /// The copy described by the request's validators is still current (304)
    pub not_modified: bool,
    pub must_revalidate: bool,
    pub expires: Option<Timestamp>,
    pub modified: Option<Timestamp>,
    pub etag: Option<String>,
}

impl Response {
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(Arc::new(data.into())),
            ..Self::default()
        }
    }

    pub fn with_error(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            error: Some(ResponseError {
                reason,
                message: message.into(),
                retry_after: None,
            }),
            ..Self::default()
        }
    }

    pub fn no_content() -> Self {
        Self {
            no_content: true,
            ..Self::default()
        }
    }

    pub fn not_modified() -> Self {
        Self {
            not_modified: true,
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_reason(&self) -> Option<ErrorReason> {
        self.error.as_ref().map(|e| e.reason)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.map(|expires| expires <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_template() {
        let id = CanonicalTileId::new(3, 5, 2).unwrap();
        let resource = Resource::tile(
            "https://tiles.example.com/{z}/{x}/{y}{ratio}.pbf",
            2.0,
            &id,
            TileScheme::Xyz,
        );
        assert_eq!(resource.url, "https://tiles.example.com/3/5/2@2x.pbf");
        assert_eq!(resource.kind, ResourceKind::Tile);
        let data = resource.tile_data.unwrap();
        assert_eq!((data.z, data.x, data.y, data.pixel_ratio), (3, 5, 2, 2));
    }

    #[test]
    fn test_tms_and_quadkey_tokens() {
        let id = CanonicalTileId::new(3, 3, 5).unwrap();
        let tms = Resource::tile("t/{z}/{x}/{y}", 1.0, &id, TileScheme::Tms);
        assert_eq!(tms.url, "t/3/3/2");

        let quad = Resource::tile("q/{quadkey}/{prefix}", 1.0, &id, TileScheme::Xyz);
        assert_eq!(quad.url, "q/213/35");
    }

    #[test]
    fn test_glyph_and_sprite_urls() {
        let glyphs = Resource::glyphs(
            "https://fonts.example.com/{fontstack}/{range}.pbf",
            "Open Sans Regular, Arial Unicode MS Regular",
            0,
            255,
        );
        assert_eq!(
            glyphs.url,
            concat!(
                "https://fonts.example.com/",
                "Open%20Sans%20Regular,Arial%20Unicode%20MS%20Regular/0-255.pbf"
            )
        );

        assert_eq!(
            Resource::sprite_json("https://s.example.com/sprite", 2.0).url,
            "https://s.example.com/sprite@2x.json"
        );
        assert_eq!(
            Resource::sprite_image("https://s.example.com/sprite", 1.0).url,
            "https://s.example.com/sprite.png"
        );
    }

    #[test]
    fn test_key_ignores_validators() {
        let plain = Resource::style("https://example.com/style.json");
        let validated = plain
            .clone()
            .with_validators(Some("\"abc\"".into()), None, None)
            .with_priority(Priority::Optional);
        assert_eq!(plain.key(), validated.key());
        assert!(validated.has_validators());
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Required > Priority::Optional);
        assert!(!ErrorReason::NotFound.is_retryable());
        assert!(ErrorReason::Connection.is_retryable());
    }
}
