//! Pipeline-wide constants.
//! Keeping them in a single place makes it easier to tweak engine-wide magic numbers.

/// Default square tile size in pixels for vector sources.
pub const TILE_SIZE: u32 = 512;

/// Default tile size for raster sources.
pub const RASTER_TILE_SIZE: u32 = 256;

/// Extent of the vector tile coordinate space when a tile does not declare one.
pub const DEFAULT_TILE_EXTENT: u32 = 4096;

/// Highest zoom level a canonical tile id may address.
pub const MAX_TILE_ZOOM: u8 = 30;

/// Highest zoom level a viewport or overscaled tile may address.
pub const MAX_ZOOM: u8 = 25;

/// Default zoom range of a source that does not declare one.
pub const DEFAULT_SOURCE_MIN_ZOOM: u8 = 0;
pub const DEFAULT_SOURCE_MAX_ZOOM: u8 = 22;

/// Number of codepoints covered by one glyph range request.
pub const GLYPH_RANGE_SIZE: u32 = 256;

/// Highest codepoint a glyph range may cover (the basic multilingual plane).
pub const GLYPH_MAX_CODEPOINT: u32 = 0xFFFF;

/// Memory cache budget when none is configured (50 MB).
pub const DEFAULT_CACHE_BYTES: u64 = 50 * 1024 * 1024;

/// Upper bound on simultaneous HTTP requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 20;

/// Deadline applied to every HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Delay applied to rate-limited responses that carry no `Retry-After`.
pub const DEFAULT_RATE_LIMIT_DELAY_MS: u64 = 5_000;

/// Number of off-screen tiles a pyramid keeps around for quick reuse.
pub const DEFAULT_RETAINED_TILES: usize = 64;

/// User agent sent with every HTTP request.
pub const USER_AGENT: &str = concat!("mapflow/", env!("CARGO_PKG_VERSION"));
