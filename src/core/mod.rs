pub mod config;
pub mod constants;
pub mod geo;
pub mod tile_id;
pub mod util;
pub mod viewport;

pub use config::{PipelineConfig, PipelineProfile};
pub use geo::LatLng;
pub use tile_id::{CanonicalTileId, OverscaledTileId, UnwrappedTileId};
pub use viewport::Viewport;
