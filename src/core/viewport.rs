use crate::core::constants::MAX_ZOOM;
use crate::core::geo::{LatLng, LatLngBounds};
use serde::{Deserialize, Serialize};

/// The current view of the map: center, zoom, and screen dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// The center of the map view in geographical coordinates
    pub center: LatLng,
    /// The current zoom level
    pub zoom: f64,
    /// The size of the viewport in pixels
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(center: LatLng, zoom: f64, width: u32, height: u32) -> Self {
        Self {
            center,
            zoom: zoom.clamp(0.0, MAX_ZOOM as f64),
            width,
            height,
        }
    }

    /// Builds a viewport that shows `bounds` at `zoom`, sized so the whole
    /// rectangle is visible.
    pub fn fit(bounds: &LatLngBounds, zoom: f64, tile_size: u32) -> Self {
        let zoom = zoom.clamp(0.0, MAX_ZOOM as f64);
        let (min_x, min_y, max_x, max_y) = bounds.to_world();
        let scale = tile_size as f64 * 2f64.powf(zoom);
        let width = ((max_x - min_x) * scale).ceil().max(1.0) as u32;
        let height = ((max_y - min_y) * scale).ceil().max(1.0) as u32;
        let center = LatLng::from_world((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);
        Self::new(center, zoom, width, height)
    }

    pub fn set_center(&mut self, center: LatLng) {
        self.center = center;
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom.clamp(0.0, MAX_ZOOM as f64);
    }

    /// Integer zoom level used to pick tiles
    pub fn tile_zoom(&self) -> u8 {
        self.zoom.floor().clamp(0.0, MAX_ZOOM as f64) as u8
    }

    /// Visible rectangle in normalized world units as
    /// `(min_x, min_y, max_x, max_y)`. The `x` range may extend past `[0, 1]`
    /// when the view crosses the antimeridian; `y` is clamped.
    pub fn world_bounds(&self, tile_size: u32) -> (f64, f64, f64, f64) {
        let (cx, cy) = self.center.to_world();
        let scale = tile_size as f64 * 2f64.powf(self.zoom);
        let half_w = self.width as f64 / 2.0 / scale;
        let half_h = self.height as f64 / 2.0 / scale;
        (
            cx - half_w,
            (cy - half_h).max(0.0),
            cx + half_w,
            (cy + half_h).min(1.0),
        )
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(LatLng::new(0.0, 0.0), 0.0, 512, 512)
    }
}
