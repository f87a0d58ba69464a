//! Which tiles cover a region

use crate::constants::{MAX_ZOOM, TILE_SIZE};
use crate::core::tile_id::{OverscaledTileId, UnwrappedTileId};
use crate::core::viewport::Viewport;

/// Zoom at which tiles of `tile_size` pixels are drawn at native
/// resolution for a viewport at `zoom`
pub fn covering_zoom(zoom: f64, tile_size: u32) -> f64 {
    zoom + (TILE_SIZE as f64 / tile_size.max(1) as f64).log2()
}

/// Tiles at zoom `z` intersecting `bounds`, given in normalized world
/// units as `(min_x, min_y, max_x, max_y)`. Columns outside `[0, 1)` map to
/// neighbouring world copies. Sorted by distance from the center of the
/// bounds so the middle of the view loads first.
pub fn tile_cover_bounds(z: u8, bounds: (f64, f64, f64, f64)) -> Vec<UnwrappedTileId> {
    let (min_x, min_y, max_x, max_y) = bounds;
    let dim = (1u64 << z) as f64;

    let first_x = (min_x * dim).floor() as i64;
    let last_x = ((max_x * dim).ceil() as i64 - 1).max(first_x);
    let first_y = ((min_y * dim).floor() as i64).clamp(0, dim as i64 - 1);
    let last_y = ((max_y * dim).ceil() as i64 - 1).clamp(first_y, dim as i64 - 1);

    let center_x = (min_x + max_x) / 2.0 * dim;
    let center_y = (min_y + max_y) / 2.0 * dim;

    let mut tiles = Vec::new();
    for x in first_x..=last_x {
        for y in first_y..=last_y {
            if let Ok(id) = UnwrappedTileId::new(z, x, y as u32) {
                tiles.push(id);
            }
        }
    }
    let distance = |id: &UnwrappedTileId| {
        let dx = id.x() as f64 + 0.5 - center_x;
        let dy = id.canonical.y as f64 + 0.5 - center_y;
        dx * dx + dy * dy
    };
    tiles.sort_by(|a, b| distance(a).total_cmp(&distance(b)).then_with(|| a.cmp(b)));
    tiles
}

/// Ideal tiles for a source with the given tile size and zoom range.
///
/// Nothing is shown below the source's minimum zoom. Above its maximum
/// zoom the deepest data tiles are overscaled.
pub fn tile_cover(
    viewport: &Viewport,
    tile_size: u32,
    min_zoom: u8,
    max_zoom: u8,
) -> Vec<OverscaledTileId> {
    let zoom = covering_zoom(viewport.zoom, tile_size).floor();
    if zoom < min_zoom as f64 {
        return Vec::new();
    }
    let overscaled_z = zoom.min(MAX_ZOOM as f64) as u8;
    let data_z = overscaled_z.min(max_zoom);
    tile_cover_bounds(data_z, viewport.world_bounds(TILE_SIZE))
        .into_iter()
        .map(|id| id.overscale_to(overscaled_z))
        .collect()
}
