use crate::core::util::wrap;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Web Mercator latitude limit
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Represents a geographical coordinate with latitude and longitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    /// Creates a new LatLng coordinate
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Validates that the coordinates are within valid ranges
    pub fn is_valid(&self) -> bool {
        self.lat >= -90.0 && self.lat <= 90.0 && self.lng >= -180.0 && self.lng <= 180.0
    }

    /// Wraps longitude to [-180, 180)
    pub fn wrap_lng(lng: f64) -> f64 {
        wrap(lng, -180.0, 180.0)
    }

    /// Clamps latitude to the range Web Mercator can represent
    pub fn clamp_lat(lat: f64) -> f64 {
        lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
    }

    /// Projects into normalized world space: `x` and `y` in `[0, 1]`, origin
    /// at the north-west corner. Longitudes outside ±180 land outside `[0, 1]`
    /// on the `x` axis so viewports can span the antimeridian.
    pub fn to_world(&self) -> (f64, f64) {
        let lat_rad = Self::clamp_lat(self.lat).to_radians();
        let x = (self.lng + 180.0) / 360.0;
        let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0;
        (x, y)
    }

    /// Inverse of [`LatLng::to_world`]
    pub fn from_world(x: f64, y: f64) -> Self {
        let lng = x * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * y)).sinh().atan().to_degrees();
        Self::new(lat, lng)
    }
}

/// Geographical bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLngBounds {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl LatLngBounds {
    pub fn new(south_west: LatLng, north_east: LatLng) -> Self {
        Self {
            south_west,
            north_east,
        }
    }

    pub fn from_coords(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self::new(LatLng::new(south, west), LatLng::new(north, east))
    }

    pub fn contains(&self, point: &LatLng) -> bool {
        point.lat >= self.south_west.lat
            && point.lat <= self.north_east.lat
            && point.lng >= self.south_west.lng
            && point.lng <= self.north_east.lng
    }

    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.south_west.lat + self.north_east.lat) / 2.0,
            (self.south_west.lng + self.north_east.lng) / 2.0,
        )
    }

    /// World-space rectangle as `(min_x, min_y, max_x, max_y)`
    pub fn to_world(&self) -> (f64, f64, f64, f64) {
        let (min_x, max_y) = self.south_west.to_world();
        let (max_x, min_y) = self.north_east.to_world();
        (min_x, min_y, max_x, max_y)
    }
}
