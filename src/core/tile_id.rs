use crate::core::constants::MAX_TILE_ZOOM;
use crate::core::util::wrap_tile_x;
use crate::{MapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tile in the slippy map pyramid: `0 <= x, y < 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalTileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl CanonicalTileId {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
        let id = Self { z, x, y };
        if id.is_valid() {
            Ok(id)
        } else {
            Err(MapError::InvalidTile(format!("{}/{}/{}", z, x, y)))
        }
    }

    pub const fn root() -> Self {
        Self { z: 0, x: 0, y: 0 }
    }

    /// Checks the coordinates are addressable at this zoom level
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_TILE_ZOOM {
            return false;
        }
        let dim = 1u64 << self.z;
        (self.x as u64) < dim && (self.y as u64) < dim
    }

    /// Number of tiles along one axis at this zoom
    pub fn dim(&self) -> u32 {
        1u32 << self.z
    }

    /// Gets the parent tile at a lower zoom level
    pub fn parent(&self) -> Option<Self> {
        if self.z == 0 {
            None
        } else {
            Some(Self {
                z: self.z - 1,
                x: self.x / 2,
                y: self.y / 2,
            })
        }
    }

    /// Gets the four child tiles one zoom level deeper
    pub fn children(&self) -> Option<[Self; 4]> {
        if self.z >= MAX_TILE_ZOOM {
            return None;
        }
        let (z, x, y) = (self.z + 1, self.x * 2, self.y * 2);
        Some([
            Self { z, x, y },
            Self { z, x: x + 1, y },
            Self { z, x, y: y + 1 },
            Self { z, x: x + 1, y: y + 1 },
        ])
    }

    /// Ancestor at `z`, or the north-west descendant when `z` is deeper
    pub fn scaled_to(&self, z: u8) -> Self {
        let z = z.min(MAX_TILE_ZOOM);
        if z <= self.z {
            let shift = self.z - z;
            Self {
                z,
                x: self.x >> shift,
                y: self.y >> shift,
            }
        } else {
            let shift = z - self.z;
            Self {
                z,
                x: self.x << shift,
                y: self.y << shift,
            }
        }
    }

    pub fn is_child_of(&self, parent: &Self) -> bool {
        parent.z < self.z && self.scaled_to(parent.z) == *parent
    }

    /// Bing-style quadkey, empty at zoom 0
    pub fn quadkey(&self) -> String {
        let mut key = String::with_capacity(self.z as usize);
        for i in (1..=self.z).rev() {
            let mask = 1u32 << (i - 1);
            let mut digit = b'0';
            if self.x & mask != 0 {
                digit += 1;
            }
            if self.y & mask != 0 {
                digit += 2;
            }
            key.push(digit as char);
        }
        key
    }

    /// Row index counted from the south edge, as TMS sources address tiles
    pub fn tms_y(&self) -> u32 {
        self.dim() - 1 - self.y
    }
}

impl fmt::Display for CanonicalTileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A canonical tile placed in a specific copy of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnwrappedTileId {
    pub wrap: i16,
    pub canonical: CanonicalTileId,
}

impl UnwrappedTileId {
    /// Builds an id from a column that may lie outside `[0, 2^z)`
    pub fn new(z: u8, x: i64, y: u32) -> Result<Self> {
        if z > MAX_TILE_ZOOM {
            return Err(MapError::InvalidTile(format!("zoom {} out of range", z)));
        }
        let (x, wrap) = wrap_tile_x(x, z);
        Ok(Self {
            wrap,
            canonical: CanonicalTileId::new(z, x, y)?,
        })
    }

    /// Column in the unwrapped world, counting previous worlds
    pub fn x(&self) -> i64 {
        self.canonical.x as i64 + self.wrap as i64 * self.canonical.dim() as i64
    }

    pub fn overscale_to(&self, overscaled_z: u8) -> OverscaledTileId {
        OverscaledTileId {
            overscaled_z: overscaled_z.max(self.canonical.z),
            wrap: self.wrap,
            canonical: self.canonical,
        }
    }
}

/// A tile as rendered: the data tile `canonical` drawn at `overscaled_z`.
///
/// When the viewport zoom exceeds the source's maximum zoom, the deepest
/// available data tile is stretched over the requested area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverscaledTileId {
    pub overscaled_z: u8,
    pub wrap: i16,
    pub canonical: CanonicalTileId,
}

impl OverscaledTileId {
    pub fn new(overscaled_z: u8, wrap: i16, canonical: CanonicalTileId) -> Result<Self> {
        if overscaled_z < canonical.z {
            return Err(MapError::InvalidTile(format!(
                "overscaled zoom {} below canonical {}",
                overscaled_z, canonical
            )));
        }
        Ok(Self {
            overscaled_z,
            wrap,
            canonical,
        })
    }

    pub fn from_canonical(canonical: CanonicalTileId) -> Self {
        Self {
            overscaled_z: canonical.z,
            wrap: 0,
            canonical,
        }
    }

    pub fn overscale_factor(&self) -> u32 {
        1u32 << (self.overscaled_z - self.canonical.z).min(31)
    }

    pub fn is_overscaled(&self) -> bool {
        self.overscaled_z > self.canonical.z
    }

    /// The same tile viewed at zoom `z`, keeping the data tile when `z` is
    /// still at or above it.
    pub fn scaled_to(&self, z: u8) -> Self {
        let canonical = if z >= self.canonical.z {
            self.canonical
        } else {
            self.canonical.scaled_to(z)
        };
        Self {
            overscaled_z: z,
            wrap: self.wrap,
            canonical,
        }
    }

    /// One zoom level up; overscaled tiles keep their data tile until the
    /// overscaling runs out.
    pub fn parent(&self) -> Option<Self> {
        if self.overscaled_z == 0 {
            None
        } else {
            Some(self.scaled_to(self.overscaled_z - 1))
        }
    }

    pub fn is_child_of(&self, parent: &Self) -> bool {
        if self.wrap != parent.wrap || parent.overscaled_z >= self.overscaled_z {
            return false;
        }
        parent.canonical == self.canonical || self.canonical.is_child_of(&parent.canonical)
    }

    pub fn to_unwrapped(&self) -> UnwrappedTileId {
        UnwrappedTileId {
            wrap: self.wrap,
            canonical: self.canonical,
        }
    }
}

impl fmt::Display for OverscaledTileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wrap == 0 && !self.is_overscaled() {
            write!(f, "{}", self.canonical)
        } else {
            write!(
                f,
                "{} (z{} wrap {})",
                self.canonical, self.overscaled_z, self.wrap
            )
        }
    }
}
