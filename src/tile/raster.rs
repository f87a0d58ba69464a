//! Raster tile decoding

use crate::tile::error::TileError;
use std::sync::Arc;

/// Decoded RGBA8 pixels of a raster tile
#[derive(Debug, Clone, PartialEq)]
pub struct RasterData {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<Vec<u8>>,
}

impl RasterData {
    /// Decodes PNG or JPEG bytes; runs on worker threads
    #[cfg(feature = "raster")]
    pub fn decode(data: &[u8]) -> Result<Self, TileError> {
        let image = image::load_from_memory(data).map_err(|err| TileError::Parse(err.to_string()))?;
        let rgba = image.to_rgba8();
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            pixels: Arc::new(rgba.into_raw()),
        })
    }

    #[cfg(not(feature = "raster"))]
    pub fn decode(_data: &[u8]) -> Result<Self, TileError> {
        Err(TileError::Parse(
            "raster decoding requires the `raster` feature".into(),
        ))
    }
}

#[cfg(all(test, feature = "raster"))]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_decode_png() {
        let mut encoded = Vec::new();
        let source = image::RgbaImage::from_pixel(4, 2, image::Rgba([10, 20, 30, 255]));
        image::DynamicImage::ImageRgba8(source)
            .write_to(&mut Cursor::new(&mut encoded), image::ImageOutputFormat::Png)
            .unwrap();

        let raster = RasterData::decode(&encoded).unwrap();
        assert_eq!((raster.width, raster.height), (4, 2));
        assert_eq!(&raster.pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(
            RasterData::decode(b"definitely not a png"),
            Err(TileError::Parse(_))
        ));
    }
}
