//! Thumbnail decoding into RGBA buffers held by the in-memory cache.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::CoreError;
use crate::types::Resolution;

use super::Result;

/// Longest edge kept for decoded thumbnails.
pub const DEFAULT_MAX_EDGE: u32 = 300;

/// Straight-alpha RGBA8888 pixels, row-major from the top-left corner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub dimensions: Resolution,
    pub pixels: Vec<u8>,
}

impl Thumbnail {
    pub fn width(&self) -> u32 {
        self.dimensions.width
    }

    pub fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Bytes held by the pixel buffer; this is what the cache charges for it.
    pub fn resident_bytes(&self) -> usize {
        self.pixels.len()
    }
}

/// Decode `data` and shrink it so neither edge exceeds `max_edge`. `extension` is a format hint;
/// the content is sniffed when it is missing or unknown.
pub fn decode_thumbnail(data: &[u8], extension: Option<&str>, max_edge: u32) -> Result<Thumbnail> {
    if data.is_empty() {
        return Err(CoreError::Decode("empty thumbnail data".into()));
    }

    let format = extension.and_then(|ext| ImageFormat::from_extension(ext.to_ascii_lowercase()));
    let reader = match format {
        Some(format) => ImageReader::with_format(Cursor::new(data), format),
        None => ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|err| CoreError::Decode(format!("guessing format: {err}")))?,
    };

    let image = reader.decode().map_err(|err| CoreError::Decode(err.to_string()))?;
    let image = shrink(image, max_edge.max(1));
    let rgba = image.into_rgba8();

    Ok(Thumbnail {
        dimensions: Resolution { width: rgba.width(), height: rgba.height() },
        pixels: rgba.into_raw(),
    })
}

fn shrink(image: DynamicImage, max_edge: u32) -> DynamicImage {
    if image.width() <= max_edge && image.height() <= max_edge {
        return image;
    }
    // `resize` keeps the aspect ratio within the bounding box.
    image.resize(max_edge, max_edge, FilterType::Triangle)
}
