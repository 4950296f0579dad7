use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::DynamicImage;
use anyhow::{Result, Context};

use crate::error::CandidateError;
use crate::media::mimetype::{self, RasterFormat};

const JPEG_QUALITY: u8 = 95;

pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: RasterFormat,
    pub payload_len: usize,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Canonical bytes as they will be written to disk.
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

pub fn decode(bytes: &[u8]) -> Result<DecodedImage, CandidateError> {
    let format = mimetype::detect_raster(bytes).ok_or_else(|| {
        CandidateError::Decode(format!("unsupported format {}", mimetype::detect_mimetype(bytes)))
    })?;

    // GIFs decode to their first frame.
    let image = image::load_from_memory_with_format(bytes, format.image_format())
        .map_err(|e| CandidateError::Decode(e.to_string()))?;

    Ok(DecodedImage { image, format, payload_len: bytes.len() })
}

/// Re-encodes decoded pixels with fixed encoder settings, so payloads that
/// differ only upstream (metadata, compression level, container) collapse
/// to the same saved bytes and therefore the same content hash.
pub fn normalize(decoded: &DecodedImage) -> Result<NormalizedImage> {
    let mut bytes = Vec::new();
    match decoded.format {
        RasterFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(decoded.image.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY))
                .context("Failed to encode JPEG")?;
            Ok(NormalizedImage { bytes, extension: "jpg" })
        }
        RasterFormat::Png | RasterFormat::Gif | RasterFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(decoded.image.to_rgba8());
            let encoder = PngEncoder::new_with_quality(&mut bytes, CompressionType::Default, FilterType::Adaptive);
            rgba.write_with_encoder(encoder).context("Failed to encode PNG")?;
            Ok(NormalizedImage { bytes, extension: "png" })
        }
    }
}
