use image::ImageFormat;
use infer;

/// Raster formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl RasterFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" => Some(RasterFormat::Jpeg),
            "image/png" => Some(RasterFormat::Png),
            "image/gif" => Some(RasterFormat::Gif),
            "image/webp" => Some(RasterFormat::WebP),
            _ => None,
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            RasterFormat::Png => ImageFormat::Png,
            RasterFormat::Gif => ImageFormat::Gif,
            RasterFormat::WebP => ImageFormat::WebP,
        }
    }
}

pub fn detect_mimetype(bytes: &[u8]) -> String {
    match infer::get(bytes) {
        Some(k) => k.mime_type().to_string(),
        None => "application/octet-stream".to_string(),
    }
}

/// Sniffs the payload itself; servers lie about Content-Type often enough.
pub fn detect_raster(bytes: &[u8]) -> Option<RasterFormat> {
    RasterFormat::from_mime(&detect_mimetype(bytes))
}
