//! Image validation for device captures
//!
//! Only the container header is inspected: JPEG frame headers and the PNG
//! `IHDR` chunk carry the dimensions, which is all the size gate needs.

use crate::config::CaptureConfig;
use crate::error::{Error, Result};

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Container formats accepted from devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

/// Facts read from an accepted image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub size: usize,
}

/// Size and resolution ceilings for a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: usize,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 200 * 1024,
            max_width: 640,
            max_height: 480,
        }
    }
}

impl From<&CaptureConfig> for ImageLimits {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            max_bytes: config.max_image_bytes,
            max_width: config.max_width,
            max_height: config.max_height,
        }
    }
}

/// Read format and dimensions from an image header
#[must_use]
pub fn image_dimensions(data: &[u8]) -> Option<(ImageFormat, u32, u32)> {
    if data.starts_with(PNG_SIGNATURE) {
        return png_dimensions(data).map(|(w, h)| (ImageFormat::Png, w, h));
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        return jpeg_dimensions(data).map(|(w, h)| (ImageFormat::Jpeg, w, h));
    }
    None
}

fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    // signature, chunk length, "IHDR", width, height
    if data.get(12..16)? != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(data.get(16..20)?.try_into().ok()?);
    let height = u32::from_be_bytes(data.get(20..24)?.try_into().ok()?);
    Some((width, height))
}

fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;

    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        // Markers may be preceded by any number of fill bytes
        while *data.get(pos)? == 0xFF {
            pos += 1;
        }
        let marker = *data.get(pos)?;
        pos += 1;

        match marker {
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => continue,
            // End of image or start of scan before any frame header
            0xD9 | 0xDA => return None,
            _ => {}
        }

        let length = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
        if length < 2 {
            return None;
        }

        // SOF0..SOF15 except DHT (C4), JPG (C8) and DAC (CC)
        if matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let height = u16::from_be_bytes([*data.get(pos + 3)?, *data.get(pos + 4)?]);
            let width = u16::from_be_bytes([*data.get(pos + 5)?, *data.get(pos + 6)?]);
            return Some((u32::from(width), u32::from(height)));
        }

        pos += length;
    }
}

/// Check an image against the capture limits
///
/// # Errors
///
/// Returns [`Error::Capture`] when the image is empty, too large, not a
/// JPEG or PNG with a readable header, or exceeds the resolution limits.
pub fn validate_image(data: &[u8], limits: &ImageLimits) -> Result<ImageInfo> {
    if data.is_empty() {
        return Err(Error::Capture("image is empty".to_string()));
    }
    if data.len() > limits.max_bytes {
        return Err(Error::Capture(format!(
            "image is {} bytes, limit is {}",
            data.len(),
            limits.max_bytes
        )));
    }

    let (format, width, height) = image_dimensions(data)
        .ok_or_else(|| Error::Capture("unrecognized image header".to_string()))?;

    if width == 0 || height == 0 {
        return Err(Error::Capture(format!("invalid dimensions {width}x{height}")));
    }
    if width > limits.max_width || height > limits.max_height {
        return Err(Error::Capture(format!(
            "resolution {width}x{height} exceeds {}x{}",
            limits.max_width, limits.max_height
        )));
    }

    Ok(ImageInfo {
        format,
        width,
        height,
        size: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::synthetic_jpeg;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut data = PNG_SIGNATURE.to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 2, 0, 0, 0]);
        data
    }

    #[test]
    fn reads_jpeg_frame_header() {
        let jpeg = synthetic_jpeg(320, 240, 50 * 1024);
        assert_eq!(jpeg.len(), 50 * 1024);
        assert_eq!(image_dimensions(&jpeg), Some((ImageFormat::Jpeg, 320, 240)));
    }

    #[test]
    fn reads_png_header() {
        assert_eq!(image_dimensions(&png(640, 480)), Some((ImageFormat::Png, 640, 480)));
    }

    #[test]
    fn accepts_image_within_limits() {
        let info = validate_image(&synthetic_jpeg(320, 240, 50 * 1024), &ImageLimits::default())
            .unwrap();
        assert_eq!(info.format, ImageFormat::Jpeg);
        assert_eq!((info.width, info.height), (320, 240));
    }

    #[test]
    fn boundary_resolution_is_accepted() {
        assert!(validate_image(&png(640, 480), &ImageLimits::default()).is_ok());
    }

    #[test]
    fn rejects_oversized_payload() {
        let jpeg = synthetic_jpeg(320, 240, 200 * 1024 + 1);
        let err = validate_image(&jpeg, &ImageLimits::default()).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn rejects_high_resolution() {
        assert!(validate_image(&png(1280, 720), &ImageLimits::default()).is_err());
        assert!(validate_image(&synthetic_jpeg(641, 480, 4096), &ImageLimits::default()).is_err());
    }

    #[test]
    fn rejects_garbage_and_empty() {
        let limits = ImageLimits::default();
        assert!(validate_image(b"", &limits).is_err());
        assert!(validate_image(b"not an image at all", &limits).is_err());
        // SOI followed by end of image, no frame header
        assert!(validate_image(&[0xFF, 0xD8, 0xFF, 0xD9], &limits).is_err());
        // Truncated mid-segment
        assert!(validate_image(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00], &limits).is_err());
    }
}
