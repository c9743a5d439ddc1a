use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;

use pictor_core::models::OutputFormat;

use crate::error::GenerateError;
use crate::quality::{adjust_cache_quality, estimate_jpeg_quality};

/// What to produce from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSpec {
    /// Bounding box; the artifact keeps the source aspect ratio.
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub quality: u8,
    /// Lower `quality` for sources that are already compressed harder.
    pub adjust_quality: bool,
}

/// Encoded artifact held in memory until it is written.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    /// Quality actually used for encoding.
    pub quality: u8,
}

impl GeneratedArtifact {
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Pick resize filter based on the downscale ratio.
fn select_filter(orig_width: u32, orig_height: u32, new_width: u32, new_height: u32) -> FilterType {
    let width_ratio = orig_width as f32 / new_width.max(1) as f32;
    let height_ratio = orig_height as f32 / new_height.max(1) as f32;
    let max_ratio = width_ratio.max(height_ratio);

    if max_ratio > 2.0 {
        FilterType::Triangle
    } else if max_ratio > 1.5 {
        FilterType::CatmullRom
    } else {
        FilterType::Lanczos3
    }
}

/// Fit `img` inside `width`x`height`. Images already inside the box are kept.
fn fit_within(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (orig_width, orig_height) = img.dimensions();
    if orig_width <= width && orig_height <= height {
        return img;
    }
    let filter = select_filter(orig_width, orig_height, width, height);
    img.resize(width, height, filter)
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, GenerateError> {
    let mut buffer = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
                .encode_image(&rgb)
                .map_err(|e| GenerateError::Encode(e.to_string()))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
                .map_err(|e| GenerateError::Encode(e.to_string()))?;
        }
        OutputFormat::WebP => {
            let rgba = img.to_rgba8();
            let (width, height) = rgba.dimensions();
            let encoded = webp::Encoder::from_rgba(&rgba, width, height).encode(f32::from(quality));
            buffer.extend_from_slice(&encoded);
        }
    }
    Ok(buffer)
}

/// Decode `data`, fit it into the requested box and encode it.
pub fn render(data: &[u8], spec: &RenderSpec) -> Result<GeneratedArtifact, GenerateError> {
    if spec.width == 0 || spec.height == 0 {
        return Err(GenerateError::InvalidDimensions {
            width: spec.width,
            height: spec.height,
        });
    }

    let quality = if spec.adjust_quality {
        adjust_cache_quality(estimate_jpeg_quality(data), spec.quality)
    } else {
        spec.quality
    };

    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| GenerateError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| GenerateError::Decode(e.to_string()))?;

    let fitted = fit_within(img, spec.width, spec.height);
    let (width, height) = fitted.dimensions();
    let encoded = encode(&fitted, spec.format, quality)?;

    Ok(GeneratedArtifact {
        data: Bytes::from(encoded),
        width,
        height,
        format: spec.format,
        quality,
    })
}

/// Dimensions from the image header, without decoding pixels.
pub fn probe_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
