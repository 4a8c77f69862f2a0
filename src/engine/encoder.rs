// src/engine/encoder.rs
//
// Encoders: JPEG (mozjpeg) and WebP (libwebp), followed by EXIF embedding
// through img-parts when the handle carries a user comment.

use super::handle::ImageHandle;
use super::{catch_native, lifecycle, metadata, MAX_DIMENSION};
use crate::error::{ImageDeliveryError, Result};
use crate::task::OutputFormat;
use bytes::Bytes;
use image::{DynamicImage, RgbImage};
use img_parts::{jpeg::Jpeg, webp::WebP, ImageEXIF};
use mozjpeg::{ColorSpace, Compress};
use std::borrow::Cow;

/// Serialize `handle` to `format`. The handle is consumed on every path.
pub fn encode(handle: ImageHandle, format: OutputFormat) -> Result<Bytes> {
    let (image, comment) = handle.into_parts();
    let settings = lifecycle::settings()?;
    let fmt = format.as_str();
    let image = image.ok_or_else(|| ImageDeliveryError::encode_failed(fmt, "no image data"))?;

    let encoded = catch_native(
        "encode",
        || match format {
            OutputFormat::Jpeg => encode_jpeg(&image, settings.jpeg_quality),
            OutputFormat::WebP => encode_webp(&image, settings.webp_quality),
        },
        |m| ImageDeliveryError::encode_failed(fmt, m),
    )?;

    let encoded = match comment.as_deref() {
        Some(text) if !text.is_empty() => {
            embed_exif(encoded, format, metadata::user_comment_exif(text)?)?
        }
        _ => encoded,
    };
    Ok(Bytes::from(encoded))
}

/// Progressive JPEG with optimized Huffman tables.
/// Single-band images stay single-band; everything else goes through YCbCr 4:2:0.
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return Err(ImageDeliveryError::encode_failed("jpeg", "no image data"));
    }
    if w > MAX_DIMENSION || h > MAX_DIMENSION {
        return Err(ImageDeliveryError::dimension_exceeds_limit(
            w.max(h),
            MAX_DIMENSION,
        ));
    }

    match img {
        DynamicImage::ImageLuma8(gray) => compress_jpeg(gray.as_raw(), w, h, 1, quality),
        DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => {
            compress_jpeg(img.to_luma8().as_raw(), w, h, 1, quality)
        }
        _ => {
            let rgb: Cow<'_, RgbImage> = match img {
                DynamicImage::ImageRgb8(rgb) => Cow::Borrowed(rgb),
                _ => Cow::Owned(img.to_rgb8()),
            };
            compress_jpeg(rgb.as_raw(), w, h, 3, quality)
        }
    }
}

fn compress_jpeg(pixels: &[u8], w: u32, h: u32, components: usize, quality: u8) -> Result<Vec<u8>> {
    let stride = w as usize * components;
    if pixels.len() != stride * h as usize {
        return Err(ImageDeliveryError::encode_failed(
            "jpeg",
            "pixel buffer does not match image size",
        ));
    }

    let mut comp = if components == 1 {
        Compress::new(ColorSpace::JCS_GRAYSCALE)
    } else {
        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp
    };
    comp.set_size(w as usize, h as usize);
    comp.set_quality(quality.min(100) as f32);
    comp.set_progressive_mode();
    comp.set_optimize_coding(true);

    let mut output = Vec::with_capacity((stride * h as usize / 10).max(4096));
    let mut writer = comp.start_compress(&mut output).map_err(|e| {
        ImageDeliveryError::encode_failed("jpeg", format!("failed to start compress: {e}"))
    })?;
    for row in pixels.chunks(stride) {
        writer.write_scanlines(row).map_err(|e| {
            ImageDeliveryError::encode_failed("jpeg", format!("failed to write scanlines: {e}"))
        })?;
    }
    writer
        .finish()
        .map_err(|e| ImageDeliveryError::encode_failed("jpeg", format!("failed to finish: {e}")))?;

    Ok(output)
}

/// Lossy WebP. Alpha is dropped; codec threading stays off.
fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb: Cow<'_, RgbImage> = match img {
        DynamicImage::ImageRgb8(rgb) => Cow::Borrowed(rgb),
        _ => Cow::Owned(img.to_rgb8()),
    };
    let (w, h) = rgb.dimensions();
    if w == 0 || h == 0 {
        return Err(ImageDeliveryError::encode_failed("webp", "no image data"));
    }
    let encoder = webp::Encoder::from_rgb(&rgb, w, h);

    let mut config = webp::WebPConfig::new()
        .map_err(|_| ImageDeliveryError::encode_failed("webp", "failed to create WebPConfig"))?;
    config.quality = quality.min(100) as f32;
    config.method = 4;
    config.thread_level = 0;

    let mem = encoder
        .encode_advanced(&config)
        .map_err(|e| ImageDeliveryError::encode_failed("webp", format!("{e:?}")))?;
    Ok(mem.to_vec())
}

fn embed_exif(encoded: Vec<u8>, format: OutputFormat, exif: Vec<u8>) -> Result<Vec<u8>> {
    let fmt = format.as_str();
    let exif = Some(img_parts::Bytes::from(exif));
    let mut output = Vec::with_capacity(encoded.len() + 128);

    let written = match format {
        OutputFormat::Jpeg => {
            let mut jpeg = Jpeg::from_bytes(img_parts::Bytes::from(encoded)).map_err(|e| {
                ImageDeliveryError::encode_failed(fmt, format!("failed to reparse output: {e}"))
            })?;
            jpeg.set_exif(exif);
            jpeg.encoder().write_to(&mut output)
        }
        OutputFormat::WebP => {
            let mut webp = WebP::from_bytes(img_parts::Bytes::from(encoded)).map_err(|e| {
                ImageDeliveryError::encode_failed(fmt, format!("failed to reparse output: {e}"))
            })?;
            webp.set_exif(exif);
            webp.encoder().write_to(&mut output)
        }
    };
    written.map_err(|e| {
        ImageDeliveryError::encode_failed(fmt, format!("failed to write EXIF: {e}"))
    })?;
    Ok(output)
}
