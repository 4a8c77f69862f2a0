// src/engine/decoder.rs
//
// Decoders: JPEG (mozjpeg), WebP (libwebp), PNG (image crate).
// Every path checks dimensions against the engine limits before the pixel
// buffer is allocated.

use super::{catch_native, check_dimensions};
use crate::error::{ImageDeliveryError, Result};
use image::{DynamicImage, ImageFormat, ImageReader, RgbImage};
use mozjpeg::Decompress;
use std::io::Cursor;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};

#[cfg(test)]
thread_local! {
    static DECODE_CALLS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Decode calls made on the current thread.
#[cfg(test)]
pub(crate) fn decode_calls() -> usize {
    DECODE_CALLS.with(|n| n.get())
}

/// Detect the container from magic bytes and decode it.
pub(crate) fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    #[cfg(test)]
    DECODE_CALLS.with(|n| n.set(n.get() + 1));

    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => decode_jpeg_mozjpeg(bytes),
        Ok(ImageFormat::WebP) => decode_webp_libwebp(bytes),
        Ok(ImageFormat::Png) => decode_png(bytes),
        Ok(other) => Err(ImageDeliveryError::unsupported_format(
            other.extensions_str().first().copied().unwrap_or("unknown"),
        )),
        Err(_) => Err(ImageDeliveryError::decode_failed(
            "unrecognized image format",
        )),
    }
}

/// Decode JPEG using mozjpeg (libjpeg-turbo).
fn decode_jpeg_mozjpeg(data: &[u8]) -> Result<DynamicImage> {
    catch_native(
        "decode:jpeg",
        || {
            if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
                return Err(ImageDeliveryError::decode_failed(
                    "jpeg: missing EOI marker",
                ));
            }

            let decompress = Decompress::new_mem(data).map_err(|e| {
                ImageDeliveryError::decode_failed(format!("jpeg: decompress init failed: {e}"))
            })?;
            let mut decompress = decompress.rgb().map_err(|e| {
                ImageDeliveryError::decode_failed(format!("jpeg: rgb conversion failed: {e}"))
            })?;

            let width = u32::try_from(decompress.width())
                .map_err(|_| ImageDeliveryError::decode_failed("jpeg: width overflow"))?;
            let height = u32::try_from(decompress.height())
                .map_err(|_| ImageDeliveryError::decode_failed("jpeg: height overflow"))?;
            check_dimensions(width, height)?;

            let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
                ImageDeliveryError::decode_failed(format!("jpeg: failed to read scanlines: {e}"))
            })?;
            let flat: Vec<u8> = pixels.into_iter().flatten().collect();

            RgbImage::from_raw(width, height, flat)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| ImageDeliveryError::decode_failed("jpeg: truncated pixel data"))
        },
        |m| ImageDeliveryError::decode_failed(m),
    )
}

/// Decode WebP using libwebp. Animated files fall back to the image crate.
fn decode_webp_libwebp(data: &[u8]) -> Result<DynamicImage> {
    catch_native(
        "decode:webp",
        || {
            let features = BitstreamFeatures::new(data).ok_or_else(|| {
                ImageDeliveryError::decode_failed("webp: failed to read bitstream features")
            })?;
            check_dimensions(features.width(), features.height())?;

            if features.has_animation() {
                return image::load_from_memory_with_format(data, ImageFormat::WebP).map_err(
                    |e| ImageDeliveryError::decode_failed(format!("webp (animated): {e}")),
                );
            }

            let decoded = WebPDecoder::new(data)
                .decode()
                .ok_or_else(|| ImageDeliveryError::decode_failed("webp: decode failed"))?;
            Ok(decoded.to_image())
        },
        |m| ImageDeliveryError::decode_failed(m),
    )
}

fn decode_png(data: &[u8]) -> Result<DynamicImage> {
    catch_native(
        "decode:png",
        || {
            let (width, height) = ImageReader::with_format(Cursor::new(data), ImageFormat::Png)
                .into_dimensions()
                .map_err(|e| ImageDeliveryError::decode_failed(format!("png: {e}")))?;
            check_dimensions(width, height)?;

            image::load_from_memory_with_format(data, ImageFormat::Png)
                .map_err(|e| ImageDeliveryError::decode_failed(format!("png: {e}")))
        },
        |m| ImageDeliveryError::decode_failed(m),
    )
}
