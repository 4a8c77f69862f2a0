// src/engine/transform.rs
//
// Handle-based transforms. Resize decodes and produces the first handle;
// blur and grayscale consume a handle and return a new one.

use super::handle::ImageHandle;
use super::{catch_native, check_dimensions, decoder, lifecycle, metadata};
use crate::error::{ImageDeliveryError, Result};
use fast_image_resize::{self as fir, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage, RgbaImage};

/// Decode `bytes` and fill exactly `width`x`height`: scale to cover, then
/// crop the overflow evenly from both sides.
pub fn resize_image(bytes: &[u8], width: u32, height: u32) -> Result<ImageHandle> {
    lifecycle::settings()?;
    if bytes.is_empty() {
        return Err(ImageDeliveryError::EmptyInput);
    }
    if width == 0 || height == 0 {
        return Err(ImageDeliveryError::invalid_resize_dimensions(width, height));
    }
    check_dimensions(width, height)?;

    let img = decoder::decode(bytes)?;
    let (src_w, src_h) = (img.width(), img.height());
    if (src_w, src_h) == (width, height) {
        return Ok(ImageHandle::new(img));
    }

    let (resize_w, resize_h) = calc_cover_resize_dimensions(src_w, src_h, width, height);
    if (resize_w, resize_h) == (src_w, src_h) {
        return Ok(ImageHandle::new(crop_to_dimensions(img, width, height)));
    }
    // Past the limits, crop to the target aspect first and scale straight to the box.
    let (img, resize_w, resize_h) = if check_dimensions(resize_w, resize_h).is_ok() {
        (img, resize_w, resize_h)
    } else {
        let (crop_w, crop_h) = calc_aspect_crop_dimensions(src_w, src_h, width, height);
        (crop_to_dimensions(img, crop_w, crop_h), width, height)
    };

    let resized = catch_native(
        "resize",
        || {
            fast_resize_owned(img, resize_w, resize_h).map_err(|reason| {
                ImageDeliveryError::decode_failed(format!(
                    "resize {src_w}x{src_h} -> {resize_w}x{resize_h} failed: {reason}"
                ))
            })
        },
        |m| ImageDeliveryError::decode_failed(m),
    )?;

    Ok(ImageHandle::new(crop_to_dimensions(resized, width, height)))
}

/// Gaussian blur with sigma `amount`.
pub fn blur(handle: ImageHandle, amount: u32) -> Result<ImageHandle> {
    let (image, comment) = handle.into_parts();
    lifecycle::settings()?;
    let image = image.ok_or_else(|| ImageDeliveryError::blur_failed("no image data"))?;
    if amount == 0 {
        return Err(ImageDeliveryError::blur_failed(
            "blur amount must be greater than zero",
        ));
    }

    let blurred = catch_native(
        "blur",
        || Ok(image.blur(amount as f32)),
        |m| ImageDeliveryError::blur_failed(m),
    )?;
    Ok(ImageHandle::with_comment(blurred, comment))
}

/// Convert to single-band luminance, keeping alpha when present.
pub fn grayscale(handle: ImageHandle) -> Result<ImageHandle> {
    let (image, comment) = handle.into_parts();
    lifecycle::settings()?;
    let image = image.ok_or_else(|| ImageDeliveryError::colorspace_failed("no image data"))?;

    let gray = catch_native(
        "grayscale",
        || {
            Ok(if image.color().has_alpha() {
                DynamicImage::ImageLumaA8(image.to_luma_alpha8())
            } else {
                DynamicImage::ImageLuma8(image.to_luma8())
            })
        },
        |m| ImageDeliveryError::colorspace_failed(m),
    )?;
    Ok(ImageHandle::with_comment(gray, comment))
}

/// Attach a UserComment to be written as EXIF on encode. An empty comment clears it.
pub fn set_user_comment(handle: &mut ImageHandle, comment: &str) {
    let comment = metadata::truncate_comment(comment);
    handle.set_comment((!comment.is_empty()).then(|| comment.to_string()));
}

/// Smallest size with the source aspect ratio that covers the target box.
pub(crate) fn calc_cover_resize_dimensions(
    orig_w: u32,
    orig_h: u32,
    target_w: u32,
    target_h: u32,
) -> (u32, u32) {
    if orig_w == 0 || orig_h == 0 {
        return (target_w.max(1), target_h.max(1));
    }
    let (ow, oh, tw, th) = (orig_w as u64, orig_h as u64, target_w as u64, target_h as u64);
    if ow * th >= oh * tw {
        // Source is wider than the target: height binds.
        let w = (ow * th).div_ceil(oh);
        (u32::try_from(w).unwrap_or(u32::MAX).max(target_w), target_h)
    } else {
        let h = (oh * tw).div_ceil(ow);
        (target_w, u32::try_from(h).unwrap_or(u32::MAX).max(target_h))
    }
}

/// Largest region of the source with the target's aspect ratio.
pub(crate) fn calc_aspect_crop_dimensions(
    orig_w: u32,
    orig_h: u32,
    target_w: u32,
    target_h: u32,
) -> (u32, u32) {
    let (ow, oh, tw, th) = (orig_w as u64, orig_h as u64, target_w as u64, target_h as u64);
    if tw == 0 || th == 0 {
        return (orig_w, orig_h);
    }
    if ow * th >= oh * tw {
        ((oh * tw / th).clamp(1, ow) as u32, orig_h)
    } else {
        (orig_w, (ow * th / tw).clamp(1, oh) as u32)
    }
}

/// Centre crop.
pub(crate) fn crop_to_dimensions(img: DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let crop_width = target_w.min(img.width()).max(1);
    let crop_height = target_h.min(img.height()).max(1);
    if crop_width == img.width() && crop_height == img.height() {
        return img;
    }
    let crop_x = (img.width() - crop_width) / 2;
    let crop_y = (img.height() - crop_height) / 2;
    img.crop_imm(crop_x, crop_y, crop_width, crop_height)
}

fn default_resize_options() -> ResizeOptions {
    ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3))
}

/// Resize taking ownership of the pixel buffer.
/// Falls back to the image crate when fast_image_resize rejects the input.
fn fast_resize_owned(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let src_width = img.width();
    let src_height = img.height();
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err("invalid dimensions for resize".to_string());
    }

    let (pixel_type, mut src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageLuma8(gray) => (PixelType::U8, gray.into_raw()),
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other if other.color().has_alpha() => (PixelType::U8x4, other.to_rgba8().into_raw()),
        other => (PixelType::U8x3, other.to_rgb8().into_raw()),
    };

    let primary = fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    )
    .map_err(|e| format!("fir source image error: {e:?}"))
    .and_then(|src| resize_with_fir(src, pixel_type, dst_width, dst_height));

    match primary {
        Ok(img) => Ok(img),
        Err(err) => resize_with_image_crate(
            src_pixels, src_width, src_height, pixel_type, dst_width, dst_height,
        )
        .map_err(|fallback| format!("{err}; image crate fallback failed: {fallback}")),
    }
}

fn resize_with_fir(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);
    let premultiply = pixel_type == PixelType::U8x4;

    let mul_div = MulDiv::default();
    if premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, &default_resize_options())
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    from_raw_pixels(dst_image.into_vec(), dst_width, dst_height, pixel_type)
}

fn resize_with_image_crate(
    src_pixels: Vec<u8>,
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let src = from_raw_pixels(src_pixels, src_width, src_height, pixel_type)?;
    Ok(src.resize_exact(dst_width, dst_height, FilterType::Lanczos3))
}

fn from_raw_pixels(
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    pixel_type: PixelType,
) -> std::result::Result<DynamicImage, String> {
    let img = match pixel_type {
        PixelType::U8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        PixelType::U8x3 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        PixelType::U8x4 => RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
        other => return Err(format!("unsupported pixel type {other:?}")),
    };
    img.ok_or_else(|| format!("pixel buffer does not match {width}x{height}"))
}
