// src/engine.rs
//
// Native image engine. Owns the codec lifecycle and the handle-based
// operations the processor chains together:
//
//   resize_image(bytes) -> [blur] -> [grayscale] -> set_user_comment -> encode
//
// Every transform consumes its input handle, so each intermediate image is
// released exactly once whether the step succeeds or fails.

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Larger images are rejected before their pixels are decoded.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA.
pub const MAX_PIXELS: u64 = 100_000_000;

mod decoder;
mod encoder;
mod handle;
mod lifecycle;
mod metadata;
mod transform;

pub use encoder::encode;
pub use handle::ImageHandle;
pub use lifecycle::{initialize, is_initialized, shutdown, EngineSettings};
pub use metadata::{user_comment_exif, MAX_COMMENT_BYTES};
pub use transform::{blur, grayscale, resize_image, set_user_comment};

#[cfg(test)]
pub(crate) use decoder::decode_calls;
#[cfg(test)]
pub(crate) use handle::live_handles;

use crate::error::{panic_message, ImageDeliveryError, Result};
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Run native codec work, turning a panic into the stage's own error.
pub(crate) fn catch_native<T, F, E>(stage: &'static str, f: F, on_panic: E) -> Result<T>
where
    F: FnOnce() -> Result<T>,
    E: FnOnce(String) -> ImageDeliveryError,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(stage, %message, "native codec panicked");
            Err(on_panic(format!("{stage} panicked: {message}")))
        }
    }
}

/// Check if image dimensions are within safe limits.
pub(crate) fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ImageDeliveryError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(ImageDeliveryError::pixel_count_exceeds_limit(
            pixels, MAX_PIXELS,
        ));
    }
    Ok(())
}
