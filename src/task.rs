// src/task.rs
//
// Transformation tasks.
// Built per request, moved into the worker queue, dropped once encoded.

use crate::error::ImageDeliveryError;
use std::fmt;
use std::str::FromStr;

/// Output container for an encoded image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    #[default]
    Jpeg,
    WebP,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// Short name used in error messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::WebP => "webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ImageDeliveryError;

    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::WebP),
            other => Err(ImageDeliveryError::unsupported_format(other.to_string())),
        }
    }
}

/// One image transformation request.
///
/// Blur, when requested, always runs before grayscale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub apply_blur: bool,
    pub blur_amount: u32,
    pub apply_grayscale: bool,
    pub user_comment: String,
    pub output_format: OutputFormat,
}

impl Task {
    pub fn new(
        image_id: impl Into<String>,
        width: u32,
        height: u32,
        user_comment: impl Into<String>,
        output_format: OutputFormat,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            width,
            height,
            apply_blur: false,
            blur_amount: 0,
            apply_grayscale: false,
            user_comment: user_comment.into(),
            output_format,
        }
    }

    /// Apply a gaussian blur with the given radius.
    pub fn blur(mut self, amount: u32) -> Self {
        self.apply_blur = true;
        self.blur_amount = amount;
        self
    }

    /// Convert to single-channel grayscale.
    pub fn grayscale(mut self) -> Self {
        self.apply_grayscale = true;
        self
    }
}
