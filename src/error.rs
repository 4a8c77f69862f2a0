// src/error.rs
//
// Unified error handling for image-delivery
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - UserError: Invalid input, recoverable
// - CodecError: Decode/transform/encode failures from the native codecs
// - ResourceLimit: Dimension/pixel limits
// - Unavailable: Shutdown, cancellation, collaborator failures
// - InternalBug: Library bugs (should not happen)

use std::borrow::Cow;
use thiserror::Error;

/// Coarse classification used by upstream callers to map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCategory {
    /// Invalid input, recoverable by the caller
    UserError,
    /// Format/encoding issues
    CodecError,
    /// Dimension/pixel limits
    ResourceLimit,
    /// The request could not be served right now (shutdown, cancelled, backend down)
    Unavailable,
    /// Library bugs (should not happen)
    InternalBug,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserError => "UserError",
            ErrorCategory::CodecError => "CodecError",
            ErrorCategory::ResourceLimit => "ResourceLimit",
            ErrorCategory::Unavailable => "Unavailable",
            ErrorCategory::InternalBug => "InternalBug",
        }
    }
}

/// image-delivery error types
///
/// Stage prefixes ("error getting image from cache", "error saving to jpeg buffer", ...)
/// are part of the display text; the codec diagnostic follows verbatim.
#[derive(Debug, Error)]
pub enum ImageDeliveryError {
    // Queue / context
    #[error("queue has been shutdown")]
    QueueShutdown,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    // Storage / cache collaborators
    #[error("Image does not exist")]
    StorageNotFound { id: Cow<'static, str> },

    #[error("failed to read image '{id}': {source}")]
    StorageReadFailed {
        id: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Loader { message: Cow<'static, str> },

    #[error("cache provider error: {message}")]
    Provider { message: Cow<'static, str> },

    #[error("error getting image from cache: {source}")]
    CacheFetch {
        #[source]
        source: Box<ImageDeliveryError>,
    },

    // Decode
    #[error("empty buffer")]
    EmptyInput,

    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: Cow<'static, str> },

    #[error("error processing image from buffer: {message}")]
    DecodeFailed { message: Cow<'static, str> },

    // Size limits
    #[error("Image dimension {dimension} exceeds maximum {max}")]
    DimensionExceedsLimit { dimension: u32, max: u32 },

    #[error("Image pixel count {pixels} exceeds maximum {max}")]
    PixelCountExceedsLimit { pixels: u64, max: u64 },

    // Transforms
    #[error("Invalid resize dimensions: width={width}, height={height}")]
    InvalidResizeDimensions { width: u32, height: u32 },

    #[error("error changing image colorspace: {message}")]
    ColorspaceFailed { message: Cow<'static, str> },

    #[error("error applying blur to image: {message}")]
    BlurFailed { message: Cow<'static, str> },

    // Encode
    #[error("error saving to {format} buffer: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Engine lifecycle
    #[error("image engine is not initialized")]
    EngineNotInitialized,

    #[error("image engine has been shut down")]
    EngineShutDown,

    // Configuration
    #[error("Invalid value for {name}: {value}. {reason}")]
    InvalidConfig {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    // Internal
    #[error("Internal error: {message}")]
    InternalPanic { message: Cow<'static, str> },
}

impl Clone for ImageDeliveryError {
    fn clone(&self) -> Self {
        match self {
            Self::QueueShutdown => Self::QueueShutdown,
            Self::Cancelled => Self::Cancelled,
            Self::DeadlineExceeded => Self::DeadlineExceeded,
            Self::StorageNotFound { id } => Self::StorageNotFound { id: id.clone() },
            Self::StorageReadFailed { id, source } => Self::StorageReadFailed {
                id: id.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::Loader { message } => Self::Loader {
                message: message.clone(),
            },
            Self::Provider { message } => Self::Provider {
                message: message.clone(),
            },
            Self::CacheFetch { source } => Self::CacheFetch {
                source: source.clone(),
            },
            Self::EmptyInput => Self::EmptyInput,
            Self::UnsupportedFormat { format } => Self::UnsupportedFormat {
                format: format.clone(),
            },
            Self::DecodeFailed { message } => Self::DecodeFailed {
                message: message.clone(),
            },
            Self::DimensionExceedsLimit { dimension, max } => Self::DimensionExceedsLimit {
                dimension: *dimension,
                max: *max,
            },
            Self::PixelCountExceedsLimit { pixels, max } => Self::PixelCountExceedsLimit {
                pixels: *pixels,
                max: *max,
            },
            Self::InvalidResizeDimensions { width, height } => Self::InvalidResizeDimensions {
                width: *width,
                height: *height,
            },
            Self::ColorspaceFailed { message } => Self::ColorspaceFailed {
                message: message.clone(),
            },
            Self::BlurFailed { message } => Self::BlurFailed {
                message: message.clone(),
            },
            Self::EncodeFailed { format, message } => Self::EncodeFailed {
                format: format.clone(),
                message: message.clone(),
            },
            Self::EngineNotInitialized => Self::EngineNotInitialized,
            Self::EngineShutDown => Self::EngineShutDown,
            Self::InvalidConfig {
                name,
                value,
                reason,
            } => Self::InvalidConfig {
                name: name.clone(),
                value: value.clone(),
                reason: reason.clone(),
            },
            Self::InternalPanic { message } => Self::InternalPanic {
                message: message.clone(),
            },
        }
    }
}

// Constructor Helpers
impl ImageDeliveryError {
    pub fn storage_not_found(id: impl Into<Cow<'static, str>>) -> Self {
        Self::StorageNotFound { id: id.into() }
    }

    pub fn storage_read_failed(id: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::StorageReadFailed {
            id: id.into(),
            source,
        }
    }

    pub fn loader(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Loader {
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn cache_fetch(source: ImageDeliveryError) -> Self {
        Self::CacheFetch {
            source: Box::new(source),
        }
    }

    pub fn unsupported_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    pub fn decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn dimension_exceeds_limit(dimension: u32, max: u32) -> Self {
        Self::DimensionExceedsLimit { dimension, max }
    }

    pub fn pixel_count_exceeds_limit(pixels: u64, max: u64) -> Self {
        Self::PixelCountExceedsLimit { pixels, max }
    }

    pub fn invalid_resize_dimensions(width: u32, height: u32) -> Self {
        Self::InvalidResizeDimensions { width, height }
    }

    pub fn colorspace_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::ColorspaceFailed {
            message: message.into(),
        }
    }

    pub fn blur_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::BlurFailed {
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidConfig {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn internal_panic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalPanic {
            message: message.into(),
        }
    }

    /// True for `Cancelled` and `DeadlineExceeded`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// True when the source image does not exist, looking through the cache stage wrapper.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::StorageNotFound { .. } => true,
            Self::CacheFetch { source } => source.is_not_found(),
            _ => false,
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StorageNotFound { .. }
            | Self::EmptyInput
            | Self::InvalidResizeDimensions { .. }
            | Self::InvalidConfig { .. } => ErrorCategory::UserError,

            Self::UnsupportedFormat { .. }
            | Self::DecodeFailed { .. }
            | Self::ColorspaceFailed { .. }
            | Self::BlurFailed { .. }
            | Self::EncodeFailed { .. } => ErrorCategory::CodecError,

            Self::DimensionExceedsLimit { .. } | Self::PixelCountExceedsLimit { .. } => {
                ErrorCategory::ResourceLimit
            }

            Self::QueueShutdown
            | Self::Cancelled
            | Self::DeadlineExceeded
            | Self::StorageReadFailed { .. }
            | Self::Loader { .. }
            | Self::Provider { .. }
            | Self::EngineNotInitialized
            | Self::EngineShutDown => ErrorCategory::Unavailable,

            // The wrapper classifies as whatever it wraps.
            Self::CacheFetch { source } => source.category(),

            Self::InternalPanic { .. } => ErrorCategory::InternalBug,
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, ImageDeliveryError>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
