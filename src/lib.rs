// lib.rs
//
// image-delivery: compute core of an on-the-fly image delivery service.
//
// Requests become `Task`s and run on a fixed pool of workers. Each worker
// fetches the source bytes through a coalescing cache, then drives the
// native engine: resize (cover + centre crop), optional blur and grayscale,
// an EXIF UserComment, and JPEG or WebP encoding.

// Memory allocator optimization - jemalloc for better performance
// Note: jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod task;

pub use cache::{AutoCache, CacheProvider, Loader, MemoryCache};
pub use config::ServiceConfig;
pub use context::{CancelHandle, Context};
pub use error::{ErrorCategory, ImageDeliveryError, Result};
pub use processor::ImageProcessor;
pub use queue::Queue;
pub use storage::{FileStorage, Storage, StorageLoader};
pub use task::{OutputFormat, Task};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Source containers the engine decodes.
pub fn supported_input_formats() -> &'static [&'static str] {
    &["jpeg", "png", "webp"]
}

/// Containers the engine encodes.
pub fn supported_output_formats() -> &'static [&'static str] {
    &["jpeg", "webp"]
}
