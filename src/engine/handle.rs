// src/engine/handle.rs

use image::DynamicImage;

#[cfg(test)]
thread_local! {
    static LIVE_HANDLES: std::cell::Cell<isize> = const { std::cell::Cell::new(0) };
}

/// Owned in-memory image plus the metadata to embed on encode.
///
/// Engine operations take handles by value; a handle passed in is released
/// by the callee on every path.
#[derive(Debug)]
pub struct ImageHandle {
    image: Option<DynamicImage>,
    comment: Option<String>,
}

impl ImageHandle {
    pub(crate) fn new(image: DynamicImage) -> Self {
        Self::with_comment(image, None)
    }

    pub(crate) fn with_comment(image: DynamicImage, comment: Option<String>) -> Self {
        #[cfg(test)]
        LIVE_HANDLES.with(|n| n.set(n.get() + 1));
        Self {
            image: Some(image),
            comment,
        }
    }

    /// A handle with no pixels. Every operation on it fails.
    pub fn empty() -> Self {
        #[cfg(test)]
        LIVE_HANDLES.with(|n| n.set(n.get() + 1));
        Self {
            image: None,
            comment: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_none()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.image.as_ref().map(|img| (img.width(), img.height()))
    }

    pub fn channels(&self) -> Option<u8> {
        self.image.as_ref().map(|img| img.color().channel_count())
    }

    pub fn user_comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub(crate) fn set_comment(&mut self, comment: Option<String>) {
        self.comment = comment;
    }

    pub(crate) fn into_parts(mut self) -> (Option<DynamicImage>, Option<String>) {
        (self.image.take(), self.comment.take())
    }
}

#[cfg(test)]
impl Drop for ImageHandle {
    fn drop(&mut self) {
        LIVE_HANDLES.with(|n| n.set(n.get() - 1));
    }
}

/// Handles alive on the current thread.
#[cfg(test)]
pub(crate) fn live_handles() -> isize {
    LIVE_HANDLES.with(|n| n.get())
}
