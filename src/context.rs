// src/context.rs
//
// Request-scoped cancellation and deadlines.
//
// A `Context` is cheap to clone and shared between the submitting thread, the
// queue and the loader. Cancellation is signalled by dropping the sender side of
// a zero-capacity channel, so `done()` can sit inside `crossbeam_channel::select!`
// next to other channel operations. Deadlines are not signalled on `done()`;
// blocking callers pair `done()` with `crossbeam_channel::at(deadline)`.

use crate::error::ImageDeliveryError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    // Dropped on cancel; receivers then observe disconnection.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            done_tx: Mutex::new(Some(tx)),
            done_rx: rx,
            deadline,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done_tx.lock().take();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cancellation scope handed to queue submissions, cache loads and storage reads.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the `Context` it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            inner: Inner::new(None),
        }
    }

    /// Derive a cancellable child. Cancelling the parent cancels the child.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let child = self.derive(self.inner.deadline);
        let handle = CancelHandle {
            inner: Arc::clone(&child.inner),
        };
        (child, handle)
    }

    /// Derive a child that expires at `deadline` (or earlier, if the parent does).
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        let effective = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        let child = self.derive(Some(effective));
        let handle = CancelHandle {
            inner: Arc::clone(&child.inner),
        };
        (child, handle)
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    fn derive(&self, deadline: Option<Instant>) -> Context {
        let inner = Inner::new(deadline);
        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&inner));
        }
        // The parent may have been cancelled before the child was registered.
        if self.inner.cancelled.load(Ordering::Acquire) {
            inner.cancel();
        }
        Context { inner }
    }

    /// Receiver that becomes ready (disconnected) once the context is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// True once the context is cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ImageDeliveryError> {
        if self.is_cancelled() {
            return Some(ImageDeliveryError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(ImageDeliveryError::DeadlineExceeded)
            }
            _ => None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
