// src/queue.rs
//
// Fixed-size worker queue.
//
// Workers are OS threads pulling jobs from a zero-capacity (rendezvous) channel:
// a submission only completes once a worker is free to take it, so at most
// `workers` jobs ever run at once and callers stall instead of piling up.
// Cancellation applies only while waiting for a worker; an accepted job always
// runs to completion.

use crate::context::{CancelHandle, Context};
use crate::error::{panic_message, ImageDeliveryError, Result};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

struct Job<T, R> {
    payload: T,
    ctx: Context,
    result: Sender<Result<R>>,
}

/// Bounded-concurrency executor for `(Context, T) -> Result<R>` jobs.
pub struct Queue<T, R> {
    // `None` once shut down; dropping the last sender closes intake.
    intake: Mutex<Option<Sender<Job<T, R>>>>,
    ctx: Context,
    stop: CancelHandle,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl<T, R> Queue<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawn `workers` threads (at least one) running `handler`.
    ///
    /// Cancelling `ctx` shuts the queue down, the same as calling [`Queue::shutdown`].
    pub fn new<F>(ctx: &Context, workers: usize, handler: F) -> Result<Self>
    where
        F: Fn(&Context, T) -> Result<R> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let (queue_ctx, stop) = ctx.with_cancel();
        let (intake_tx, intake_rx) = crossbeam_channel::bounded::<Job<T, R>>(0);
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let intake = intake_rx.clone();
            let queue_ctx = queue_ctx.clone();
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("image-worker-{id}"))
                .spawn(move || worker_loop(id, &intake, &queue_ctx, handler.as_ref()));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    stop.cancel();
                    return Err(ImageDeliveryError::internal_panic(format!(
                        "failed to spawn worker thread {id}: {err}"
                    )));
                }
            }
        }

        info!(workers, "starting worker queue");

        Ok(Self {
            intake: Mutex::new(Some(intake_tx)),
            ctx: queue_ctx,
            stop,
            handles: Mutex::new(handles),
            workers,
        })
    }

    /// Submit `payload` and block until a worker returns its result.
    ///
    /// Fails with `QueueShutdown` once the queue is shut down. While no worker has
    /// accepted the job yet, cancellation or the deadline of `ctx` aborts the
    /// submission and the handler never runs.
    pub fn process(&self, ctx: &Context, payload: T) -> Result<R> {
        if self.ctx.is_done() {
            return Err(ImageDeliveryError::QueueShutdown);
        }
        let intake = match self.intake.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(ImageDeliveryError::QueueShutdown),
        };
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let job = Job {
            payload,
            ctx: ctx.clone(),
            result: result_tx,
        };
        let deadline = ctx
            .deadline()
            .map(crossbeam_channel::at)
            .unwrap_or_else(crossbeam_channel::never);

        select! {
            send(intake, job) -> sent => {
                if sent.is_err() {
                    return Err(ImageDeliveryError::QueueShutdown);
                }
            }
            recv(ctx.done()) -> _ => {
                return Err(ctx.err().unwrap_or(ImageDeliveryError::Cancelled));
            }
            recv(deadline) -> _ => return Err(ImageDeliveryError::DeadlineExceeded),
            recv(self.ctx.done()) -> _ => return Err(ImageDeliveryError::QueueShutdown),
        }
        drop(intake);

        result_rx.recv().unwrap_or_else(|_| {
            Err(ImageDeliveryError::internal_panic(
                "worker exited without returning a result",
            ))
        })
    }

    /// Close intake. Accepted jobs finish; new submissions fail fast.
    /// Safe to call any number of times from any thread; never blocks.
    pub fn shutdown(&self) {
        self.stop.cancel();
        if self.intake.lock().take().is_some() {
            info!(workers = self.workers, "worker queue shut down");
        }
    }

    /// Shut down and wait for every worker thread to exit.
    pub fn join(self) {
        self.shutdown();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.is_done()
    }
}

impl<T, R> Drop for Queue<T, R> {
    fn drop(&mut self) {
        self.stop.cancel();
        self.intake.lock().take();
    }
}

fn worker_loop<T, R, F>(id: usize, intake: &Receiver<Job<T, R>>, queue_ctx: &Context, handler: &F)
where
    F: Fn(&Context, T) -> Result<R>,
{
    debug!(worker = id, "worker started");
    loop {
        select! {
            recv(intake) -> msg => match msg {
                Ok(job) => run_job(id, job, handler),
                Err(_) => break,
            },
            recv(queue_ctx.done()) -> _ => break,
        }
    }
    debug!(worker = id, "worker stopped");
}

fn run_job<T, R, F>(id: usize, job: Job<T, R>, handler: &F)
where
    F: Fn(&Context, T) -> Result<R>,
{
    let Job {
        payload,
        ctx,
        result,
    } = job;

    // Cancelled between handoff and pickup: answer without running.
    let outcome = match ctx.err() {
        Some(err) => Err(err),
        None => match panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx, payload))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = id, %message, "job handler panicked");
                Err(ImageDeliveryError::internal_panic(format!(
                    "job handler panicked: {message}"
                )))
            }
        },
    };

    // The submitter is blocked on the other end unless it unwound itself.
    let _ = result.send(outcome);
}
