// src/processor.rs
//
// Task processor: the handler the worker queue runs for every request.
//
//   cache.get(image_id) -> resize -> [blur] -> [grayscale] -> comment -> encode
//
// Each engine step consumes the previous handle, so an early error releases
// everything allocated so far.

use crate::cache::AutoCache;
use crate::config::ServiceConfig;
use crate::context::Context;
use crate::engine::{self, ImageHandle};
use crate::error::{ImageDeliveryError, Result};
use crate::queue::Queue;
use crate::task::{OutputFormat, Task};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs transformation tasks on a fixed pool of workers.
pub struct ImageProcessor {
    queue: Queue<Task, Bytes>,
}

impl ImageProcessor {
    /// Initialize the engine and start `config.workers` workers.
    ///
    /// Cancelling `ctx` shuts the processor's queue down.
    pub fn new(ctx: &Context, config: &ServiceConfig, cache: Arc<AutoCache>) -> Result<Self> {
        config.validate()?;
        engine::initialize(config.engine_settings())?;

        let queue = Queue::new(ctx, config.workers, move |ctx: &Context, task: Task| {
            run_task(&cache, ctx, task)
        })?;

        info!(workers = config.workers, "image processor ready");
        Ok(Self { queue })
    }

    /// Transform one image. Blocks until a worker has produced the output or
    /// `ctx` ends before any worker accepts the task.
    pub fn process_image(&self, ctx: &Context, task: Task) -> Result<Bytes> {
        self.queue.process(ctx, task)
    }

    /// Round-trip a 1x1 JPEG of `image_id` through the whole pipeline.
    pub fn health_check(&self, ctx: &Context, image_id: &str) -> Result<()> {
        let task = Task::new(image_id, 1, 1, "", OutputFormat::Jpeg);
        match self.process_image(ctx, task) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(image_id, error = %err, "health check failed");
                Err(err)
            }
        }
    }

    pub fn workers(&self) -> usize {
        self.queue.workers()
    }

    /// Stop accepting tasks and wait for in-flight ones. The engine stays up.
    pub fn stop(self) {
        self.queue.join();
    }

    /// Stop the workers, then shut the engine down for the rest of the process.
    pub fn shutdown(self) {
        self.queue.join();
        engine::shutdown();
    }
}

fn run_task(cache: &AutoCache, ctx: &Context, task: Task) -> Result<Bytes> {
    let started = Instant::now();
    let id = task.image_id.as_str();

    let source = stage(id, "cache", || cache.get(ctx, id))
        .map_err(ImageDeliveryError::cache_fetch)?;

    let mut handle: ImageHandle = stage(id, "resize", || {
        engine::resize_image(&source, task.width, task.height)
    })?;
    if task.apply_blur {
        handle = stage(id, "blur", || engine::blur(handle, task.blur_amount))?;
    }
    if task.apply_grayscale {
        handle = stage(id, "grayscale", || engine::grayscale(handle))?;
    }
    engine::set_user_comment(&mut handle, &task.user_comment);

    let output = stage(id, "encode", || engine::encode(handle, task.output_format))?;

    debug!(
        image_id = id,
        width = task.width,
        height = task.height,
        format = %task.output_format,
        bytes = output.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "task complete"
    );
    Ok(output)
}

fn stage<T>(image_id: &str, name: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    let result = f();
    debug!(
        image_id,
        stage = name,
        ok = result.is_ok(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "pipeline stage"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source_jpeg() -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(320, 240, |x, y| {
            image::Rgb([
                ((x * y) % 256) as u8,
                ((x ^ y) % 256) as u8,
                ((x * 7 + y * 3) % 256) as u8,
            ])
        }));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn processor(workers: usize) -> (ImageProcessor, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let source = source_jpeg();
        let loader = move |_ctx: &Context, key: &str| -> Result<Bytes> {
            counter.fetch_add(1, Ordering::SeqCst);
            match key {
                "1" => Ok(source.clone()),
                "broken" => Ok(Bytes::from_static(b"not an image")),
                _ => Err(ImageDeliveryError::storage_not_found(key.to_string())),
            }
        };
        let cache = Arc::new(AutoCache::new(Arc::new(MemoryCache::new()), Arc::new(loader)));
        let config = ServiceConfig {
            workers,
            ..ServiceConfig::default()
        };
        let processor = ImageProcessor::new(&Context::background(), &config, cache).unwrap();
        (processor, loads)
    }

    fn decode(bytes: &Bytes) -> DynamicImage {
        image::load_from_memory(bytes).unwrap()
    }

    #[test]
    fn resizes_to_exact_box() {
        let (processor, _) = processor(2);
        let out = processor
            .process_image(
                &Context::background(),
                Task::new("1", 200, 120, "", OutputFormat::Jpeg),
            )
            .unwrap();
        assert_eq!(decode(&out).dimensions(), (200, 120));
        processor.stop();
    }

    #[test]
    fn grayscale_and_blur_apply() {
        let (processor, _) = processor(1);
        let task = Task::new("1", 64, 64, "", OutputFormat::Jpeg).blur(3).grayscale();
        let out = processor.process_image(&Context::background(), task).unwrap();
        assert_eq!(decode(&out).color(), image::ColorType::L8);
        processor.stop();
    }

    #[test]
    fn blur_is_applied_before_grayscale() {
        let (processor, _) = processor(1);
        let source = source_jpeg();
        let encode_in_order = |blur_first: bool| {
            let handle = engine::resize_image(&source, 200, 200).unwrap();
            let handle = if blur_first {
                engine::grayscale(engine::blur(handle, 5).unwrap()).unwrap()
            } else {
                engine::blur(engine::grayscale(handle).unwrap(), 5).unwrap()
            };
            engine::encode(handle, OutputFormat::WebP).unwrap()
        };

        let task = Task::new("1", 200, 200, "", OutputFormat::WebP).grayscale().blur(5);
        let out = processor.process_image(&Context::background(), task).unwrap();
        assert_eq!(out, encode_in_order(true));
        assert_ne!(out, encode_in_order(false));
        processor.stop();
    }

    #[test]
    fn missing_image_reports_cache_stage() {
        let (processor, _) = processor(1);
        let err = processor
            .process_image(
                &Context::background(),
                Task::new("nope", 10, 10, "", OutputFormat::Jpeg),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "error getting image from cache: Image does not exist"
        );
        assert!(err.is_not_found());
        processor.stop();
    }

    #[test]
    fn undecodable_source_reports_decode_stage() {
        let (processor, _) = processor(1);
        let err = processor
            .process_image(
                &Context::background(),
                Task::new("broken", 10, 10, "", OutputFormat::WebP),
            )
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("error processing image from buffer:"));
        processor.stop();
    }

    #[test]
    fn blur_zero_fails_the_task() {
        let (processor, _) = processor(1);
        let task = Task::new("1", 10, 10, "", OutputFormat::Jpeg).blur(0);
        let err = processor
            .process_image(&Context::background(), task)
            .unwrap_err();
        assert!(matches!(err, ImageDeliveryError::BlurFailed { .. }));
        processor.stop();
    }

    #[test]
    fn source_is_loaded_once_across_tasks() {
        let (processor, loads) = processor(2);
        for (w, h) in [(10, 10), (20, 30), (30, 20)] {
            processor
                .process_image(
                    &Context::background(),
                    Task::new("1", w, h, "", OutputFormat::WebP),
                )
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        processor.stop();
    }

    #[test]
    fn health_check_round_trips() {
        let (processor, _) = processor(1);
        processor.health_check(&Context::background(), "1").unwrap();
        assert!(processor
            .health_check(&Context::background(), "missing")
            .is_err());
        processor.stop();
    }

    #[test]
    fn cancelled_context_never_reaches_the_cache() {
        let (processor, loads) = processor(1);
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = processor
            .process_image(&ctx, Task::new("1", 10, 10, "", OutputFormat::Jpeg))
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        processor.stop();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cache = Arc::new(AutoCache::new(
            Arc::new(MemoryCache::new()),
            Arc::new(|_: &Context, _: &str| -> Result<Bytes> { Ok(Bytes::new()) }),
        ));
        let config = ServiceConfig {
            workers: 0,
            ..ServiceConfig::default()
        };
        assert!(matches!(
            ImageProcessor::new(&Context::background(), &config, cache),
            Err(ImageDeliveryError::InvalidConfig { .. })
        ));
    }
}
