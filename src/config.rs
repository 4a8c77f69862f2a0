// src/config.rs
//
// Service configuration.
//
// Defaults come from the host (worker count = available parallelism, which
// respects cgroup/CPU quota). Each field can be overridden through the
// environment:
// - IMAGE_DELIVERY_WORKERS
// - IMAGE_DELIVERY_JPEG_QUALITY
// - IMAGE_DELIVERY_WEBP_QUALITY

use crate::engine::EngineSettings;
use crate::error::{ImageDeliveryError, Result};
use std::str::FromStr;

pub const ENV_WORKERS: &str = "IMAGE_DELIVERY_WORKERS";
pub const ENV_JPEG_QUALITY: &str = "IMAGE_DELIVERY_JPEG_QUALITY";
pub const ENV_WEBP_QUALITY: &str = "IMAGE_DELIVERY_WEBP_QUALITY";

const DEFAULT_QUALITY: u8 = 80;
const MIN_WORKERS: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Number of worker threads; fixed for the life of the processor.
    pub workers: usize,
    pub jpeg_quality: u8,
    pub webp_quality: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            jpeg_quality: DEFAULT_QUALITY,
            webp_quality: DEFAULT_QUALITY,
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by `lookup(name)` for each known variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            workers: parse_var(&lookup, ENV_WORKERS)?.unwrap_or(defaults.workers),
            jpeg_quality: parse_var(&lookup, ENV_JPEG_QUALITY)?.unwrap_or(defaults.jpeg_quality),
            webp_quality: parse_var(&lookup, ENV_WEBP_QUALITY)?.unwrap_or(defaults.webp_quality),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers < MIN_WORKERS {
            return Err(ImageDeliveryError::invalid_config(
                "workers",
                self.workers.to_string(),
                "At least one worker is required",
            ));
        }
        for (name, quality) in [
            ("jpeg_quality", self.jpeg_quality),
            ("webp_quality", self.webp_quality),
        ] {
            if quality > 100 {
                return Err(ImageDeliveryError::invalid_config(
                    name,
                    quality.to_string(),
                    "Quality must be between 0 and 100",
                ));
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            jpeg_quality: self.jpeg_quality,
            webp_quality: self.webp_quality,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| ImageDeliveryError::invalid_config(name, raw.clone(), "Expected an integer"))
}
