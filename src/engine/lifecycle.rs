// src/engine/lifecycle.rs
//
// Process-wide engine state. Codecs run single-threaded; parallelism comes
// from the worker queue, never from inside a codec call.
//
//   Uninitialized --initialize--> Running --shutdown--> ShutDown
//
// ShutDown is terminal: the process has to restart to encode again.

use crate::error::{ImageDeliveryError, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

/// Encoder settings fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub jpeg_quality: u8,
    pub webp_quality: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            webp_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EngineState {
    Uninitialized,
    Running(EngineSettings),
    ShutDown,
}

static STATE: RwLock<EngineState> = parking_lot::const_rwlock(EngineState::Uninitialized);

/// Start the engine. Idempotent: later calls keep the first settings.
pub fn initialize(settings: EngineSettings) -> Result<()> {
    let mut state = STATE.write();
    match *state {
        EngineState::Running(current) => {
            if current != settings {
                debug!(?current, requested = ?settings, "engine already running, keeping settings");
            }
            Ok(())
        }
        EngineState::ShutDown => Err(ImageDeliveryError::EngineShutDown),
        EngineState::Uninitialized => {
            *state = EngineState::Running(settings);
            info!(
                jpeg_quality = settings.jpeg_quality,
                webp_quality = settings.webp_quality,
                "image engine initialized"
            );
            Ok(())
        }
    }
}

/// Stop the engine. Operations fail with `EngineShutDown` afterwards.
pub fn shutdown() {
    let mut state = STATE.write();
    if matches!(*state, EngineState::Running(_)) {
        info!("image engine shut down");
    }
    *state = EngineState::ShutDown;
}

pub fn is_initialized() -> bool {
    matches!(*STATE.read(), EngineState::Running(_))
}

/// Settings of the running engine, or the lifecycle error.
pub(crate) fn settings() -> Result<EngineSettings> {
    match *STATE.read() {
        EngineState::Running(settings) => Ok(settings),
        EngineState::Uninitialized => Err(ImageDeliveryError::EngineNotInitialized),
        EngineState::ShutDown => Err(ImageDeliveryError::EngineShutDown),
    }
}
