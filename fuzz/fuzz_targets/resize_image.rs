#![no_main]

use image_delivery::engine::{self, EngineSettings};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes as a source image: decoding may fail, but never panic or
// produce a handle of the wrong size.
fuzz_target!(|data: &[u8]| {
    let _ = engine::initialize(EngineSettings::default());
    if data.len() < 2 {
        return;
    }
    let width = data[0] as u32 % 128 + 1;
    let height = data[1] as u32 % 128 + 1;
    if let Ok(handle) = engine::resize_image(&data[2..], width, height) {
        assert_eq!(handle.dimensions(), Some((width, height)));
    }
});
