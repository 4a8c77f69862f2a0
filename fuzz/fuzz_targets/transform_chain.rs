#![no_main]

use arbitrary::Arbitrary;
use image_delivery::engine::{self, EngineSettings};
use image_delivery::OutputFormat;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    width: u8,
    height: u8,
    blur: Option<u8>,
    grayscale: bool,
    webp: bool,
    comment: String,
    pixels: Vec<u8>,
}

// Builds a raw RGB image from fuzz bytes, encodes it as JPEG through the
// engine, then runs the full transform chain on that source.
fuzz_target!(|input: Input| {
    let _ = engine::initialize(EngineSettings::default());
    let width = input.width as u32 % 64 + 1;
    let height = input.height as u32 % 64 + 1;
    let format = if input.webp { OutputFormat::WebP } else { OutputFormat::Jpeg };

    let Some(source) = source_jpeg(&input.pixels) else {
        return;
    };

    let Ok(mut handle) = engine::resize_image(&source, width, height) else {
        return;
    };
    if let Some(amount) = input.blur {
        match engine::blur(handle, amount as u32 % 16) {
            Ok(h) => handle = h,
            Err(_) => return,
        }
    }
    if input.grayscale {
        match engine::grayscale(handle) {
            Ok(h) => handle = h,
            Err(_) => return,
        }
    }
    engine::set_user_comment(&mut handle, &input.comment);
    let out = engine::encode(handle, format).expect("encode of a valid handle");
    assert!(!out.is_empty());
});

fn source_jpeg(pixels: &[u8]) -> Option<Vec<u8>> {
    if pixels.is_empty() {
        return None;
    }
    let side = 16u32;
    let mut rgb = Vec::with_capacity((side * side * 3) as usize);
    for i in 0..(side * side * 3) as usize {
        rgb.push(pixels[i % pixels.len()]);
    }
    // Round-trip through the engine's own decoder path via a PNG container.
    let img = image_png(side, side, rgb)?;
    let handle = engine::resize_image(&img, side, side).ok()?;
    engine::encode(handle, OutputFormat::Jpeg).ok().map(|b| b.to_vec())
}

fn image_png(width: u32, height: u32, rgb: Vec<u8>) -> Option<Vec<u8>> {
    use image::{DynamicImage, ImageFormat, RgbImage};
    let img = DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, rgb)?);
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).ok()?;
    Some(buf.into_inner())
}
