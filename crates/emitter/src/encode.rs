use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use capture_protocol::PixelBuffer;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::EmitError;

/// Lossless in-memory PNG of an RGBA8 buffer.
pub fn encode_png(buffer: &PixelBuffer) -> Result<Vec<u8>, EmitError> {
    let extent = buffer.extent();
    if extent.is_empty() {
        return Err(EmitError::EmptyImage(extent));
    }
    let mut png = Vec::new();
    PngEncoder::new(&mut png).write_image(
        buffer.as_bytes(),
        extent.width,
        extent.height,
        ExtendedColorType::Rgba8,
    )?;
    Ok(png)
}

pub fn encode_png_base64(buffer: &PixelBuffer) -> Result<String, EmitError> {
    encode_png(buffer).map(|png| STANDARD.encode(png))
}
