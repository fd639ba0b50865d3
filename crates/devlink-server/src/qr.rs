//! QR code rendering

use image::ImageFormat;
use qrcode::QrCode;
use std::io::Cursor;
use thiserror::Error;

/// Smallest and largest PNG edge served
pub const MIN_PNG_SIZE: u32 = 64;
pub const MAX_PNG_SIZE: u32 = 1024;

#[derive(Debug, Error)]
pub enum QrRenderError {
    #[error("Payload does not fit in a QR code: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("PNG encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Render a payload as a square PNG of roughly `size` pixels
pub fn render_png(payload: &str, size: u32) -> Result<Vec<u8>, QrRenderError> {
    let size = size.clamp(MIN_PNG_SIZE, MAX_PNG_SIZE);
    let code = QrCode::new(payload.as_bytes())?;
    let image = code.render::<image::Luma<u8>>().build();

    let resized = image::imageops::resize(
        &image,
        size,
        size,
        image::imageops::FilterType::Nearest,
    );

    let mut buffer = Cursor::new(Vec::new());
    resized.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Render a payload as Unicode block characters for a terminal
pub fn render_terminal(payload: &str) -> Result<String, QrRenderError> {
    let code = QrCode::new(payload.as_bytes())?;
    Ok(code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build())
}
