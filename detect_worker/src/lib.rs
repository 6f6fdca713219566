//! Reference worker for the detection server's stdio protocol: base64 image
//! text on stdin, one `DetectionResult` JSON document on stdout.

pub mod annotate;
pub mod simulation;

use annotate::{caption, caption_font, draw_box, draw_caption, BOX_THICKNESS};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use detect_types::DetectionResult;
use image::{DynamicImage, ImageFormat};
use simulation::SIMULATED_FINDINGS;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no image data on stdin")]
    EmptyInput,
    #[error("input is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("failed to encode annotated image: {0}")]
    Encode(image::ImageError),
    #[error("caption font is unusable: {0}")]
    Font(#[from] ab_glyph::InvalidFont),
}

pub fn process(input: &str) -> Result<DetectionResult, WorkerError> {
    let encoded = input.trim();
    if encoded.is_empty() {
        return Err(WorkerError::EmptyInput);
    }
    let bytes = STANDARD.decode(encoded)?;

    let decoded = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| WorkerError::Decode(e.into()))?
        .decode()
        .map_err(WorkerError::Decode)?;
    let mut frame = decoded.to_rgb8();
    tracing::debug!(width = frame.width(), height = frame.height(), "Decoded frame");

    let font = caption_font()?;
    let detections = SIMULATED_FINDINGS
        .iter()
        .map(|simulated| {
            draw_box(&mut frame, simulated.bbox, simulated.color, BOX_THICKNESS);
            let text = caption(simulated.label, simulated.confidence);
            draw_caption(&mut frame, &font, simulated.bbox, simulated.color, &text);
            simulated.to_finding()
        })
        .collect();

    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(frame)
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .map_err(WorkerError::Encode)?;

    Ok(DetectionResult {
        processed_image_base64: STANDARD.encode(jpeg),
        detections,
    })
}
