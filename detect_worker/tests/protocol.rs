use base64::{engine::general_purpose::STANDARD, Engine as _};
use detect_types::DetectionResult;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{
    io::{Cursor, Write},
    process::{Command, Output, Stdio},
};

fn run_worker(stdin: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_detect_worker"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("worker binary should start");

    let mut input = child.stdin.take().unwrap();
    input.write_all(stdin).unwrap();
    drop(input);

    child.wait_with_output().unwrap()
}

fn jpeg_base64() -> String {
    let image = RgbImage::from_pixel(320, 240, Rgb([10, 20, 30]));
    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .unwrap();
    STANDARD.encode(jpeg)
}

#[test]
fn valid_image_yields_one_result_document_and_exit_zero() {
    let output = run_worker(jpeg_base64().as_bytes());

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let result: DetectionResult = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result.detections.len(), 3);
    assert!(result.validate().is_ok());
    assert!(STANDARD.decode(&result.processed_image_base64).is_ok());
}

#[test]
fn undecodable_input_exits_nonzero_with_diagnostics_only() {
    let output = run_worker(b"bm90IGFuIGltYWdl");

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to decode image"), "stderr: {stderr}");
}

#[test]
fn empty_input_exits_nonzero() {
    let output = run_worker(b"");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no image data"));
}
