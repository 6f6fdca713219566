use ab_glyph::{FontRef, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};

pub const BOX_THICKNESS: u32 = 3;
pub const CAPTION_SCALE: f32 = 15.0;

static CAPTION_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

pub fn caption_font() -> Result<FontRef<'static>, InvalidFont> {
    FontRef::try_from_slice(CAPTION_FONT)
}

/// Draws the outline of `bbox` (`[x_min, y_min, x_max, y_max]`, inclusive),
/// growing inwards to `thickness` pixels. Parts outside the image are skipped.
pub fn draw_box(image: &mut RgbImage, bbox: [i32; 4], color: Rgb<u8>, thickness: u32) {
    let [x1, y1, x2, y2] = bbox;
    let (x1, x2) = (x1.min(x2), x1.max(x2));
    let (y1, y2) = (y1.min(y2), y1.max(y2));

    for inset in 0..thickness as i32 {
        let width = x2 - x1 + 1 - 2 * inset;
        let height = y2 - y1 + 1 - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect = Rect::at(x1 + inset, y1 + inset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// `"attentive (92%)"`.
pub fn caption(label: &str, confidence: f32) -> String {
    format!("{} ({:.0}%)", label, confidence * 100.0)
}

/// Captions sit 20px above their box, or just inside it when that would
/// leave the top of the image.
pub fn caption_origin(bbox: [i32; 4]) -> (i32, i32) {
    let [x1, y1, ..] = bbox;
    let above = y1 - 20;
    (x1, if above > 0 { above } else { y1 + 5 })
}

pub fn draw_caption(image: &mut RgbImage, font: &FontRef<'_>, bbox: [i32; 4], color: Rgb<u8>, text: &str) {
    let (x, y) = caption_origin(bbox);
    draw_text_mut(image, color, x, y, PxScale::from(CAPTION_SCALE), font, text);
}
