//! Drawing of detection boxes and alarm decorations onto a [`Surface`].

pub mod decorations;
pub mod glyphs;
pub mod surface;

pub use decorations::{AlarmDecorations, Region};
pub use surface::{Color, ImageSurface, Surface, TRANSPARENT};

use image::Rgba;

use crate::detection::Prediction;

pub const BOX_COLOR: Color = Rgba([239, 68, 68, 255]);
pub const LABEL_TEXT_COLOR: Color = Rgba([255, 255, 255, 255]);
pub const BOX_LINE_WIDTH: u32 = 4;
pub const LABEL_HEIGHT: f32 = 30.0;
const LABEL_TEXT_SCALE: u32 = 2;
const LABEL_TEXT_INSET_X: f32 = 5.0;

/// Label shown above a box: the last word of the class plus the confidence,
/// e.g. `PHONE 87%` for `cell phone`.
pub fn label_text(prediction: &Prediction) -> String {
    let noun = prediction
        .label
        .split_whitespace()
        .last()
        .unwrap_or(prediction.label.as_str())
        .to_uppercase();
    format!("{noun} {}%", prediction.percent())
}

/// Clears the surface and draws one outlined box plus label per prediction.
///
/// The caller sizes the surface to the source frame before calling; box
/// coordinates are used as-is.
pub fn draw_predictions<S: Surface + ?Sized>(surface: &mut S, predictions: &[Prediction]) {
    surface.clear();

    for prediction in predictions {
        let bbox = prediction.bbox;
        surface.stroke_rect(bbox.x, bbox.y, bbox.width, bbox.height, BOX_LINE_WIDTH, BOX_COLOR);
        surface.fill_rect(bbox.x, bbox.y - LABEL_HEIGHT, bbox.width, LABEL_HEIGHT, BOX_COLOR);

        let text_h = glyphs::text_height(LABEL_TEXT_SCALE) as f32;
        surface.fill_text(
            &label_text(prediction),
            bbox.x + LABEL_TEXT_INSET_X,
            bbox.y - (LABEL_HEIGHT + text_h) / 2.0,
            LABEL_TEXT_SCALE,
            LABEL_TEXT_COLOR,
        );
    }
}
