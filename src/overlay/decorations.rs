use std::f32::consts::{PI, TAU};

use image::Rgba;

use super::glyphs::{text_height, text_width};
use super::surface::{Color, Surface};

const TINT: Color = Rgba([220, 38, 38, 255]);
const BORDER: Color = Rgba([239, 68, 68, 255]);
const CAPTION_BG: Color = Rgba([220, 38, 38, 235]);
const CAPTION_FG: Color = Rgba([255, 255, 255, 255]);
const GLYPH_FILL: Color = Rgba([250, 204, 21, 255]);

const TINT_MAX_ALPHA: f32 = 0.3;
const BORDER_WIDTH: f32 = 8.0;
const PULSE_PERIOD_SECS: f32 = 0.5;
const BOUNCE_PERIOD_SECS: f32 = 1.0;
const SPIN_PERIOD_SECS: f32 = 2.0;
const CORNER_INSET: f32 = 16.0;
const CORNER_SIZE: f32 = 48.0;
const CAPTION_TOP: f32 = 32.0;
const CAPTION_PADDING: f32 = 12.0;
const CAPTION_SCALE: u32 = 3;

/// Axis-aligned area on a surface, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Animated alarm layer. Every animation phase is a pure function of the
/// frame counter, so restarting the counter restarts the animation.
#[derive(Debug, Clone)]
pub struct AlarmDecorations {
    caption: String,
    refresh_rate_hz: f32,
}

impl AlarmDecorations {
    pub fn new(caption: impl Into<String>, refresh_rate_hz: u32) -> Self {
        Self {
            caption: caption.into(),
            refresh_rate_hz: refresh_rate_hz.max(1) as f32,
        }
    }

    /// Fraction of the way through a cycle of `period_secs`, in `[0, 1)`.
    fn phase(&self, frame: u64, period_secs: f32) -> f32 {
        let frames_per_cycle = (period_secs * self.refresh_rate_hz).max(1.0);
        (frame as f32 % frames_per_cycle) / frames_per_cycle
    }

    /// 0..=1, starting at full strength on frame zero.
    pub fn pulse(&self, frame: u64) -> f32 {
        0.5 + 0.5 * (self.phase(frame, PULSE_PERIOD_SECS) * TAU).cos()
    }

    /// Upward caption offset in pixels, zero at the bottom of the bounce.
    pub fn bounce_offset(&self, frame: u64, amplitude: f32) -> f32 {
        (self.phase(frame, BOUNCE_PERIOD_SECS) * PI).sin() * amplitude
    }

    pub fn spin_angle(&self, frame: u64) -> f32 {
        self.phase(frame, SPIN_PERIOD_SECS) * TAU
    }

    pub fn draw<S: Surface + ?Sized>(&self, surface: &mut S, frame: u64, region: Region) {
        let pulse = self.pulse(frame);

        let tint_alpha = (TINT_MAX_ALPHA * pulse * 255.0).round() as u8;
        surface.fill_rect(region.x, region.y, region.width, region.height, with_alpha(TINT, tint_alpha));

        let border_alpha = (255.0 * (0.4 + 0.6 * pulse)).round() as u8;
        surface.stroke_rect(
            region.x + BORDER_WIDTH / 2.0,
            region.y + BORDER_WIDTH / 2.0,
            region.width - BORDER_WIDTH,
            region.height - BORDER_WIDTH,
            BORDER_WIDTH as u32,
            with_alpha(BORDER, border_alpha),
        );

        self.draw_caption(surface, frame, region);

        let angle = self.spin_angle(frame);
        let half = CORNER_INSET + CORNER_SIZE / 2.0;
        let corners = [
            (region.x + half, region.y + half),
            (region.x + region.width - half, region.y + half),
            (region.x + half, region.y + region.height - half),
            (region.x + region.width - half, region.y + region.height - half),
        ];
        for (cx, cy) in corners {
            surface.fill_polygon(&triangle(cx, cy, CORNER_SIZE / 2.0, angle), GLYPH_FILL);
        }
    }

    fn draw_caption<S: Surface + ?Sized>(&self, surface: &mut S, frame: u64, region: Region) {
        let text_w = text_width(&self.caption, CAPTION_SCALE) as f32;
        let text_h = text_height(CAPTION_SCALE) as f32;
        let box_w = text_w + CAPTION_PADDING * 2.0;
        let box_h = text_h + CAPTION_PADDING * 2.0;

        let x = region.x + (region.width - box_w) / 2.0;
        let y = region.y + CAPTION_TOP - self.bounce_offset(frame, box_h / 2.0);

        surface.fill_rect(x, y, box_w, box_h, CAPTION_BG);
        surface.fill_text(
            &self.caption,
            x + CAPTION_PADDING,
            y + CAPTION_PADDING,
            CAPTION_SCALE,
            CAPTION_FG,
        );
    }
}

fn with_alpha(color: Color, alpha: u8) -> Color {
    Rgba([color[0], color[1], color[2], alpha])
}

/// Equilateral triangle centred on (`cx`, `cy`), rotated by `angle` radians.
fn triangle(cx: f32, cy: f32, radius: f32, angle: f32) -> [(f32, f32); 3] {
    let vertex = |k: f32| {
        let a = angle - PI / 2.0 + k * TAU / 3.0;
        (cx + radius * a.cos(), cy + radius * a.sin())
    };
    [vertex(0.0), vertex(1.0), vertex(2.0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::ImageSurface;

    fn decorations() -> AlarmDecorations {
        AlarmDecorations::new("PHONE LUNK DETECTED", 60)
    }

    #[test]
    fn animation_starts_from_frame_zero() {
        let deco = decorations();
        assert!((deco.pulse(0) - 1.0).abs() < 1e-6);
        assert_eq!(deco.bounce_offset(0, 20.0), 0.0);
        assert_eq!(deco.spin_angle(0), 0.0);
    }

    #[test]
    fn pulse_repeats_every_half_second() {
        let deco = decorations();
        assert!((deco.pulse(30) - deco.pulse(0)).abs() < 1e-6);
        assert!(deco.pulse(15) < 0.01);
    }

    #[test]
    fn draw_tints_region_only() {
        let deco = decorations();
        let mut surface = ImageSurface::new(320, 260);
        let region = Region {
            x: 0.0,
            y: 20.0,
            width: 320.0,
            height: 240.0,
        };

        deco.draw(&mut surface, 0, region);

        assert_eq!(surface.image().get_pixel(160, 5)[3], 0);
        assert!(surface.image().get_pixel(160, 200)[3] > 0);
    }
}
