use image::{Rgba, RgbaImage};

use crate::alarm::AlarmPhase;
use crate::camera::Frame;
use crate::overlay::{glyphs, AlarmDecorations, ImageSurface, Region, Surface};
use crate::settings::RecordingSettings;

const BANNER_BG: Rgba<u8> = Rgba([17, 17, 17, 255]);
const BANNER_FG: Rgba<u8> = Rgba([255, 255, 255, 255]);
const REC_DOT: Rgba<u8> = Rgba([239, 68, 68, 255]);
const BANNER_TEXT_SCALE: u32 = 2;

/// Builds each recorded frame: watermark banner on top, live video below
/// it, then the detection overlay and, while alarming, the animated
/// decorations.
pub struct Compositor {
    surface: ImageSurface,
    video_width: u32,
    video_height: u32,
    banner_height: u32,
    watermark: String,
    decorations: AlarmDecorations,
    alarm_frame: u64,
}

impl Compositor {
    pub fn new(video_width: u32, video_height: u32, settings: &RecordingSettings) -> Self {
        let banner_height = settings.banner_height;
        Self {
            surface: ImageSurface::new(video_width, video_height + banner_height),
            video_width,
            video_height,
            banner_height,
            watermark: settings.watermark_text.clone(),
            decorations: AlarmDecorations::new(settings.alarm_caption.clone(), settings.refresh_rate_hz),
            alarm_frame: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.surface.size()
    }

    pub fn image(&self) -> &RgbaImage {
        self.surface.image()
    }

    /// Frames rendered in the current alarm episode; zero outside one.
    pub fn alarm_frame(&self) -> u64 {
        self.alarm_frame
    }

    pub fn render(&mut self, frame: Option<&Frame>, overlay: Option<&RgbaImage>, phase: AlarmPhase) {
        self.draw_banner();

        let top = self.banner_height as i64;
        match frame {
            Some(frame) => self.surface.draw_image(&frame.image, 0, top),
            None => self.surface.fill_rect(
                0.0,
                top as f32,
                self.video_width as f32,
                self.video_height as f32,
                Rgba([0, 0, 0, 255]),
            ),
        }
        if let Some(overlay) = overlay {
            if overlay.dimensions() == (self.video_width, self.video_height) {
                self.surface.draw_image(overlay, 0, top);
            }
        }

        if phase == AlarmPhase::Alarming {
            let region = Region {
                x: 0.0,
                y: self.banner_height as f32,
                width: self.video_width as f32,
                height: self.video_height as f32,
            };
            self.decorations.draw(&mut self.surface, self.alarm_frame, region);
            self.alarm_frame += 1;
        } else {
            self.alarm_frame = 0;
        }
    }

    fn draw_banner(&mut self) {
        let width = self.video_width as f32;
        let height = self.banner_height as f32;
        self.surface.fill_rect(0.0, 0.0, width, height, BANNER_BG);
        if self.banner_height == 0 {
            return;
        }

        let text_h = glyphs::text_height(BANNER_TEXT_SCALE) as f32;
        let text_w = glyphs::text_width(&self.watermark, BANNER_TEXT_SCALE) as f32;
        let y = (height - text_h) / 2.0;

        let dot = text_h;
        self.surface.fill_rect(12.0, y, dot, dot, REC_DOT);
        self.surface.fill_text(
            &self.watermark,
            (width - text_w) / 2.0,
            y,
            BANNER_TEXT_SCALE,
            BANNER_FG,
        );
    }
}
