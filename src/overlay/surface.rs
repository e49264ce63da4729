use image::{imageops, Pixel, Rgba, RgbaImage};
use imageproc::{drawing::draw_hollow_rect_mut, drawing::draw_polygon_mut, point::Point, rect::Rect};

use super::glyphs;

pub type Color = Rgba<u8>;

pub const TRANSPARENT: Color = Rgba([0, 0, 0, 0]);

/// Minimal 2D drawing context. Coordinates are in surface pixels with the
/// origin at the top-left corner; anything outside the surface is clipped.
pub trait Surface {
    fn size(&self) -> (u32, u32);

    /// Resizes and clears.
    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self);

    /// Outline centred on the rectangle edge, `line_width` pixels thick.
    fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32, line_width: u32, color: Color);

    /// Alpha-blended fill.
    fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color);

    /// Bitmap text with its top-left corner at (`x`, `y`).
    fn fill_text(&mut self, text: &str, x: f32, y: f32, scale: u32, color: Color);

    fn fill_polygon(&mut self, points: &[(f32, f32)], color: Color);

    /// Composites `image` over the surface with its top-left at (`x`, `y`).
    fn draw_image(&mut self, image: &RgbaImage, x: i64, y: i64);
}

/// [`Surface`] backed by an in-memory RGBA raster.
#[derive(Debug, Clone)]
pub struct ImageSurface {
    image: RgbaImage,
}

impl ImageSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, TRANSPARENT),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Keeps the raster at `width`x`height`, resizing only on change.
    pub fn ensure_size(&mut self, width: u32, height: u32) {
        if self.size() != (width, height) {
            self.resize(width, height);
        }
    }
}

impl Surface for ImageSurface {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.image = RgbaImage::from_pixel(width, height, TRANSPARENT);
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = TRANSPARENT;
        }
    }

    fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32, line_width: u32, color: Color) {
        let half = (line_width / 2) as i32;
        let (x, y) = (x.round() as i32, y.round() as i32);
        let (w, h) = (width.round() as i32, height.round() as i32);

        for ring in 0..line_width as i32 {
            let inset = ring - half;
            let ring_w = w - 2 * inset;
            let ring_h = h - 2 * inset;
            if ring_w <= 0 || ring_h <= 0 {
                break;
            }
            let rect = Rect::at(x + inset, y + inset).of_size(ring_w as u32, ring_h as u32);
            draw_hollow_rect_mut(&mut self.image, rect, color);
        }
    }

    fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color) {
        let (img_w, img_h) = self.size();
        let x0 = x.round().max(0.0) as u32;
        let y0 = y.round().max(0.0) as u32;
        let x1 = ((x + width).round().max(0.0) as u32).min(img_w);
        let y1 = ((y + height).round().max(0.0) as u32).min(img_h);

        for py in y0..y1 {
            for px in x0..x1 {
                self.image.get_pixel_mut(px, py).blend(&color);
            }
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, scale: u32, color: Color) {
        let scale = scale.max(1);
        let cell = scale as f32;
        let mut pen_x = x;

        for ch in text.chars() {
            let rows = glyphs::glyph(ch);
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..glyphs::GLYPH_WIDTH {
                    if bits & (1 << (glyphs::GLYPH_WIDTH - 1 - col)) != 0 {
                        self.fill_rect(
                            pen_x + col as f32 * cell,
                            y + row as f32 * cell,
                            cell,
                            cell,
                            color,
                        );
                    }
                }
            }
            pen_x += glyphs::ADVANCE as f32 * cell;
        }
    }

    fn fill_polygon(&mut self, points: &[(f32, f32)], color: Color) {
        let mut poly: Vec<Point<i32>> = points
            .iter()
            .map(|&(x, y)| Point::new(x.round() as i32, y.round() as i32))
            .collect();
        poly.dedup();
        if poly.len() > 1 && poly.first() == poly.last() {
            poly.pop();
        }
        if poly.len() < 3 {
            return;
        }
        draw_polygon_mut(&mut self.image, &poly, color);
    }

    fn draw_image(&mut self, image: &RgbaImage, x: i64, y: i64) {
        imageops::overlay(&mut self.image, image, x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Color = Rgba([255, 0, 0, 255]);

    #[test]
    fn stroke_leaves_interior_untouched() {
        let mut surface = ImageSurface::new(40, 40);
        surface.stroke_rect(10.0, 10.0, 20.0, 20.0, 4, RED);

        assert_eq!(*surface.image().get_pixel(10, 20), RED);
        assert_eq!(*surface.image().get_pixel(8, 20), RED);
        assert_eq!(*surface.image().get_pixel(20, 20), TRANSPARENT);
    }

    #[test]
    fn fill_rect_blends_and_clips() {
        let mut surface = ImageSurface::new(10, 10);
        surface.fill_rect(-5.0, -5.0, 100.0, 100.0, Rgba([255, 255, 255, 255]));
        surface.fill_rect(0.0, 0.0, 5.0, 5.0, Rgba([0, 0, 0, 128]));

        let dimmed = surface.image().get_pixel(2, 2);
        assert!(dimmed[0] < 200 && dimmed[0] > 50);
        assert_eq!(surface.image().get_pixel(7, 7)[0], 255);
    }

    #[test]
    fn resize_clears() {
        let mut surface = ImageSurface::new(4, 4);
        surface.fill_rect(0.0, 0.0, 4.0, 4.0, RED);
        surface.resize(8, 6);

        assert_eq!(surface.size(), (8, 6));
        assert!(surface.image().pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn text_marks_pixels() {
        let mut surface = ImageSurface::new(40, 12);
        surface.fill_text("HI", 1.0, 1.0, 1, RED);
        assert!(surface.image().pixels().any(|p| *p == RED));
    }
}
