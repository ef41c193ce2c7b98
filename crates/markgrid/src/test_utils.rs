//! Shared test utilities for image-based unit tests: synthetic sheet
//! rendering with optional rotation/scale placement, plus a gaussian blur
//! helper for degraded-scan cases.

use image::{GrayImage, Luma};

use crate::sheet_layout::SheetTemplate;

pub(crate) const PAGE_VALUE: u8 = 250;
pub(crate) const ANCHOR_INK: u8 = 20;
pub(crate) const BUBBLE_INK: u8 = 40;

const PAD_PX: f32 = 16.0;

/// Uniform gray page.
pub(crate) fn uniform_page(w: u32, h: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(w, h, Luma([value]))
}

/// Paint a filled disc over the image.
pub(crate) fn draw_disc(img: &mut GrayImage, center: [f32; 2], radius: f32, value: u8) {
    let (w, h) = img.dimensions();
    let x0 = ((center[0] - radius).floor().max(0.0)) as u32;
    let y0 = ((center[1] - radius).floor().max(0.0)) as u32;
    let x1 = ((center[0] + radius).ceil() as u32).min(w.saturating_sub(1));
    let y1 = ((center[1] + radius).ceil() as u32).min(h.saturating_sub(1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 - center[0];
            let dy = y as f32 - center[1];
            if dx * dx + dy * dy <= radius * radius {
                img.put_pixel(x, y, Luma([value]));
            }
        }
    }
}

/// Placement of a page onto a synthetic scan: pixels-per-mm scale plus an
/// optional rotation about the page center.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SheetArt {
    sheet_size_mm: [f32; 2],
    scale: f32,
    rot_rad: f32,
}

impl SheetArt {
    pub fn new(template: &SheetTemplate, scale_px_per_mm: f32) -> Self {
        Self {
            sheet_size_mm: template.sheet_size_mm(),
            scale: scale_px_per_mm,
            rot_rad: 0.0,
        }
    }

    pub fn with_rotation_deg(mut self, degrees: f32) -> Self {
        self.rot_rad = degrees.to_radians();
        self
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Output image dimensions covering the placed page.
    pub fn dims(&self) -> (u32, u32) {
        let [w, h] = self.sheet_size_mm;
        (
            (w * self.scale + 2.0 * PAD_PX).ceil() as u32,
            (h * self.scale + 2.0 * PAD_PX).ceil() as u32,
        )
    }

    /// Map a page-millimeter point to its pixel position in the scan.
    pub fn place(&self, mm: [f32; 2]) -> [f32; 2] {
        let [w, h] = self.sheet_size_mm;
        let cx = w * 0.5;
        let cy = h * 0.5;
        let dx = mm[0] - cx;
        let dy = mm[1] - cy;
        let (sin, cos) = self.rot_rad.sin_cos();
        let rx = dx * cos - dy * sin + cx;
        let ry = dx * sin + dy * cos + cy;
        [rx * self.scale + PAD_PX, ry * self.scale + PAD_PX]
    }
}

/// Render a synthetic scan of `template`: bright page, dark anchor discs,
/// and the given `(question_id, option_label)` bubbles filled.
pub(crate) fn render_sheet(
    template: &SheetTemplate,
    art: &SheetArt,
    filled: &[(&str, &str)],
) -> GrayImage {
    let (w, h) = art.dims();
    let mut img = uniform_page(w, h, PAGE_VALUE);

    for anchor in template.anchors() {
        draw_disc(
            &mut img,
            art.place(anchor.center_mm),
            anchor.radius_mm * art.scale(),
            ANCHOR_INK,
        );
    }

    for (question_id, label) in filled {
        let question = template
            .question(question_id)
            .unwrap_or_else(|| panic!("unknown question '{question_id}' in test sheet"));
        let option = question
            .options
            .iter()
            .find(|o| o.label == *label)
            .unwrap_or_else(|| panic!("unknown option '{label}' in '{question_id}'"));
        draw_disc(
            &mut img,
            art.place(option.center_mm),
            option.radius_mm * art.scale(),
            BUBBLE_INK,
        );
    }

    img
}

/// Gaussian-blur a `GrayImage` via `imageproc`.
pub(crate) fn blur_gray(img: &GrayImage, sigma: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut f = image::ImageBuffer::<Luma<f32>, Vec<f32>>::new(w, h);
    for y in 0..h {
        for x in 0..w {
            f.put_pixel(x, y, Luma([img.get_pixel(x, y)[0] as f32 / 255.0]));
        }
    }
    let blurred = imageproc::filter::gaussian_blur_f32(&f, sigma);
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = blurred.get_pixel(x, y)[0].clamp(0.0, 1.0);
            out.put_pixel(x, y, Luma([(v * 255.0).round() as u8]));
        }
    }
    out
}
