//! Bubble sampling primitives.
//!
//! Fill decisions are made against the *local* background: each bubble is
//! compared to the bright part of its own surrounding annulus, so uneven
//! lighting or exposure shifts the cutoff with the paper instead of breaking
//! a global constant.

use image::GrayImage;

use super::config::SamplingConfig;

/// Measured fill for one bubble region.
#[derive(Debug, Clone, Copy)]
pub struct FillSample {
    /// Fraction of in-disc samples classified as ink, in [0, 1].
    pub fill_ratio: f32,
    /// Local background intensity estimate, in [0, 1].
    pub background: f32,
    /// Number of in-disc samples taken.
    pub n_samples: usize,
}

/// Sample a grayscale image at sub-pixel position using bilinear
/// interpolation. Returns intensity in [0, 1] or `None` out of bounds.
#[inline]
pub fn bilinear_sample_checked(img: &GrayImage, x: f32, y: f32) -> Option<f32> {
    let (w, h) = img.dimensions();
    if w < 2 || h < 2 || x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    if x0 >= w - 1 || y0 >= h - 1 {
        return None;
    }

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let stride = w as usize;
    let x0 = x0 as usize;
    let y0 = y0 as usize;
    let idx00 = y0 * stride + x0;
    let idx10 = idx00 + 1;
    let idx01 = idx00 + stride;
    let idx11 = idx01 + 1;

    let raw = img.as_raw();
    const INV_255: f32 = 1.0 / 255.0;
    let p00 = raw[idx00] as f32 * INV_255;
    let p10 = raw[idx10] as f32 * INV_255;
    let p01 = raw[idx01] as f32 * INV_255;
    let p11 = raw[idx11] as f32 * INV_255;

    Some(
        (1.0 - fx) * (1.0 - fy) * p00
            + fx * (1.0 - fy) * p10
            + (1.0 - fx) * fy * p01
            + fx * fy * p11,
    )
}

/// Mean intensity of the full image in [0, 1]. Used as the background
/// fallback when a bubble's annulus falls outside the frame.
pub fn mean_intensity(img: &GrayImage) -> f32 {
    let raw = img.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    let sum: u64 = raw.iter().map(|&v| v as u64).sum();
    (sum as f64 / (raw.len() as f64 * 255.0)) as f32
}

/// Measure the fill of one circular bubble at `center_px` / `radius_px`.
///
/// `fallback_background` stands in when the annulus yields no samples
/// (bubble at the image border).
pub fn sample_fill(
    img: &GrayImage,
    center_px: [f32; 2],
    radius_px: f32,
    cfg: &SamplingConfig,
    fallback_background: f32,
) -> FillSample {
    let radius = radius_px.max(1.0);
    let step = (radius * cfg.step_fraction).max(0.5);

    let mut disc = Vec::new();
    lattice_scan(center_px, radius, step, |x, y, d2| {
        if d2 <= radius * radius {
            if let Some(v) = bilinear_sample_checked(img, x, y) {
                disc.push(v);
            }
        }
    });

    let r_in = radius * cfg.annulus_inner;
    let r_out = radius * cfg.annulus_outer;
    let mut ring = Vec::new();
    // Sparser lattice: the annulus only anchors the background level.
    lattice_scan(center_px, r_out, step * 2.0, |x, y, d2| {
        if d2 >= r_in * r_in && d2 <= r_out * r_out {
            if let Some(v) = bilinear_sample_checked(img, x, y) {
                ring.push(v);
            }
        }
    });

    let background = bright_half_mean(&mut ring).unwrap_or(fallback_background);
    let cutoff = background * cfg.ink_contrast;
    let n_samples = disc.len();
    let fill_ratio = if n_samples == 0 {
        0.0
    } else {
        disc.iter().filter(|&&v| v < cutoff).count() as f32 / n_samples as f32
    };

    FillSample {
        fill_ratio,
        background,
        n_samples,
    }
}

/// Visit a square lattice of sub-pixel positions covering a disc of
/// `extent` around `center`. The callback receives position and squared
/// distance from the center.
fn lattice_scan(center: [f32; 2], extent: f32, step: f32, mut visit: impl FnMut(f32, f32, f32)) {
    let n = (extent / step).ceil() as i32;
    for iy in -n..=n {
        let dy = iy as f32 * step;
        for ix in -n..=n {
            let dx = ix as f32 * step;
            visit(center[0] + dx, center[1] + dy, dx * dx + dy * dy);
        }
    }
}

/// Mean of the brighter half of `values`. Robust against neighboring print
/// (question numbers, stray marks) dragging the background estimate down.
fn bright_half_mean(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let upper = &values[values.len() / 2..];
    Some(upper.iter().sum::<f32>() / upper.len() as f32)
}
