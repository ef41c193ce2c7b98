//! Sheet registration: locate the template's anchor discs in the image and
//! fit the affine transform from page millimeters to image pixels.
//!
//! Candidate anchors are dark connected components gated by the configured
//! diameter range and roundness, matched to template anchors by normalized
//! page position. The transform is an overdetermined least-squares fit, so
//! the anchor reprojection residual doubles as an alignment quality measure.

use image::GrayImage;
use nalgebra::{DMatrix, DVector};

use crate::sheet_layout::SheetTemplate;

use super::config::RegistrationConfig;
use super::sampling::mean_intensity;
use super::DecodeError;

/// Affine page-mm -> image-px transform, row-major 2x3.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SheetTransform {
    pub coeffs: [[f64; 3]; 2],
}

impl SheetTransform {
    /// Map a page-millimeter point into image pixels.
    #[inline]
    pub fn apply(&self, point_mm: [f32; 2]) -> [f32; 2] {
        let x = point_mm[0] as f64;
        let y = point_mm[1] as f64;
        let [r0, r1] = self.coeffs;
        [
            (r0[0] * x + r0[1] * y + r0[2]) as f32,
            (r1[0] * x + r1[1] * y + r1[2]) as f32,
        ]
    }

    /// Isotropic scale estimate in pixels per millimeter.
    ///
    /// Square root of the absolute determinant of the linear part; exact for
    /// rotation+scale, a sound average under mild shear.
    pub fn scale_px_per_mm(&self) -> f32 {
        let [r0, r1] = self.coeffs;
        let det = r0[0] * r1[1] - r0[1] * r1[0];
        det.abs().sqrt() as f32
    }
}

/// One matched anchor with its post-fit reprojection residual.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnchorObservation {
    pub template_mm: [f32; 2],
    pub image_px: [f32; 2],
    pub residual_px: f32,
}

/// Registration outcome for one sheet.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Registration {
    pub transform: SheetTransform,
    pub anchors: Vec<AnchorObservation>,
    pub rms_residual_px: f32,
    /// `1 - rms / nominal_anchor_radius_px`, clamped to [0, 1].
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct Blob {
    centroid: [f32; 2],
    area: usize,
}

/// Register `img` against `template`.
pub(crate) fn register(
    img: &GrayImage,
    template: &SheetTemplate,
    cfg: &RegistrationConfig,
) -> Result<Registration, DecodeError> {
    let (width, height) = img.dimensions();
    if width < 2 || height < 2 {
        return Err(DecodeError::ImageTooSmall { width, height });
    }

    let expected = template.anchors().len();
    let dark_cutoff = mean_intensity(img) * cfg.dark_fraction;
    let blobs = find_dark_blobs(img, dark_cutoff, cfg);
    tracing::debug!(
        n_blobs = blobs.len(),
        dark_cutoff,
        "anchor candidate scan complete"
    );

    let matches = match_anchors(&blobs, img.dimensions(), template, cfg)?;
    let transform = fit_affine(&matches)?;

    let mut anchors = Vec::with_capacity(matches.len());
    let mut sum_sq = 0.0f32;
    for (template_mm, image_px) in &matches {
        let predicted = transform.apply(*template_mm);
        let dx = predicted[0] - image_px[0];
        let dy = predicted[1] - image_px[1];
        let residual_px = (dx * dx + dy * dy).sqrt();
        sum_sq += residual_px * residual_px;
        anchors.push(AnchorObservation {
            template_mm: *template_mm,
            image_px: *image_px,
            residual_px,
        });
    }
    let rms_residual_px = (sum_sq / matches.len() as f32).sqrt();

    let nominal_radius_px = template.nominal_anchor_radius_mm() * transform.scale_px_per_mm();
    let confidence = if nominal_radius_px > 0.0 {
        (1.0 - rms_residual_px / nominal_radius_px).clamp(0.0, 1.0)
    } else {
        0.0
    };

    tracing::info!(
        matched = anchors.len(),
        expected,
        rms_residual_px,
        confidence,
        "sheet registered"
    );

    if confidence < cfg.min_alignment_confidence {
        return Err(DecodeError::AlignmentFailed {
            detail: format!(
                "anchor reprojection rms {rms_residual_px:.2}px exceeds tolerance for \
                 nominal anchor radius {nominal_radius_px:.2}px"
            ),
            matched: anchors.len(),
            expected,
            confidence,
        });
    }

    Ok(Registration {
        transform,
        anchors,
        rms_residual_px,
        confidence,
    })
}

/// Connected-component scan for dark, round, anchor-sized blobs.
fn find_dark_blobs(img: &GrayImage, dark_cutoff: f32, cfg: &RegistrationConfig) -> Vec<Blob> {
    let (width, height) = img.dimensions();
    let w = width as usize;
    let h = height as usize;
    let raw = img.as_raw();
    let cutoff = (dark_cutoff * 255.0) as u8;

    let [d_min, d_max] = cfg.anchor_scale.diameter_range_px();
    let min_area = (std::f32::consts::PI * d_min * d_min / 4.0 * 0.5) as usize;
    let max_area = (std::f32::consts::PI * d_max * d_max / 4.0 * 1.5) as usize;

    let mut visited = vec![false; w * h];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();

    for start in 0..w * h {
        if visited[start] || raw[start] >= cutoff {
            continue;
        }

        let mut area = 0usize;
        let mut sum_x = 0.0f64;
        let mut sum_y = 0.0f64;
        let mut min_x = usize::MAX;
        let mut max_x = 0usize;
        let mut min_y = usize::MAX;
        let mut max_y = 0usize;

        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let x = idx % w;
            let y = idx / w;
            area += 1;
            sum_x += x as f64;
            sum_y += y as f64;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            let x0 = x.saturating_sub(1);
            let y0 = y.saturating_sub(1);
            for ny in y0..=(y + 1).min(h - 1) {
                for nx in x0..=(x + 1).min(w - 1) {
                    let nidx = ny * w + nx;
                    if !visited[nidx] && raw[nidx] < cutoff {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }

        if area < min_area || area > max_area {
            continue;
        }
        let bw = (max_x - min_x + 1) as f32;
        let bh = (max_y - min_y + 1) as f32;
        let bbox_fill = area as f32 / (bw * bh);
        let aspect = bw.max(bh) / bw.min(bh);
        if bbox_fill < cfg.min_blob_fill || aspect > cfg.max_blob_aspect {
            continue;
        }

        blobs.push(Blob {
            centroid: [(sum_x / area as f64) as f32, (sum_y / area as f64) as f32],
            area,
        });
    }

    blobs
}

/// Greedy nearest-candidate assignment in normalized page coordinates.
///
/// Every template anchor must find a distinct candidate within
/// `max_match_distance`; a torn or occluded corner surfaces here rather
/// than as a silently skewed transform.
fn match_anchors(
    blobs: &[Blob],
    image_dims: (u32, u32),
    template: &SheetTemplate,
    cfg: &RegistrationConfig,
) -> Result<Vec<([f32; 2], [f32; 2])>, DecodeError> {
    let expected = template.anchors().len();
    let [sheet_w, sheet_h] = template.sheet_size_mm();
    let (img_w, img_h) = image_dims;

    let mut used = vec![false; blobs.len()];
    let mut matches = Vec::with_capacity(expected);

    for (anchor_idx, anchor) in template.anchors().iter().enumerate() {
        let target = [
            anchor.center_mm[0] / sheet_w,
            anchor.center_mm[1] / sheet_h,
        ];

        let mut best: Option<(usize, f32)> = None;
        for (blob_idx, blob) in blobs.iter().enumerate() {
            if used[blob_idx] {
                continue;
            }
            let pos = [
                blob.centroid[0] / img_w as f32,
                blob.centroid[1] / img_h as f32,
            ];
            let dx = pos[0] - target[0];
            let dy = pos[1] - target[1];
            let dist = (dx * dx + dy * dy).sqrt();
            if best.is_none_or(|(_, d)| dist < d) {
                best = Some((blob_idx, dist));
            }
        }

        match best {
            Some((blob_idx, dist)) if dist <= cfg.max_match_distance => {
                used[blob_idx] = true;
                tracing::trace!(
                    anchor_idx,
                    blob_area = blobs[blob_idx].area,
                    dist,
                    "anchor matched"
                );
                matches.push((anchor.center_mm, blobs[blob_idx].centroid));
            }
            _ => {
                return Err(DecodeError::AlignmentFailed {
                    detail: format!("no candidate blob near anchor#{anchor_idx}"),
                    matched: matches.len(),
                    expected,
                    confidence: 0.0,
                });
            }
        }
    }

    Ok(matches)
}

/// Least-squares affine from (mm, px) correspondences. Needs >= 3 points;
/// template validation guarantees they are not collinear.
fn fit_affine(matches: &[([f32; 2], [f32; 2])]) -> Result<SheetTransform, DecodeError> {
    let n = matches.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 6);
    let mut b = DVector::<f64>::zeros(2 * n);
    for (i, (mm, px)) in matches.iter().enumerate() {
        let x = mm[0] as f64;
        let y = mm[1] as f64;
        a[(2 * i, 0)] = x;
        a[(2 * i, 1)] = y;
        a[(2 * i, 2)] = 1.0;
        a[(2 * i + 1, 3)] = x;
        a[(2 * i + 1, 4)] = y;
        a[(2 * i + 1, 5)] = 1.0;
        b[2 * i] = px[0] as f64;
        b[2 * i + 1] = px[1] as f64;
    }

    let svd = a.svd(true, true);
    let solution = svd.solve(&b, 1e-12).map_err(|_| DecodeError::AlignmentFailed {
        detail: "degenerate anchor geometry".to_string(),
        matched: n,
        expected: n,
        confidence: 0.0,
    })?;

    Ok(SheetTransform {
        coeffs: [
            [solution[0], solution[1], solution[2]],
            [solution[3], solution[4], solution[5]],
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omr::config::OmrConfig;
    use crate::test_utils::{draw_disc, render_sheet, SheetArt};
    use crate::sheet_layout::GridLayoutSpec;

    fn small_template() -> SheetTemplate {
        GridLayoutSpec {
            template_id: "reg-test".to_string(),
            questions: 5,
            options_per_question: 4,
            sheet_size_mm: [100.0, 100.0],
            margin_mm: 12.0,
            anchor_radius_mm: 3.0,
            ..GridLayoutSpec::default()
        }
        .generate()
        .expect("valid template")
    }

    #[test]
    fn identity_scale_registration_recovers_positions() {
        let template = small_template();
        let art = SheetArt::new(&template, 2.0);
        let img = render_sheet(&template, &art, &[]);

        let cfg = OmrConfig::default();
        let reg = register(&img, &template, &cfg.registration).expect("registers");
        assert!(reg.confidence > 0.8, "confidence {}", reg.confidence);
        assert_eq!(reg.anchors.len(), 4);

        // A page point must land where the renderer put it.
        let expected = art.place([50.0, 50.0]);
        let px = reg.transform.apply([50.0, 50.0]);
        assert!((px[0] - expected[0]).abs() < 1.0);
        assert!((px[1] - expected[1]).abs() < 1.0);
        assert!((reg.transform.scale_px_per_mm() - 2.0).abs() < 0.05);
    }

    #[test]
    fn rotated_sheet_still_registers() {
        let template = small_template();
        let art = SheetArt::new(&template, 2.0).with_rotation_deg(3.0);
        let img = render_sheet(&template, &art, &[]);

        let cfg = OmrConfig::default();
        let reg = register(&img, &template, &cfg.registration).expect("registers");
        assert!(reg.confidence > 0.7, "confidence {}", reg.confidence);

        let expected = art.place([50.0, 50.0]);
        let px = reg.transform.apply([50.0, 50.0]);
        assert!((px[0] - expected[0]).abs() < 1.5);
        assert!((px[1] - expected[1]).abs() < 1.5);
    }

    #[test]
    fn missing_anchor_fails_with_context() {
        let template = small_template();
        let art = SheetArt::new(&template, 2.0);
        let mut img = render_sheet(&template, &art, &[]);
        // Paint over one corner anchor.
        let gone = art.place(template.anchors()[3].center_mm);
        draw_disc(&mut img, gone, 10.0, 250);

        let cfg = OmrConfig::default();
        let err = register(&img, &template, &cfg.registration).expect_err("must fail");
        match err {
            DecodeError::AlignmentFailed {
                matched, expected, ..
            } => {
                assert_eq!(expected, 4);
                assert!(matched < 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn displaced_anchor_lowers_confidence_below_strict_gate() {
        let template = small_template();
        let art = SheetArt::new(&template, 2.0);
        let mut img = render_sheet(&template, &art, &[]);

        // Re-draw one anchor 6px off its true position: the affine fit can
        // no longer explain all four corners at once.
        let anchor = template.anchors()[0];
        let true_px = art.place(anchor.center_mm);
        draw_disc(&mut img, true_px, 9.0, 250);
        draw_disc(
            &mut img,
            [true_px[0] + 6.0, true_px[1]],
            anchor.radius_mm * 2.0,
            20,
        );

        let mut cfg = OmrConfig::default();
        cfg.registration.min_alignment_confidence = 0.95;
        let err = register(&img, &template, &cfg.registration).expect_err("below gate");
        match err {
            DecodeError::AlignmentFailed { confidence, .. } => {
                assert!(confidence < 0.95, "confidence {confidence}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
