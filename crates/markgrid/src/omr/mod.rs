//! Optical mark decoding: image + template -> per-bubble fill readings.
//!
//! The pipeline stages are:
//!
//! 1. **Registration** – locate the sheet's anchor discs and fit the
//!    page-mm -> image-px affine transform.
//! 2. **Sampling** – measure each bubble's fill ratio against its local
//!    background.
//! 3. **Thresholding** – classify each option as unmarked, marked, or
//!    ambiguous.
//! 4. **Consolidation** – reduce each question's options to one reading,
//!    flagging close calls instead of forcing a winner.
//!
//! The processor is stateless and never mutates its inputs; decoding the
//! same image twice yields identical matrices.

pub mod config;
mod registration;
mod sampling;

use image::GrayImage;
use thiserror::Error;

use crate::sheet_layout::SheetTemplate;

pub use config::{AnchorScalePrior, OmrConfig, RegistrationConfig, SamplingConfig};
pub use registration::{AnchorObservation, Registration, SheetTransform};
pub use sampling::{bilinear_sample_checked, mean_intensity, sample_fill, FillSample};

/// Decode failures. These abort the affected sheet only; ambiguous or
/// multiple marks are readings, not errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(
        "could not register sheet: {detail} ({matched}/{expected} anchors, confidence {confidence:.2})"
    )]
    AlignmentFailed {
        detail: String,
        matched: usize,
        expected: usize,
        confidence: f32,
    },
    #[error("image too small to register ({width}x{height})")]
    ImageTooSmall { width: u32, height: u32 },
}

/// Three-way per-option decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MarkState {
    Unmarked,
    Marked,
    Ambiguous,
}

/// Fill measurement and decision for one option bubble.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OptionMark {
    pub label: String,
    /// Fill confidence in [0, 1].
    pub fill_ratio: f32,
    pub state: MarkState,
}

/// Consolidated per-question reading.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QuestionReading {
    /// No option above the unmarked threshold.
    Blank,
    /// Exactly one clear winner.
    Single { label: String },
    /// More than one confidently marked option, too close to call.
    MultiMark,
    /// Best candidate not confidently filled, or a contender within the
    /// margin; never silently resolved.
    Ambiguous,
}

/// All option readings for one question, in template order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QuestionMarks {
    pub question_id: String,
    pub options: Vec<OptionMark>,
    pub reading: QuestionReading,
}

/// Decoded mark readings for one sheet, in template question order.
///
/// Serializable so callers may retain it for re-grading; nothing here is
/// persisted by the library itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MarkMatrix {
    pub template_id: String,
    pub questions: Vec<QuestionMarks>,
    pub registration: Registration,
}

impl MarkMatrix {
    /// Look up one question's marks by id.
    pub fn question(&self, question_id: &str) -> Option<&QuestionMarks> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }
}

/// How a captured frame is rotated relative to an upright sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Orientation {
    #[default]
    Upright,
    /// Rotated 90 degrees clockwise.
    QuarterTurn,
    HalfTurn,
    /// Rotated 270 degrees clockwise.
    ThreeQuarterTurn,
}

impl Orientation {
    /// Return an upright copy of `img` (or a plain copy when already upright).
    pub fn normalize(self, img: &GrayImage) -> GrayImage {
        match self {
            Orientation::Upright => img.clone(),
            Orientation::QuarterTurn => image::imageops::rotate270(img),
            Orientation::HalfTurn => image::imageops::rotate180(img),
            Orientation::ThreeQuarterTurn => image::imageops::rotate90(img),
        }
    }
}

/// Mark decoder. Create once, decode many sheets; safe to share across
/// threads since decoding holds no mutable state.
#[derive(Debug, Clone, Default)]
pub struct OmrProcessor {
    config: OmrConfig,
}

impl OmrProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: OmrConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OmrConfig {
        &self.config
    }

    /// Mutable access to configuration for post-construction tuning.
    pub fn config_mut(&mut self) -> &mut OmrConfig {
        &mut self.config
    }

    /// Decode one upright grayscale sheet against its template.
    pub fn decode(
        &self,
        img: &GrayImage,
        template: &SheetTemplate,
    ) -> Result<MarkMatrix, DecodeError> {
        let cfg = self.config.normalized();
        let registration = registration::register(img, template, &cfg.registration)?;
        let scale = registration.transform.scale_px_per_mm();
        let fallback_background = mean_intensity(img);

        let mut questions = Vec::with_capacity(template.question_count());
        for question in template.questions() {
            let options: Vec<OptionMark> = question
                .options
                .iter()
                .map(|option| {
                    let center_px = registration.transform.apply(option.center_mm);
                    let sample = sample_fill(
                        img,
                        center_px,
                        option.radius_mm * scale,
                        &cfg.sampling,
                        fallback_background,
                    );
                    OptionMark {
                        label: option.label.clone(),
                        fill_ratio: sample.fill_ratio,
                        state: classify(sample.fill_ratio, &cfg),
                    }
                })
                .collect();

            let reading = consolidate(&options, &cfg);
            tracing::trace!(question = %question.id, ?reading, "question consolidated");
            questions.push(QuestionMarks {
                question_id: question.id.clone(),
                options,
                reading,
            });
        }

        tracing::info!(
            template = template.id(),
            n_questions = questions.len(),
            confidence = registration.confidence,
            "sheet decoded"
        );

        Ok(MarkMatrix {
            template_id: template.id().to_string(),
            questions,
            registration,
        })
    }

    /// Decode a captured frame, bringing it upright first per the capture
    /// device's orientation metadata.
    pub fn decode_oriented(
        &self,
        img: &GrayImage,
        orientation: Orientation,
        template: &SheetTemplate,
    ) -> Result<MarkMatrix, DecodeError> {
        if orientation == Orientation::Upright {
            self.decode(img, template)
        } else {
            let upright = orientation.normalize(img);
            self.decode(&upright, template)
        }
    }
}

fn classify(fill_ratio: f32, cfg: &OmrConfig) -> MarkState {
    if fill_ratio >= cfg.high_threshold {
        MarkState::Marked
    } else if fill_ratio <= cfg.low_threshold {
        MarkState::Unmarked
    } else {
        MarkState::Ambiguous
    }
}

/// Reduce one question's option states to a single reading.
///
/// Candidates are the options not clearly unmarked, ranked by fill. The top
/// candidate wins only when it is confidently marked *and* leads the
/// runner-up by at least `min_margin_between_options`; anything closer is
/// reported as multi-mark or ambiguous, never resolved by fiat.
fn consolidate(options: &[OptionMark], cfg: &OmrConfig) -> QuestionReading {
    let mut candidates: Vec<&OptionMark> = options
        .iter()
        .filter(|o| o.state != MarkState::Unmarked)
        .collect();
    candidates.sort_by(|a, b| b.fill_ratio.total_cmp(&a.fill_ratio));

    let Some(top) = candidates.first() else {
        return QuestionReading::Blank;
    };
    if top.state != MarkState::Marked {
        return QuestionReading::Ambiguous;
    }

    match candidates.get(1) {
        None => QuestionReading::Single {
            label: top.label.clone(),
        },
        Some(second) => {
            let margin = top.fill_ratio - second.fill_ratio;
            if margin >= cfg.min_margin_between_options {
                QuestionReading::Single {
                    label: top.label.clone(),
                }
            } else if second.state == MarkState::Marked {
                QuestionReading::MultiMark
            } else {
                QuestionReading::Ambiguous
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet_layout::GridLayoutSpec;
    use crate::test_utils::{blur_gray, draw_disc, render_sheet, SheetArt};

    fn template() -> SheetTemplate {
        GridLayoutSpec {
            template_id: "omr-test".to_string(),
            questions: 4,
            options_per_question: 4,
            sheet_size_mm: [120.0, 120.0],
            margin_mm: 12.0,
            anchor_radius_mm: 3.0,
            ..GridLayoutSpec::default()
        }
        .generate()
        .expect("valid template")
    }

    fn option_center(template: &SheetTemplate, question: &str, label: &str) -> ([f32; 2], f32) {
        let q = template.question(question).expect("question");
        let o = q.options.iter().find(|o| o.label == label).expect("option");
        (o.center_mm, o.radius_mm)
    }

    #[test]
    fn clean_sheet_decodes_single_marks() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let img = render_sheet(&template, &art, &[("q01", "A"), ("q02", "C")]);

        let marks = OmrProcessor::new().decode(&img, &template).expect("decodes");
        assert_eq!(marks.template_id, "omr-test");
        assert_eq!(marks.questions.len(), 4);
        assert_eq!(
            marks.question("q01").unwrap().reading,
            QuestionReading::Single {
                label: "A".to_string()
            }
        );
        assert_eq!(
            marks.question("q02").unwrap().reading,
            QuestionReading::Single {
                label: "C".to_string()
            }
        );
        assert_eq!(marks.question("q03").unwrap().reading, QuestionReading::Blank);
        assert_eq!(marks.question("q04").unwrap().reading, QuestionReading::Blank);

        let q1 = marks.question("q01").unwrap();
        assert!(q1.options[0].fill_ratio > 0.85);
        assert_eq!(q1.options[0].state, MarkState::Marked);
        assert_eq!(q1.options[1].state, MarkState::Unmarked);
    }

    #[test]
    fn two_full_marks_read_as_multi_mark() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let img = render_sheet(&template, &art, &[("q01", "A"), ("q01", "D")]);

        let marks = OmrProcessor::new().decode(&img, &template).expect("decodes");
        assert_eq!(marks.question("q01").unwrap().reading, QuestionReading::MultiMark);
    }

    #[test]
    fn partial_fill_reads_ambiguous() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let mut img = render_sheet(&template, &art, &[]);
        // Fill ~half of q01/B by area.
        let (center, radius) = option_center(&template, "q01", "B");
        draw_disc(
            &mut img,
            art.place(center),
            radius * art.scale() * 0.7,
            crate::test_utils::BUBBLE_INK,
        );

        let marks = OmrProcessor::new().decode(&img, &template).expect("decodes");
        let q1 = marks.question("q01").unwrap();
        assert_eq!(q1.options[1].state, MarkState::Ambiguous);
        assert_eq!(q1.reading, QuestionReading::Ambiguous);
    }

    #[test]
    fn full_mark_beats_faint_smudge_by_margin() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let mut img = render_sheet(&template, &art, &[("q01", "A")]);
        // Light smudge on q01/C, well below the leader.
        let (center, radius) = option_center(&template, "q01", "C");
        draw_disc(
            &mut img,
            art.place(center),
            radius * art.scale() * 0.55,
            crate::test_utils::BUBBLE_INK,
        );

        let marks = OmrProcessor::new().decode(&img, &template).expect("decodes");
        assert_eq!(
            marks.question("q01").unwrap().reading,
            QuestionReading::Single {
                label: "A".to_string()
            }
        );
    }

    #[test]
    fn blurred_scan_still_decodes() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let img = blur_gray(&render_sheet(&template, &art, &[("q02", "B")]), 1.0);

        let marks = OmrProcessor::new().decode(&img, &template).expect("decodes");
        assert_eq!(
            marks.question("q02").unwrap().reading,
            QuestionReading::Single {
                label: "B".to_string()
            }
        );
    }

    #[test]
    fn decoding_twice_is_identical() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let img = render_sheet(&template, &art, &[("q01", "A"), ("q03", "D")]);

        let processor = OmrProcessor::new();
        let first = processor.decode(&img, &template).expect("decodes");
        let second = processor.decode(&img, &template).expect("decodes");
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn half_turn_capture_normalizes_before_decode() {
        let template = template();
        let art = SheetArt::new(&template, 2.0);
        let upright = render_sheet(&template, &art, &[("q01", "A")]);
        let captured = image::imageops::rotate180(&upright);

        let marks = OmrProcessor::new()
            .decode_oriented(&captured, Orientation::HalfTurn, &template)
            .expect("decodes");
        assert_eq!(
            marks.question("q01").unwrap().reading,
            QuestionReading::Single {
                label: "A".to_string()
            }
        );
    }

    #[test]
    fn consolidation_close_call_between_marked_options() {
        let cfg = OmrConfig::default();
        let options = vec![
            OptionMark {
                label: "A".to_string(),
                fill_ratio: 0.9,
                state: MarkState::Marked,
            },
            OptionMark {
                label: "B".to_string(),
                fill_ratio: 0.8,
                state: MarkState::Marked,
            },
        ];
        assert_eq!(consolidate(&options, &cfg), QuestionReading::MultiMark);
    }

    #[test]
    fn consolidation_wide_gap_resolves_to_darker() {
        let cfg = OmrConfig::default();
        let options = vec![
            OptionMark {
                label: "A".to_string(),
                fill_ratio: 0.95,
                state: MarkState::Marked,
            },
            OptionMark {
                label: "B".to_string(),
                fill_ratio: 0.6,
                state: MarkState::Marked,
            },
        ];
        assert_eq!(
            consolidate(&options, &cfg),
            QuestionReading::Single {
                label: "A".to_string()
            }
        );
    }

    #[test]
    fn consolidation_ambiguous_contender_blocks_single() {
        let cfg = OmrConfig::default();
        let options = vec![
            OptionMark {
                label: "A".to_string(),
                fill_ratio: 0.6,
                state: MarkState::Marked,
            },
            OptionMark {
                label: "B".to_string(),
                fill_ratio: 0.5,
                state: MarkState::Ambiguous,
            },
        ];
        assert_eq!(consolidate(&options, &cfg), QuestionReading::Ambiguous);
    }
}
