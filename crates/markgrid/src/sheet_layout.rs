//! Answer-sheet layout model.
//!
//! A [`SheetTemplate`] describes one printed sheet in millimeters: reference
//! page size, fiducial anchor discs used for registration, and the ordered
//! question/option bubble geometry. Templates are interchanged as
//! schema-tagged JSON documents (`markgrid.template.v1`) and validated once
//! on load; downstream stages assume a validated template.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

const TEMPLATE_SCHEMA_V1: &str = "markgrid.template.v1";

/// Minimum anchor-triangle area as a fraction of the page area. Anchors that
/// are (near-)collinear cannot pin down an affine transform.
const MIN_ANCHOR_TRIANGLE_FRAC: f32 = 0.005;

/// A fiducial anchor disc printed on the sheet, in page millimeters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnchorDisc {
    pub center_mm: [f32; 2],
    pub radius_mm: f32,
}

/// One selectable bubble: label plus circular region in page millimeters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptionRegion {
    pub label: String,
    pub center_mm: [f32; 2],
    pub radius_mm: f32,
}

/// One question: identifier plus its ordered option bubbles.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Question {
    pub id: String,
    pub options: Vec<OptionRegion>,
}

/// Template invariant violations.
///
/// Any of these aborts the load of the offending template only; a template
/// that validated once never re-validates.
#[derive(Debug, Error, PartialEq)]
pub enum TemplateValidationError {
    #[error("unsupported template schema '{found}' (expected '{expected}')")]
    UnsupportedSchema { found: String, expected: String },
    #[error("template id must not be empty")]
    EmptyTemplateId,
    #[error("sheet size must be finite and positive, got {size_mm:?}")]
    BadSheetSize { size_mm: [f32; 2] },
    #[error("template '{template_id}' needs at least 3 anchors, found {found}")]
    TooFewAnchors { template_id: String, found: usize },
    #[error("template '{template_id}' anchors are collinear; registration would be degenerate")]
    CollinearAnchors { template_id: String },
    #[error("template '{template_id}' has no questions")]
    NoQuestions { template_id: String },
    #[error("duplicate question id '{question_id}'")]
    DuplicateQuestionId { question_id: String },
    #[error("question '{question_id}' has no options")]
    NoOptions { question_id: String },
    #[error("duplicate option label '{label}' in question '{question_id}'")]
    DuplicateOptionLabel { question_id: String, label: String },
    #[error("region '{owner}' out of sheet bounds (center {center_mm:?}, radius {radius_mm})")]
    OutOfBounds {
        owner: String,
        center_mm: [f32; 2],
        radius_mm: f32,
    },
    #[error("options '{first}' and '{second}' overlap in question '{question_id}'")]
    OverlappingOptions {
        question_id: String,
        first: String,
        second: String,
    },
    #[error("grid layout does not fit the page: {reason}")]
    GridDoesNotFit { reason: String },
}

/// Serialized template document.
///
/// Distinct from [`SheetTemplate`]: a definition is whatever a store handed
/// us, a template is a definition that passed validation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDefinition {
    pub schema: String,
    pub id: String,
    pub sheet_size_mm: [f32; 2],
    pub anchors: Vec<AnchorDisc>,
    pub questions: Vec<Question>,
}

/// Validated runtime sheet template. Read-only after construction.
#[derive(Debug, Clone)]
pub struct SheetTemplate {
    id: String,
    sheet_size_mm: [f32; 2],
    anchors: Vec<AnchorDisc>,
    questions: Vec<Question>,

    /// Fast lookup: question id -> index into `questions`.
    question_index: HashMap<String, usize>,
}

impl SheetTemplate {
    /// Validate a definition document into a runtime template.
    pub fn from_definition(def: TemplateDefinition) -> Result<Self, TemplateValidationError> {
        if def.schema != TEMPLATE_SCHEMA_V1 {
            return Err(TemplateValidationError::UnsupportedSchema {
                found: def.schema,
                expected: TEMPLATE_SCHEMA_V1.to_string(),
            });
        }
        validate_geometry(&def)?;

        let question_index = def
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| (q.id.clone(), i))
            .collect();

        Ok(Self {
            id: def.id,
            sheet_size_mm: def.sheet_size_mm,
            anchors: def.anchors,
            questions: def.questions,
            question_index,
        })
    }

    /// Load and validate a template from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let def: TemplateDefinition = serde_json::from_str(&data)?;
        Self::from_definition(def).map_err(Into::into)
    }

    /// Serialize back into a definition document (schema tag included).
    pub fn to_definition(&self) -> TemplateDefinition {
        TemplateDefinition {
            schema: TEMPLATE_SCHEMA_V1.to_string(),
            id: self.id.clone(),
            sheet_size_mm: self.sheet_size_mm,
            anchors: self.anchors.clone(),
            questions: self.questions.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reference page size `[width, height]` in millimeters.
    pub fn sheet_size_mm(&self) -> [f32; 2] {
        self.sheet_size_mm
    }

    pub fn anchors(&self) -> &[AnchorDisc] {
        &self.anchors
    }

    /// Questions in sheet order.
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Look up one question by id.
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.question_index
            .get(question_id)
            .map(|&idx| &self.questions[idx])
    }

    /// Nominal anchor radius (mean over anchors) in millimeters.
    pub fn nominal_anchor_radius_mm(&self) -> f32 {
        let sum: f32 = self.anchors.iter().map(|a| a.radius_mm).sum();
        sum / self.anchors.len() as f32
    }
}

fn validate_geometry(def: &TemplateDefinition) -> Result<(), TemplateValidationError> {
    if def.id.trim().is_empty() {
        return Err(TemplateValidationError::EmptyTemplateId);
    }

    let [w, h] = def.sheet_size_mm;
    if !(w.is_finite() && h.is_finite()) || w <= 0.0 || h <= 0.0 {
        return Err(TemplateValidationError::BadSheetSize {
            size_mm: def.sheet_size_mm,
        });
    }

    if def.anchors.len() < 3 {
        return Err(TemplateValidationError::TooFewAnchors {
            template_id: def.id.clone(),
            found: def.anchors.len(),
        });
    }
    for (i, anchor) in def.anchors.iter().enumerate() {
        check_in_bounds(
            &format!("anchor#{i}"),
            anchor.center_mm,
            anchor.radius_mm,
            def.sheet_size_mm,
        )?;
    }
    if max_anchor_triangle_area(&def.anchors) < MIN_ANCHOR_TRIANGLE_FRAC * w * h {
        return Err(TemplateValidationError::CollinearAnchors {
            template_id: def.id.clone(),
        });
    }

    if def.questions.is_empty() {
        return Err(TemplateValidationError::NoQuestions {
            template_id: def.id.clone(),
        });
    }

    let mut seen_questions = HashSet::new();
    for question in &def.questions {
        if !seen_questions.insert(question.id.as_str()) {
            return Err(TemplateValidationError::DuplicateQuestionId {
                question_id: question.id.clone(),
            });
        }
        if question.options.is_empty() {
            return Err(TemplateValidationError::NoOptions {
                question_id: question.id.clone(),
            });
        }

        let mut seen_labels = HashSet::new();
        for option in &question.options {
            if !seen_labels.insert(option.label.as_str()) {
                return Err(TemplateValidationError::DuplicateOptionLabel {
                    question_id: question.id.clone(),
                    label: option.label.clone(),
                });
            }
            check_in_bounds(
                &format!("{}/{}", question.id, option.label),
                option.center_mm,
                option.radius_mm,
                def.sheet_size_mm,
            )?;
        }

        // Pairwise, options within one question must not touch.
        for i in 0..question.options.len() {
            for j in (i + 1)..question.options.len() {
                let a = &question.options[i];
                let b = &question.options[j];
                let dx = a.center_mm[0] - b.center_mm[0];
                let dy = a.center_mm[1] - b.center_mm[1];
                let min_dist = a.radius_mm + b.radius_mm;
                if dx * dx + dy * dy < min_dist * min_dist {
                    return Err(TemplateValidationError::OverlappingOptions {
                        question_id: question.id.clone(),
                        first: a.label.clone(),
                        second: b.label.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

fn check_in_bounds(
    owner: &str,
    center_mm: [f32; 2],
    radius_mm: f32,
    sheet_size_mm: [f32; 2],
) -> Result<(), TemplateValidationError> {
    let [cx, cy] = center_mm;
    let [w, h] = sheet_size_mm;
    let finite = cx.is_finite() && cy.is_finite() && radius_mm.is_finite();
    if !finite
        || radius_mm <= 0.0
        || cx - radius_mm < 0.0
        || cy - radius_mm < 0.0
        || cx + radius_mm > w
        || cy + radius_mm > h
    {
        return Err(TemplateValidationError::OutOfBounds {
            owner: owner.to_string(),
            center_mm,
            radius_mm,
        });
    }
    Ok(())
}

fn max_anchor_triangle_area(anchors: &[AnchorDisc]) -> f32 {
    let mut max_area = 0.0f32;
    for i in 0..anchors.len() {
        for j in (i + 1)..anchors.len() {
            for k in (j + 1)..anchors.len() {
                let [ax, ay] = anchors[i].center_mm;
                let [bx, by] = anchors[j].center_mm;
                let [cx, cy] = anchors[k].center_mm;
                let area = 0.5 * ((bx - ax) * (cy - ay) - (cx - ax) * (by - ay)).abs();
                max_area = max_area.max(area);
            }
        }
    }
    max_area
}

/// Parametric grid layout: questions stacked in columns, options in a row
/// per question, four corner anchors. Generated templates always validate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GridLayoutSpec {
    pub template_id: String,
    pub questions: usize,
    pub options_per_question: usize,
    pub sheet_size_mm: [f32; 2],
    /// Blank border kept free of bubbles on every page edge.
    pub margin_mm: f32,
    pub bubble_radius_mm: f32,
    /// Center-to-center spacing between options of one question.
    pub option_pitch_mm: f32,
    /// Center-to-center spacing between consecutive question rows.
    pub question_pitch_mm: f32,
    /// Horizontal gap between question columns.
    pub column_gap_mm: f32,
    pub anchor_radius_mm: f32,
}

impl Default for GridLayoutSpec {
    fn default() -> Self {
        Self {
            template_id: "grid".to_string(),
            questions: 20,
            options_per_question: 4,
            // A4 portrait
            sheet_size_mm: [210.0, 297.0],
            margin_mm: 16.0,
            bubble_radius_mm: 2.5,
            option_pitch_mm: 9.0,
            question_pitch_mm: 8.0,
            column_gap_mm: 14.0,
            anchor_radius_mm: 3.5,
        }
    }
}

impl GridLayoutSpec {
    /// Generate the template described by this layout.
    pub fn generate(&self) -> Result<SheetTemplate, TemplateValidationError> {
        let [w, h] = self.sheet_size_mm;
        let usable_w = w - 2.0 * self.margin_mm;
        let usable_h = h - 2.0 * self.margin_mm;
        if usable_w <= 0.0 || usable_h <= 0.0 {
            return Err(TemplateValidationError::GridDoesNotFit {
                reason: format!("margin {}mm leaves no usable page area", self.margin_mm),
            });
        }
        if self.questions == 0 || self.options_per_question == 0 {
            return Err(TemplateValidationError::GridDoesNotFit {
                reason: "questions and options_per_question must be >= 1".to_string(),
            });
        }

        let rows_per_column = (usable_h / self.question_pitch_mm).floor() as usize + 1;
        let rows_per_column = rows_per_column.max(1);
        let columns = self.questions.div_ceil(rows_per_column);
        let row_width =
            (self.options_per_question - 1) as f32 * self.option_pitch_mm;
        let column_pitch = row_width + self.column_gap_mm;
        let needed_w = (columns - 1) as f32 * column_pitch + row_width;
        if needed_w > usable_w {
            return Err(TemplateValidationError::GridDoesNotFit {
                reason: format!(
                    "{} questions x {} options need {:.1}mm of width, page offers {:.1}mm",
                    self.questions, self.options_per_question, needed_w, usable_w
                ),
            });
        }

        let id_width = self.questions.to_string().len().max(2);
        let mut questions = Vec::with_capacity(self.questions);
        for q_idx in 0..self.questions {
            let column = q_idx / rows_per_column;
            let row = q_idx % rows_per_column;
            let x0 = self.margin_mm + column as f32 * column_pitch;
            let y = self.margin_mm + row as f32 * self.question_pitch_mm;

            let options = (0..self.options_per_question)
                .map(|o_idx| OptionRegion {
                    label: option_label(o_idx),
                    center_mm: [x0 + o_idx as f32 * self.option_pitch_mm, y],
                    radius_mm: self.bubble_radius_mm,
                })
                .collect();
            questions.push(Question {
                id: format!("q{:0id_width$}", q_idx + 1),
                options,
            });
        }

        // Anchors sit inside the margin band, clear of the bubble field.
        let inset = (self.margin_mm * 0.5).max(self.anchor_radius_mm * 1.2);
        let anchors = vec![
            AnchorDisc {
                center_mm: [inset, inset],
                radius_mm: self.anchor_radius_mm,
            },
            AnchorDisc {
                center_mm: [w - inset, inset],
                radius_mm: self.anchor_radius_mm,
            },
            AnchorDisc {
                center_mm: [inset, h - inset],
                radius_mm: self.anchor_radius_mm,
            },
            AnchorDisc {
                center_mm: [w - inset, h - inset],
                radius_mm: self.anchor_radius_mm,
            },
        ];

        SheetTemplate::from_definition(TemplateDefinition {
            schema: TEMPLATE_SCHEMA_V1.to_string(),
            id: self.template_id.clone(),
            sheet_size_mm: self.sheet_size_mm,
            anchors,
            questions,
        })
    }
}

/// Option labels: A, B, C, ... then O27, O28, ... past the alphabet.
fn option_label(index: usize) -> String {
    if index < 26 {
        char::from(b'A' + index as u8).to_string()
    } else {
        format!("O{}", index + 1)
    }
}
