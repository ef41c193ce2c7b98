//! Answer evaluation: consolidated mark readings + answer key -> score.
//!
//! Evaluation is pure and deterministic (no I/O, no randomness), so a
//! retained [`MarkMatrix`] can be re-graded against a corrected key without
//! rescanning. Without a retained matrix, re-grading requires a rescan;
//! there is no approximation path.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::omr::{MarkMatrix, QuestionReading};

const KEY_SCHEMA_V1: &str = "markgrid.key.v1";

/// Answer-key document violations.
#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("unsupported key schema '{found}' (expected '{expected}')")]
    UnsupportedSchema { found: String, expected: String },
    #[error("exam id must not be empty")]
    EmptyExamId,
    #[error("key has no answers")]
    EmptyKey,
    #[error("question '{question_id}' has an empty correct set")]
    EmptyCorrectSet { question_id: String },
}

/// Serialized answer-key document (`markgrid.key.v1`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnswerKeyDefinition {
    pub schema: String,
    pub exam_id: String,
    /// Question id -> set of correct option labels.
    pub answers: BTreeMap<String, BTreeSet<String>>,
}

/// Validated answer key. Immutable once built.
#[derive(Debug, Clone)]
pub struct AnswerKey {
    exam_id: String,
    answers: BTreeMap<String, BTreeSet<String>>,
}

impl AnswerKey {
    /// Validate a key document.
    pub fn from_definition(def: AnswerKeyDefinition) -> Result<Self, KeyError> {
        if def.schema != KEY_SCHEMA_V1 {
            return Err(KeyError::UnsupportedSchema {
                found: def.schema,
                expected: KEY_SCHEMA_V1.to_string(),
            });
        }
        Self::new(def.exam_id, def.answers)
    }

    /// Build a key from raw answers.
    pub fn new(
        exam_id: String,
        answers: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Self, KeyError> {
        if exam_id.trim().is_empty() {
            return Err(KeyError::EmptyExamId);
        }
        if answers.is_empty() {
            return Err(KeyError::EmptyKey);
        }
        for (question_id, correct) in &answers {
            if correct.is_empty() {
                return Err(KeyError::EmptyCorrectSet {
                    question_id: question_id.clone(),
                });
            }
        }
        Ok(Self { exam_id, answers })
    }

    pub fn exam_id(&self) -> &str {
        &self.exam_id
    }

    pub fn question_count(&self) -> usize {
        self.answers.len()
    }

    /// Correct labels for one question, if the key covers it.
    pub fn correct_for(&self, question_id: &str) -> Option<&BTreeSet<String>> {
        self.answers.get(question_id)
    }

    /// Serialize back into a key document (schema tag included).
    pub fn to_definition(&self) -> AnswerKeyDefinition {
        AnswerKeyDefinition {
            schema: KEY_SCHEMA_V1.to_string(),
            exam_id: self.exam_id.clone(),
            answers: self.answers.clone(),
        }
    }
}

/// Per-question scoring outcome. Blank and multi-mark count as incorrect
/// for the raw score but stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QuestionOutcome {
    Correct,
    Incorrect,
    Blank,
    MultiMark,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuestionScore {
    pub question_id: String,
    pub outcome: QuestionOutcome,
}

/// Immutable scoring outcome for one sheet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredResult {
    pub exam_id: String,
    pub sheet_id: String,
    pub outcomes: Vec<QuestionScore>,
    /// Number of correct questions.
    pub raw_score: u32,
    /// `raw_score / question_count * 100`, rounded half-up to a whole percent.
    pub percentage: f64,
}

impl ScoredResult {
    /// How many questions ended in `outcome`.
    pub fn count(&self, outcome: QuestionOutcome) -> usize {
        self.outcomes.iter().filter(|q| q.outcome == outcome).count()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EvaluateError {
    #[error("answer key for exam '{exam_id}' has no entry for question '{question_id}'")]
    MissingKeyEntry { exam_id: String, question_id: String },
    #[error("mark matrix has no questions to score")]
    EmptyMarkMatrix,
}

/// Score one decoded sheet against an answer key.
///
/// A `Single` reading is correct when its label is in the key's correct set
/// (multi-correct keys accept any of their labels). Blank and
/// multi-mark/ambiguous readings score zero but are tracked as their own
/// outcomes. A question the key does not cover is an error, not a zero.
pub fn evaluate(
    sheet_id: &str,
    marks: &MarkMatrix,
    key: &AnswerKey,
) -> Result<ScoredResult, EvaluateError> {
    if marks.questions.is_empty() {
        return Err(EvaluateError::EmptyMarkMatrix);
    }

    let mut outcomes = Vec::with_capacity(marks.questions.len());
    let mut raw_score = 0u32;
    for question in &marks.questions {
        let correct = key.correct_for(&question.question_id).ok_or_else(|| {
            EvaluateError::MissingKeyEntry {
                exam_id: key.exam_id().to_string(),
                question_id: question.question_id.clone(),
            }
        })?;

        let outcome = match &question.reading {
            QuestionReading::Blank => QuestionOutcome::Blank,
            QuestionReading::MultiMark | QuestionReading::Ambiguous => QuestionOutcome::MultiMark,
            QuestionReading::Single { label } => {
                if correct.contains(label) {
                    raw_score += 1;
                    QuestionOutcome::Correct
                } else {
                    QuestionOutcome::Incorrect
                }
            }
        };
        outcomes.push(QuestionScore {
            question_id: question.question_id.clone(),
            outcome,
        });
    }

    let percentage = round_half_up(raw_score as f64 / outcomes.len() as f64 * 100.0);
    Ok(ScoredResult {
        exam_id: key.exam_id().to_string(),
        sheet_id: sheet_id.to_string(),
        outcomes,
        raw_score,
        percentage,
    })
}

/// Round to the nearest integer, halves up.
fn round_half_up(v: f64) -> f64 {
    (v + 0.5).floor()
}
