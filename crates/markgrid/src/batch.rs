//! Batch grading: a worker pool over captured sheets.
//!
//! Decoding and evaluation are pure per sheet, so sheets fan out across
//! scoped threads with no shared mutable state beyond the work cursor and
//! the report. Each sheet is atomic: it is decoded, evaluated and persisted
//! as a unit, or recorded as a failure with nothing persisted. A failure
//! never aborts sibling sheets; cancellation is cooperative and takes
//! effect between sheets.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use image::GrayImage;
use thiserror::Error;

use crate::omr::{DecodeError, OmrProcessor, Orientation};
use crate::scoring::{evaluate, AnswerKey, EvaluateError, ScoredResult};
use crate::sheet_layout::SheetTemplate;
use crate::store::{ResultStore, StorageError};

/// One captured sheet: raw buffer plus capture metadata.
pub struct SheetCapture {
    pub sheet_id: String,
    pub image: GrayImage,
    pub orientation: Orientation,
}

impl SheetCapture {
    /// Upright capture without orientation metadata.
    pub fn upright(sheet_id: impl Into<String>, image: GrayImage) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            image,
            orientation: Orientation::Upright,
        }
    }
}

/// Why one sheet failed. Sibling sheets continue regardless.
#[derive(Debug, Error)]
pub enum SheetError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Evaluate(#[from] EvaluateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug)]
pub struct SheetFailure {
    pub sheet_id: String,
    pub error: SheetError,
}

/// Outcome of one batch run. `scored` and `failures` are sorted by sheet id.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub scored: Vec<ScoredResult>,
    pub failures: Vec<SheetFailure>,
    /// True when cancellation stopped the batch before all sheets ran.
    pub cancelled: bool,
}

impl BatchReport {
    /// Sheets that ran to a decision (scored or failed).
    pub fn processed(&self) -> usize {
        self.scored.len() + self.failures.len()
    }
}

/// Grade a batch of captured sheets against one template and key.
///
/// `workers` is clamped to `[1, captures.len()]`. Set `cancel` from any
/// thread to stop the batch; sheets already in flight finish normally, so
/// the store never sees a partially processed sheet.
pub fn grade_batch(
    captures: &[SheetCapture],
    template: &SheetTemplate,
    key: &AnswerKey,
    processor: &OmrProcessor,
    store: &dyn ResultStore,
    workers: usize,
    cancel: &AtomicBool,
) -> BatchReport {
    let workers = workers.clamp(1, captures.len().max(1));
    let cursor = AtomicUsize::new(0);
    let report = Mutex::new(BatchReport::default());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(capture) = captures.get(idx) else {
                    break;
                };

                match grade_sheet(capture, template, key, processor, store) {
                    Ok(result) => {
                        let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                        report.scored.push(result);
                    }
                    Err(error) => {
                        tracing::warn!(sheet_id = %capture.sheet_id, %error, "sheet failed");
                        let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                        report.failures.push(SheetFailure {
                            sheet_id: capture.sheet_id.clone(),
                            error,
                        });
                    }
                }
            });
        }
    });

    let mut report = report.into_inner().unwrap_or_else(|e| e.into_inner());
    report.cancelled = cancel.load(Ordering::SeqCst);
    report.scored.sort_by(|a, b| a.sheet_id.cmp(&b.sheet_id));
    report.failures.sort_by(|a, b| a.sheet_id.cmp(&b.sheet_id));
    tracing::info!(
        scored = report.scored.len(),
        failed = report.failures.len(),
        total = captures.len(),
        cancelled = report.cancelled,
        "batch complete"
    );
    report
}

/// Process one sheet end to end. The store append is the commit point: a
/// sheet that fails anywhere earlier leaves no persisted trace.
fn grade_sheet(
    capture: &SheetCapture,
    template: &SheetTemplate,
    key: &AnswerKey,
    processor: &OmrProcessor,
    store: &dyn ResultStore,
) -> Result<ScoredResult, SheetError> {
    let marks = processor.decode_oriented(&capture.image, capture.orientation, template)?;
    let result = evaluate(&capture.sheet_id, &marks, key)?;
    store.append(&result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet_layout::GridLayoutSpec;
    use crate::stats;
    use crate::store::InMemoryResultStore;
    use crate::test_utils::{render_sheet, uniform_page, SheetArt};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn template() -> SheetTemplate {
        GridLayoutSpec {
            template_id: "batch-test".to_string(),
            questions: 5,
            options_per_question: 4,
            sheet_size_mm: [120.0, 120.0],
            margin_mm: 12.0,
            anchor_radius_mm: 3.0,
            ..GridLayoutSpec::default()
        }
        .generate()
        .expect("valid template")
    }

    fn key(template: &SheetTemplate) -> AnswerKey {
        let answers: BTreeMap<String, BTreeSet<String>> = template
            .questions()
            .iter()
            .map(|q| (q.id.clone(), BTreeSet::from(["A".to_string()])))
            .collect();
        AnswerKey::new("exam-1".to_string(), answers).expect("valid key")
    }

    fn capture_with_marks(
        template: &SheetTemplate,
        sheet_id: &str,
        filled: &[(&str, &str)],
    ) -> SheetCapture {
        let art = SheetArt::new(template, 2.0);
        SheetCapture::upright(sheet_id, render_sheet(template, &art, filled))
    }

    #[test]
    fn batch_scores_and_persists_every_sheet() {
        let template = template();
        let key = key(&template);
        let store = Arc::new(InMemoryResultStore::new());
        let captures = vec![
            // 5/5, 3/5 and 0/5 correct.
            capture_with_marks(
                &template,
                "s1",
                &[
                    ("q01", "A"),
                    ("q02", "A"),
                    ("q03", "A"),
                    ("q04", "A"),
                    ("q05", "A"),
                ],
            ),
            capture_with_marks(&template, "s2", &[("q01", "A"), ("q02", "A"), ("q03", "A")]),
            capture_with_marks(&template, "s3", &[("q01", "B")]),
        ];

        let report = grade_batch(
            &captures,
            &template,
            &key,
            &OmrProcessor::new(),
            store.as_ref(),
            2,
            &AtomicBool::new(false),
        );

        assert!(!report.cancelled);
        assert!(report.failures.is_empty());
        assert_eq!(report.scored.len(), 3);
        assert_eq!(report.scored[0].sheet_id, "s1");
        assert_eq!(report.scored[0].percentage, 100.0);
        assert_eq!(report.scored[1].percentage, 60.0);
        assert_eq!(report.scored[2].percentage, 0.0);

        let persisted = store.read_all_for_exam("exam-1").unwrap();
        assert_eq!(persisted.len(), 3);
        let stats = stats::compute("exam-1", &persisted);
        assert!((stats.average_percent - 160.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.top_percent, 100.0);
    }

    #[test]
    fn unregisterable_sheet_fails_alone() {
        let template = template();
        let key = key(&template);
        let store = Arc::new(InMemoryResultStore::new());
        let art = SheetArt::new(&template, 2.0);
        let (w, h) = art.dims();
        let captures = vec![
            capture_with_marks(&template, "s1", &[("q01", "A")]),
            // No anchors at all: registration has nothing to lock onto.
            SheetCapture::upright("s2", uniform_page(w, h, 250)),
            capture_with_marks(&template, "s3", &[("q02", "A")]),
        ];

        let report = grade_batch(
            &captures,
            &template,
            &key,
            &OmrProcessor::new(),
            store.as_ref(),
            3,
            &AtomicBool::new(false),
        );

        assert_eq!(report.scored.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].sheet_id, "s2");
        assert!(matches!(
            report.failures[0].error,
            SheetError::Decode(DecodeError::AlignmentFailed { .. })
        ));

        // Nothing was persisted for the failed sheet.
        let persisted = store.read_all_for_exam("exam-1").unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(persisted.iter().all(|r| r.sheet_id != "s2"));
    }

    #[test]
    fn duplicate_sheet_id_surfaces_as_storage_failure() {
        let template = template();
        let key = key(&template);
        let store = Arc::new(InMemoryResultStore::new());
        let captures = vec![
            capture_with_marks(&template, "s1", &[("q01", "A")]),
            capture_with_marks(&template, "s1", &[("q02", "A")]),
        ];

        let report = grade_batch(
            &captures,
            &template,
            &key,
            &OmrProcessor::new(),
            store.as_ref(),
            1,
            &AtomicBool::new(false),
        );

        assert_eq!(report.scored.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, SheetError::Storage(_)));
        assert_eq!(store.read_all_for_exam("exam-1").unwrap().len(), 1);
    }

    #[test]
    fn preset_cancellation_processes_nothing() {
        let template = template();
        let key = key(&template);
        let store = Arc::new(InMemoryResultStore::new());
        let captures = vec![capture_with_marks(&template, "s1", &[("q01", "A")])];

        let report = grade_batch(
            &captures,
            &template,
            &key,
            &OmrProcessor::new(),
            store.as_ref(),
            2,
            &AtomicBool::new(true),
        );

        assert!(report.cancelled);
        assert_eq!(report.processed(), 0);
        assert!(store.is_empty());
    }
}
