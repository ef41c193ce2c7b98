//! markgrid — optical mark recognition for multiple-choice answer sheets.
//!
//! The pipeline stages are:
//!
//! 1. **Template** – [`SheetTemplate`] describes page geometry; the
//!    [`TemplateRegistry`] loads, validates and caches templates from a
//!    store collaborator.
//! 2. **Decode** – [`OmrProcessor`] registers a scanned sheet by its anchor
//!    discs and reads every bubble into a [`MarkMatrix`] with three-way
//!    mark states.
//! 3. **Score** – [`scoring::evaluate`] grades a mark matrix against an
//!    [`AnswerKey`] into an immutable [`ScoredResult`].
//! 4. **Aggregate** – [`StatisticsAggregator`] folds persisted results into
//!    live per-exam [`ExamStatistics`] and pushes snapshots to subscribers.
//!
//! Decoding and scoring are pure per sheet and safe to run in parallel;
//! [`batch::grade_batch`] fans a pile of captures across a worker pool with
//! per-sheet atomicity and cooperative cancellation.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::{BTreeMap, BTreeSet};
//! use markgrid::{AnswerKey, GridLayoutSpec, OmrProcessor};
//!
//! # fn run(scan: image::GrayImage) -> Result<(), Box<dyn std::error::Error>> {
//! let template = GridLayoutSpec::default().generate()?;
//! let marks = OmrProcessor::new().decode(&scan, &template)?;
//!
//! let answers: BTreeMap<String, BTreeSet<String>> = template
//!     .questions()
//!     .iter()
//!     .map(|q| (q.id.clone(), BTreeSet::from(["A".to_string()])))
//!     .collect();
//! let key = AnswerKey::new("exam-1".to_string(), answers)?;
//! let result = markgrid::scoring::evaluate("sheet-1", &marks, &key)?;
//! println!("{} scored {}%", result.sheet_id, result.percentage);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod omr;
pub mod registry;
pub mod scoring;
pub mod sheet_layout;
pub mod stats;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use batch::{grade_batch, BatchReport, SheetCapture, SheetError, SheetFailure};
pub use omr::{
    AnchorScalePrior, DecodeError, MarkMatrix, MarkState, OmrConfig, OmrProcessor, Orientation,
    QuestionReading,
};
pub use registry::{RegistryError, TemplateRegistry};
pub use scoring::{
    AnswerKey, AnswerKeyDefinition, EvaluateError, QuestionOutcome, ScoredResult,
};
pub use sheet_layout::{
    GridLayoutSpec, SheetTemplate, TemplateDefinition, TemplateValidationError,
};
pub use stats::{ExamStatistics, StatisticsAggregator, StatisticsSink, StatisticsUpdate};
pub use store::{
    InMemoryResultStore, InMemoryTemplateStore, JsonFileTemplateStore, ResultListener,
    ResultStore, StorageError, TemplateStore,
};
