//! Collaborator interfaces and reference implementations.
//!
//! Template and result persistence live behind traits so the library never
//! owns durable storage. The in-memory stores here back tests, batch runs
//! and the CLI; the JSON template store matches the one-document-per-layout
//! convention used for template interchange.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::scoring::ScoredResult;
use crate::sheet_layout::TemplateDefinition;

/// Collaborator I/O failure, propagated as-is.
#[derive(Debug, Clone, Error)]
#[error("storage failure: {message}")]
pub struct StorageError {
    message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Template definition storage.
pub trait TemplateStore: Send + Sync {
    /// Fetch one definition; `None` when the id is unknown.
    fn load_definition(&self, template_id: &str)
        -> Result<Option<TemplateDefinition>, StorageError>;
    fn save_definition(&self, definition: &TemplateDefinition) -> Result<(), StorageError>;
}

/// Change-notification consumer for appended results.
pub trait ResultListener: Send + Sync {
    fn result_appended(&self, result: &ScoredResult);
}

/// Append-only result storage keyed by `(exam_id, sheet_id)`.
pub trait ResultStore: Send + Sync {
    /// Persist one result. Appending the same `(exam_id, sheet_id)` twice is
    /// rejected; results are immutable once stored.
    fn append(&self, result: &ScoredResult) -> Result<(), StorageError>;
    fn read_all_for_exam(&self, exam_id: &str) -> Result<Vec<ScoredResult>, StorageError>;
    /// Register for notification of every subsequent append.
    fn subscribe(&self, listener: Arc<dyn ResultListener>);
}

/// Mutex-guarded in-memory template store.
#[derive(Default)]
pub struct InMemoryTemplateStore {
    definitions: Mutex<HashMap<String, TemplateDefinition>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn load_definition(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateDefinition>, StorageError> {
        let definitions = self.definitions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(definitions.get(template_id).cloned())
    }

    fn save_definition(&self, definition: &TemplateDefinition) -> Result<(), StorageError> {
        let mut definitions = self.definitions.lock().unwrap_or_else(|e| e.into_inner());
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(())
    }
}

/// One JSON document per template under a directory, `<id>.json`.
pub struct JsonFileTemplateStore {
    dir: PathBuf,
}

impl JsonFileTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, template_id: &str) -> Result<PathBuf, StorageError> {
        let safe = !template_id.is_empty()
            && template_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(StorageError::new(format!(
                "template id '{template_id}' is not filesystem-safe"
            )));
        }
        Ok(self.dir.join(format!("{template_id}.json")))
    }
}

impl TemplateStore for JsonFileTemplateStore {
    fn load_definition(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateDefinition>, StorageError> {
        let path = self.path_for(template_id)?;
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn save_definition(&self, definition: &TemplateDefinition) -> Result<(), StorageError> {
        let path = self.path_for(&definition.id)?;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(definition)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}

#[derive(Default)]
struct ResultState {
    /// Exam id -> results in append order.
    by_exam: HashMap<String, Vec<ScoredResult>>,
}

impl ResultState {
    fn contains(&self, exam_id: &str, sheet_id: &str) -> bool {
        self.by_exam
            .get(exam_id)
            .is_some_and(|results| results.iter().any(|r| r.sheet_id == sheet_id))
    }
}

/// Mutex-guarded in-memory result store with listener notification.
#[derive(Default)]
pub struct InMemoryResultStore {
    state: Mutex<ResultState>,
    listeners: Mutex<Vec<Arc<dyn ResultListener>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total results across all exams.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.by_exam.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for InMemoryResultStore {
    fn append(&self, result: &ScoredResult) -> Result<(), StorageError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.contains(&result.exam_id, &result.sheet_id) {
                return Err(StorageError::new(format!(
                    "result for exam '{}' sheet '{}' already persisted",
                    result.exam_id, result.sheet_id
                )));
            }
            state
                .by_exam
                .entry(result.exam_id.clone())
                .or_default()
                .push(result.clone());
        }

        // Notify outside the state lock; listeners may read the store.
        let listeners = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for listener in listeners {
            listener.result_appended(result);
        }
        Ok(())
    }

    fn read_all_for_exam(&self, exam_id: &str) -> Result<Vec<ScoredResult>, StorageError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.by_exam.get(exam_id).cloned().unwrap_or_default())
    }

    fn subscribe(&self, listener: Arc<dyn ResultListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }
}
