//! Template registry: validated-template lookup over a store collaborator.
//!
//! Validation runs once per load; later pipeline stages receive an
//! `Arc<SheetTemplate>` and may assume every invariant holds. The cache is
//! invalidated explicitly on update, never by time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::sheet_layout::{SheetTemplate, TemplateDefinition, TemplateValidationError};
use crate::store::{StorageError, TemplateStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("template '{template_id}' not found")]
    NotFound { template_id: String },
    #[error("stored template is invalid: {0}")]
    Invalid(#[from] TemplateValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct TemplateRegistry {
    store: Arc<dyn TemplateStore>,
    cache: Mutex<HashMap<String, Arc<SheetTemplate>>>,
}

impl TemplateRegistry {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a validated template, loading and validating on first use.
    pub fn get(&self, template_id: &str) -> Result<Arc<SheetTemplate>, RegistryError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(template) = cache.get(template_id) {
                return Ok(template.clone());
            }
        }

        let definition = self
            .store
            .load_definition(template_id)?
            .ok_or_else(|| RegistryError::NotFound {
                template_id: template_id.to_string(),
            })?;
        let template = Arc::new(SheetTemplate::from_definition(definition)?);
        tracing::debug!(template_id, "template validated and cached");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(template_id.to_string(), template.clone());
        Ok(template)
    }

    /// Drop one cache entry; the next `get` reloads from the store.
    pub fn invalidate(&self, template_id: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(template_id);
    }

    /// Validate, save through to the store, and invalidate the cache entry.
    /// Invalid definitions never reach the store.
    pub fn update(&self, definition: &TemplateDefinition) -> Result<(), RegistryError> {
        SheetTemplate::from_definition(definition.clone())?;
        self.store.save_definition(definition)?;
        self.invalidate(&definition.id);
        Ok(())
    }
}
