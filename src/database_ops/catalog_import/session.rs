use serde::Serialize;
use tracing::{info, warn};

use super::{commit, parse, CommitSummary, ImportBatchResult, ImportError};
use crate::database_ops::catalog::{CatalogProduct, CatalogStore};
use crate::database_ops::media_store::ImageStore;

/// Lifecycle of one import. `PreviewReady` waits for an explicit `confirm`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ImportState {
    Idle,
    Parsing,
    Aborted { errors: Vec<String>, warnings: Vec<String> },
    PreviewReady { preview: ImportBatchResult },
    Committing,
    Completed { summary: CommitSummary },
    Failed { error: String },
}

impl ImportState {
    pub fn name(&self) -> &'static str {
        match self {
            ImportState::Idle => "idle",
            ImportState::Parsing => "parsing",
            ImportState::Aborted { .. } => "aborted",
            ImportState::PreviewReady { .. } => "previewReady",
            ImportState::Committing => "committing",
            ImportState::Completed { .. } => "completed",
            ImportState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportSession {
    state: ImportState,
}

impl Default for ImportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportSession {
    pub fn new() -> Self {
        Self {
            state: ImportState::Idle,
        }
    }

    pub fn state(&self) -> &ImportState {
        &self.state
    }

    /// Parse a file into a preview. Allowed from any state except `Committing`; a new file
    /// replaces whatever preview or outcome the session held.
    pub fn load(
        &mut self,
        file_text: &str,
        existing: &[CatalogProduct],
    ) -> Result<ImportBatchResult, ImportError> {
        if matches!(self.state, ImportState::Committing) {
            return Err(self.invalid("load"));
        }
        self.state = ImportState::Parsing;
        let result = parse(file_text, existing);
        self.state = if result.is_rejected() {
            ImportState::Aborted {
                errors: result.errors.clone(),
                warnings: result.warnings.clone(),
            }
        } else {
            ImportState::PreviewReady {
                preview: result.clone(),
            }
        };
        Ok(result)
    }

    /// The pending preview, if one is waiting for confirmation.
    pub fn preview(&self) -> Option<&ImportBatchResult> {
        match &self.state {
            ImportState::PreviewReady { preview } => Some(preview),
            _ => None,
        }
    }

    /// User confirmation: commit the previewed records. Only valid from `PreviewReady`.
    pub async fn confirm(
        &mut self,
        catalog: &dyn CatalogStore,
        images: &dyn ImageStore,
    ) -> Result<CommitSummary, ImportError> {
        let preview = match std::mem::replace(&mut self.state, ImportState::Committing) {
            ImportState::PreviewReady { preview } => preview,
            other => {
                self.state = other;
                return Err(self.invalid("confirm"));
            }
        };

        let existing = match catalog.get_all().await {
            Ok(existing) => existing,
            Err(e) => {
                let err = ImportError::Catalog(e);
                self.state = ImportState::Failed {
                    error: err.to_string(),
                };
                return Err(err);
            }
        };

        match commit(preview.accepted, &existing, images, catalog).await {
            Ok(summary) => {
                info!(inserted = summary.success_count, "import session completed");
                self.state = ImportState::Completed {
                    summary: summary.clone(),
                };
                Ok(summary)
            }
            Err(e) => {
                warn!(error = %e, "import session failed");
                self.state = ImportState::Failed {
                    error: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Drop any preview or outcome and return to `Idle`.
    pub fn reset(&mut self) -> Result<(), ImportError> {
        if matches!(self.state, ImportState::Committing) {
            return Err(self.invalid("reset"));
        }
        self.state = ImportState::Idle;
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> ImportError {
        ImportError::InvalidState {
            state: self.state.name(),
            action,
        }
    }
}
