//! Bulk catalog import: CSV preview with smart defaults and duplicate detection,
//! then an explicitly confirmed commit that migrates images and bulk-inserts.

pub mod commit;
pub mod image_url;
pub mod parse;
pub mod session;

use serde::{Deserialize, Serialize};

use crate::database_ops::catalog::CatalogRecord;

pub use commit::{commit, CommitSummary, UPLOAD_BATCH_SIZE};
pub use parse::parse;
pub use session::{ImportSession, ImportState};

/// Outcome of parsing one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportBatchResult {
    /// Validated, non-duplicate records. Always empty when `errors` is not.
    pub accepted: Vec<CatalogRecord>,
    /// Blocking problems; any entry rejects the whole file.
    pub errors: Vec<String>,
    /// Defaults applied and values coerced.
    pub warnings: Vec<String>,
    /// Rows skipped because the name already exists.
    pub duplicates: Vec<String>,
}

impl ImportBatchResult {
    pub fn is_rejected(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn rejected(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            accepted: Vec::new(),
            errors,
            warnings,
            duplicates: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("import session is {state}; {action} is not allowed")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    #[error("bulk insert failed: {0}")]
    BulkInsert(#[source] anyhow::Error),

    #[error("loading existing catalog failed: {0}")]
    Catalog(#[source] anyhow::Error),
}
