use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use super::ImportError;
use crate::database_ops::catalog::{name_key, CatalogProduct, CatalogRecord, CatalogStore, Category};
use crate::database_ops::media_store::ImageStore;

/// Image uploads in flight at once.
pub const UPLOAD_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub success_count: u64,
    pub image_upload_count: usize,
    pub image_upload_failed: usize,
    pub skipped_count: usize,
}

/// Migrate images, then insert every remaining record in a single store call.
///
/// `existing` is re-checked by (name, category) because the catalog may have changed since the
/// preview. Upload failures keep the original URL and are only counted; the one fatal failure
/// is the bulk insert itself.
pub async fn commit(
    accepted: Vec<CatalogRecord>,
    existing: &[CatalogProduct],
    images: &dyn ImageStore,
    catalog: &dyn CatalogStore,
) -> Result<CommitSummary, ImportError> {
    let taken: HashSet<(String, Category)> = existing
        .iter()
        .map(|p| (p.record.name_key(), p.record.category))
        .collect();
    let before = accepted.len();
    let mut records: Vec<CatalogRecord> = accepted
        .into_iter()
        .filter(|r| !taken.contains(&(name_key(&r.name), r.category)))
        .collect();
    let mut summary = CommitSummary {
        skipped_count: before - records.len(),
        ..Default::default()
    };
    if summary.skipped_count > 0 {
        info!(skipped = summary.skipped_count, "dropped records created since preview");
    }

    for (batch_no, batch) in records.chunks_mut(UPLOAD_BATCH_SIZE).enumerate() {
        // settle-all: every upload in the batch runs to completion regardless of siblings
        let results = join_all(batch.iter_mut().map(|record| migrate_image(record, images))).await;
        for result in results {
            match result {
                Ok(true) => summary.image_upload_count += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.image_upload_failed += 1;
                    warn!(batch = batch_no, error = %e, "image upload failed; keeping source url");
                }
            }
        }
    }

    if !records.is_empty() {
        summary.success_count = catalog
            .bulk_insert(&records)
            .await
            .map_err(ImportError::BulkInsert)?;
    }
    info!(
        inserted = summary.success_count,
        images = summary.image_upload_count,
        image_failures = summary.image_upload_failed,
        skipped = summary.skipped_count,
        "catalog import committed"
    );
    Ok(summary)
}

/// `Ok(true)` when the image was moved into storage, `Ok(false)` when there was nothing to move.
async fn migrate_image(record: &mut CatalogRecord, images: &dyn ImageStore) -> anyhow::Result<bool> {
    if record.image.is_empty() || images.is_hosted(&record.image) {
        return Ok(false);
    }
    let stored = images.store(&record.image).await?;
    record.image = stored;
    Ok(true)
}
