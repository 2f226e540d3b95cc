use anyhow::Result;
use assert_matches::assert_matches;
use std::io::Write;
use std::sync::Mutex;
use storefront_ops::database_ops::catalog::{
    CatalogPatch, CatalogProduct, CatalogRecord, CatalogStore, Category,
};
use storefront_ops::database_ops::catalog_import::{parse, ImportSession, ImportState};
use storefront_ops::database_ops::media_store::ImageStore;
use uuid::Uuid;

#[derive(Default)]
struct MemCatalog {
    products: Mutex<Vec<CatalogProduct>>,
}

#[async_trait::async_trait]
impl CatalogStore for MemCatalog {
    async fn get_all(&self) -> Result<Vec<CatalogProduct>> {
        Ok(self.products.lock().unwrap().clone())
    }

    async fn bulk_insert(&self, records: &[CatalogRecord]) -> Result<u64> {
        let mut products = self.products.lock().unwrap();
        products.extend(records.iter().cloned().map(|record| CatalogProduct {
            id: Uuid::new_v4(),
            record,
            is_active: true,
        }));
        Ok(records.len() as u64)
    }

    async fn update(&self, _id: Uuid, _patch: &CatalogPatch) -> Result<bool> {
        Ok(false)
    }

    async fn delete(&self, _id: Uuid) -> Result<bool> {
        Ok(false)
    }

    async fn hard_delete(&self, _id: Uuid) -> Result<bool> {
        Ok(false)
    }
}

struct Bucket;

#[async_trait::async_trait]
impl ImageStore for Bucket {
    async fn store(&self, source: &str) -> Result<String> {
        if source.contains("private") {
            anyhow::bail!("403 fetching {source}");
        }
        Ok(format!("https://bucket.test/{}", source.rsplit('/').next().unwrap_or("x")))
    }

    fn is_hosted(&self, url: &str) -> bool {
        url.starts_with("https://bucket.test/")
    }
}

#[test]
fn blank_name_rejects_the_whole_file() {
    let result = parse("name,price\nAspirin,5.99\n,3.00\n", &[]);

    assert!(result.is_rejected());
    assert!(result.accepted.is_empty());
    assert!(result.errors.iter().any(|e| e.contains("Row 3")));
}

#[test]
fn duplicates_are_reported_but_do_not_abort() {
    let existing = vec![CatalogProduct {
        id: Uuid::new_v4(),
        record: CatalogRecord::named("Widget"),
        is_active: true,
    }];
    let result = parse("name\nWIDGET\nGadget\ngadget \n", &existing);

    assert!(!result.is_rejected());
    assert_eq!(result.accepted.len(), 1);
    assert_eq!(result.accepted[0].name, "Gadget");
    assert_eq!(result.duplicates.len(), 2);
}

#[tokio::test]
async fn file_to_catalog_through_a_session() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "Name,Price,Category,Category ID,Image\n\
         Baby Wipes,4.50,baby,diapering,https://cdn.example/wipes.jpg\n\
         Ibuprofen,-2,pharmacy,,https://private.example/ibu.jpg\n\
         Teether,,,,https://bucket.test/teether.png\n"
    )
    .unwrap();
    let text = std::fs::read_to_string(file.path()).unwrap();

    let catalog = MemCatalog::default();
    let mut session = ImportSession::new();
    let preview = session.load(&text, &[]).unwrap();

    assert_eq!(preview.accepted.len(), 3);
    assert!(preview.warnings.iter().any(|w| w.contains("Row 3")));
    let ibuprofen = &preview.accepted[1];
    assert_eq!(ibuprofen.price, 9.99);
    assert_eq!(ibuprofen.category, Category::Pharmacy);
    assert_eq!(ibuprofen.category_id, "pain-relief");
    assert!(catalog.products.lock().unwrap().is_empty());

    let summary = session.confirm(&catalog, &Bucket).await.unwrap();
    assert_eq!(summary.success_count, 3);
    assert_eq!(summary.image_upload_count, 1);
    assert_eq!(summary.image_upload_failed, 1);
    assert_matches!(session.state(), ImportState::Completed { .. });

    let stored = catalog.products.lock().unwrap().clone();
    assert_eq!(stored[0].record.image, "https://bucket.test/wipes.jpg");
    assert_eq!(stored[1].record.image, "https://private.example/ibu.jpg");
    assert_eq!(stored[2].record.image, "https://bucket.test/teether.png");
}
