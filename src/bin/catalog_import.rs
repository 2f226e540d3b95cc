use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use storefront_ops::database_ops::catalog::{CatalogStore, PgCatalogStore};
use storefront_ops::database_ops::catalog_import::{ImportBatchResult, ImportSession};
use storefront_ops::database_ops::db::Db;
use storefront_ops::database_ops::media_store::{StorageConfig, StorageImageStore};
use storefront_ops::util::{env as env_util, logging};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "catalog_import", version, about = "Preview and commit a product CSV")]
struct Cli {
    /// CSV file to import
    file: PathBuf,
    /// Write the previewed records; without this flag nothing is changed
    #[arg(long, default_value_t = false)]
    commit: bool,
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    logging::init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("read {}", cli.file.display()))?;
    let db_url = match cli.db_url {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let db = Db::connect(&db_url, env_util::env_parse("DB_MAX_CONNECTIONS", 5u32)).await?;
    let catalog = PgCatalogStore::new(db);

    let existing = catalog.get_all().await.context("load existing catalog")?;
    let mut session = ImportSession::new();
    let preview = session.load(&text, &existing)?;
    print_report(&preview);

    if preview.is_rejected() {
        anyhow::bail!("file rejected with {} error(s); nothing imported", preview.errors.len());
    }
    if !cli.commit {
        println!("[catalog_import] preview only; re-run with --commit to import");
        return Ok(());
    }

    let images = StorageImageStore::new(StorageConfig::from_env()?)?;
    let summary = session.confirm(&catalog, &images).await?;
    info!(file = %cli.file.display(), inserted = summary.success_count, "import finished");
    println!(
        "[catalog_import] inserted={} images_uploaded={} images_failed={} skipped={}",
        summary.success_count,
        summary.image_upload_count,
        summary.image_upload_failed,
        summary.skipped_count
    );
    Ok(())
}

fn print_report(result: &ImportBatchResult) {
    println!(
        "[catalog_import] accepted={} duplicates={} warnings={} errors={}",
        result.accepted.len(),
        result.duplicates.len(),
        result.warnings.len(),
        result.errors.len()
    );
    for e in &result.errors {
        println!("  error: {e}");
    }
    for d in &result.duplicates {
        println!("  duplicate: {d}");
    }
    for w in &result.warnings {
        println!("  warning: {w}");
    }
}
