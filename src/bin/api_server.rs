// Admin API server binary
// Serves exchange rates, bulk catalog import and product maintenance over HTTP

use anyhow::Result;
use std::sync::Arc;
use storefront_ops::api::{ApiServer, AppState};
use storefront_ops::database_ops::catalog::PgCatalogStore;
use storefront_ops::database_ops::db::Db;
use storefront_ops::database_ops::exchange::{ExchangeRateApi, ExchangeService};
use storefront_ops::database_ops::media_store::{StorageConfig, StorageImageStore};
use storefront_ops::util::{env as env_util, logging};

#[actix_web::main]
async fn main() -> Result<()> {
    env_util::init_env();
    logging::init_tracing("info,sqlx=warn,actix_web=info")?;
    env_util::preflight_check(
        "api_server",
        &["API_SECRET"],
        &["DATABASE_URL", "SUPABASE_DB_URL", "STORAGE_URL", "SUPABASE_URL", "FX_API_URL"],
    )?;

    let server = ApiServer::from_env()?;

    tracing::info!("Connecting to database...");
    let db = Db::connect(
        &env_util::db_url()?,
        env_util::env_parse("DB_MAX_CONNECTIONS", 5u32),
    )
    .await?;
    tracing::info!("Database connected");

    let images = StorageImageStore::new(StorageConfig::from_env()?)?;
    let exchange = ExchangeService::new(Arc::new(db.clone()), Arc::new(ExchangeRateApi::from_env()?));
    let state = AppState::new(
        Some(db.clone()),
        Arc::new(PgCatalogStore::new(db)),
        Arc::new(images),
        exchange,
    );

    server.run(state).await
}
