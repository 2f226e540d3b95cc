use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use storefront_ops::database_ops::db::Db;
use storefront_ops::database_ops::exchange::{ExchangeRateApi, ExchangeService, RateSource};
use storefront_ops::normalization::currency::{Currency, CurrencyPreference};
use storefront_ops::util::{env as env_util, logging};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fx_sync", version, about = "Resolve and persist USD exchange rates")]
struct Cli {
    /// Seconds between runs; 0 runs once (defaults to FX_SYNC_INTERVAL_SECS)
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Store a display currency preference (USD, JMD or CAD) and exit
    #[arg(long)]
    set_currency: Option<Currency>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    logging::init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    let preference = CurrencyPreference::from_env();
    if let Some(currency) = cli.set_currency {
        preference.set(currency)?;
        println!("[fx_sync] display currency set to {currency}");
        return Ok(());
    }

    let db = Db::connect(&env_util::db_url()?, env_util::env_parse("DB_MAX_CONNECTIONS", 5u32)).await?;
    // run_once persists api rates itself and waits for the writes
    let svc = ExchangeService::new(Arc::new(db), Arc::new(ExchangeRateApi::from_env()?))
        .without_write_back();
    let display = preference.get(None);

    let interval_secs = cli
        .interval_secs
        .unwrap_or_else(|| env_util::env_parse("FX_SYNC_INTERVAL_SECS", 0u64));
    if interval_secs == 0 {
        // one-shot
        run_once(&svc, display).await?;
    } else {
        loop {
            if let Err(e) = run_once(&svc, display).await {
                error!(error = ?e, "fx sync run failed");
            }
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        }
    }
    Ok(())
}

async fn run_once(svc: &ExchangeService, display: Currency) -> Result<()> {
    let start = Utc::now();
    let set = svc.resolve_rates().await;
    if set.source == RateSource::Api {
        svc.store_rates(&set).await?;
    }
    info!(
        source = set.source.as_str(),
        jmd = set.jmd,
        cad = set.cad,
        elapsed_ms = (Utc::now() - start).num_milliseconds(),
        "rates resolved"
    );
    println!(
        "[fx_sync] source={} JMD={} CAD={} fetched_at={} | $100.00 = {}",
        set.source.as_str(),
        set.jmd,
        set.cad,
        set.fetched_at.to_rfc3339(),
        svc.convert_and_format(100.0, Currency::Usd, display)
    );
    Ok(())
}
