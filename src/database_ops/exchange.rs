use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::database_ops::db::Db;
use crate::normalization::currency::{format_amount, Currency};
use crate::util::env::{env_opt, env_parse};

pub const DEFAULT_RATE_API_URL: &str = "https://api.exchangerate-api.com/v4/latest/USD";
pub const STATIC_JMD_RATE: f64 = 155.75;
pub const STATIC_CAD_RATE: f64 = 1.35;

/// A set older than this is refreshed on the next resolve.
pub fn cache_ttl() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateSource {
    Database,
    Api,
    Cache,
    Static,
}

impl RateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RateSource::Database => "database",
            RateSource::Api => "api",
            RateSource::Cache => "cache",
            RateSource::Static => "static",
        }
    }
}

/// USD-based rates. USD itself is implicit and always exactly 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRateSet {
    pub jmd: f64,
    pub cad: f64,
    pub source: RateSource,
    pub fetched_at: DateTime<Utc>,
}

impl ExchangeRateSet {
    pub fn static_defaults(at: DateTime<Utc>) -> Self {
        Self {
            jmd: STATIC_JMD_RATE,
            cad: STATIC_CAD_RATE,
            source: RateSource::Static,
            fetched_at: at,
        }
    }

    pub fn rate(&self, currency: Currency) -> f64 {
        match currency {
            Currency::Usd => 1.0,
            Currency::Jmd => self.jmd,
            Currency::Cad => self.cad,
        }
    }

    pub fn rates(&self) -> HashMap<Currency, f64> {
        Currency::ALL.iter().map(|c| (*c, self.rate(*c))).collect()
    }

    pub fn convert(&self, amount: f64, from: Currency, to: Currency) -> f64 {
        if from == to {
            return amount;
        }
        amount * (self.rate(to) / self.rate(from))
    }

    fn set(&mut self, currency: Currency, rate: f64) {
        match currency {
            Currency::Usd => {}
            Currency::Jmd => self.jmd = rate,
            Currency::Cad => self.cad = rate,
        }
    }
}

/// Admin-maintained rates as read from the store; either may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredRates {
    pub jmd: Option<f64>,
    pub cad: Option<f64>,
}

#[async_trait::async_trait]
pub trait RateStore: Send + Sync {
    async fn get_rates(&self) -> Result<StoredRates>;
    async fn update_rate(&self, currency: Currency, rate: f64, source: RateSource) -> Result<()>;
}

#[async_trait::async_trait]
pub trait RateApi: Send + Sync {
    /// Quote currency code to units per USD.
    async fn latest_usd_rates(&self) -> Result<HashMap<String, f64>>;
}

#[async_trait::async_trait]
impl RateStore for Db {
    #[instrument(skip(self))]
    async fn get_rates(&self) -> Result<StoredRates> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            // Legacy DBs sometimes store `rate` as NUMERIC; cast to float8 to match Rust f64.
            "SELECT quote_currency, rate::float8 FROM exchange_rates \
             WHERE base_currency = 'USD' AND quote_currency IN ('JMD', 'CAD')",
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        let mut out = StoredRates::default();
        for (quote, rate) in rows {
            match quote.as_str() {
                "JMD" => out.jmd = Some(rate),
                "CAD" => out.cad = Some(rate),
                _ => {}
            }
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn update_rate(&self, currency: Currency, rate: f64, source: RateSource) -> Result<()> {
        sqlx::query(
            "INSERT INTO exchange_rates (base_currency, quote_currency, rate, provider, fetched_at) \
             VALUES ('USD', $1, $2, $3, now()) \
             ON CONFLICT (base_currency, quote_currency) \
             DO UPDATE SET rate = EXCLUDED.rate, provider = EXCLUDED.provider, fetched_at = EXCLUDED.fetched_at",
        )
        .persistent(false)
        .bind(currency.code())
        .bind(rate)
        .bind(source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Public, unauthenticated rate feed (`{"rates": {"JMD": 157.2, ...}}`).
#[derive(Clone)]
pub struct ExchangeRateApi {
    http: Client,
    url: String,
}

#[derive(Deserialize)]
struct LatestRatesResponse {
    rates: HashMap<String, f64>,
}

impl ExchangeRateApi {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("build rate api client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// `FX_API_URL` / `FX_HTTP_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let url = env_opt("FX_API_URL").unwrap_or_else(|| DEFAULT_RATE_API_URL.to_string());
        Self::new(url, env_parse("FX_HTTP_TIMEOUT_SECS", 10u64))
    }
}

#[async_trait::async_trait]
impl RateApi for ExchangeRateApi {
    async fn latest_usd_rates(&self) -> Result<HashMap<String, f64>> {
        let resp = self.http.get(&self.url).send().await?.error_for_status()?;
        let body: LatestRatesResponse = resp.json().await?;
        Ok(body.rates)
    }
}

#[derive(Debug)]
struct CacheState {
    set: ExchangeRateSet,
    // false while `set` is still the static seed
    populated: bool,
}

/// Process-wide rate cache with tiered refresh: cache, database, public API, static fallback.
///
/// Cheap to clone; clones share the same cache. Concurrent refreshes may both hit the
/// collaborators, but every write is a whole-set replacement so the last one wins.
#[derive(Clone)]
pub struct ExchangeService {
    store: Arc<dyn RateStore>,
    api: Arc<dyn RateApi>,
    cache: Arc<RwLock<CacheState>>,
    // detached persistence of api rates; off when the caller stores them itself
    write_back: bool,
}

impl ExchangeService {
    pub fn new(store: Arc<dyn RateStore>, api: Arc<dyn RateApi>) -> Self {
        Self {
            store,
            api,
            cache: Arc::new(RwLock::new(CacheState {
                set: ExchangeRateSet::static_defaults(Utc::now()),
                populated: false,
            })),
            write_back: true,
        }
    }

    /// Skip the detached write-back of api rates. For callers that persist the
    /// resolved set themselves with [`ExchangeService::store_rates`].
    pub fn without_write_back(self) -> Self {
        Self {
            write_back: false,
            ..self
        }
    }

    /// Seed the cache with a known set, as if it had been resolved earlier.
    pub fn with_cached(self, set: ExchangeRateSet) -> Self {
        self.write_cache(set);
        self
    }

    fn read_cache(&self) -> (ExchangeRateSet, bool) {
        let guard = self.cache.read().unwrap_or_else(|e| e.into_inner());
        (guard.set.clone(), guard.populated)
    }

    fn write_cache(&self, set: ExchangeRateSet) {
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        guard.set = set;
        guard.populated = true;
    }

    /// Snapshot of the active set without triggering a refresh.
    pub fn current(&self) -> ExchangeRateSet {
        self.read_cache().0
    }

    pub async fn resolve_rates(&self) -> ExchangeRateSet {
        self.resolve_rates_at(Utc::now()).await
    }

    /// Never fails: total failure degrades to whatever is cached, which may be the static seed.
    pub async fn resolve_rates_at(&self, now: DateTime<Utc>) -> ExchangeRateSet {
        let (cached, populated) = self.read_cache();
        if populated && now - cached.fetched_at < cache_ttl() {
            return ExchangeRateSet {
                source: RateSource::Cache,
                ..cached
            };
        }

        match self.store.get_rates().await {
            Ok(StoredRates {
                jmd: Some(jmd),
                cad: Some(cad),
            }) if valid_rate(jmd) && valid_rate(cad) => {
                let set = ExchangeRateSet {
                    jmd,
                    cad,
                    source: RateSource::Database,
                    fetched_at: now,
                };
                info!(jmd, cad, "exchange rates loaded from database");
                self.write_cache(set.clone());
                return set;
            }
            Ok(partial) => debug!(?partial, "database rates incomplete; trying rate api"),
            Err(e) => warn!(error = %e, "reading database rates failed; trying rate api"),
        }

        match self.api.latest_usd_rates().await {
            Ok(quotes) => {
                let mut set = ExchangeRateSet {
                    source: RateSource::Api,
                    fetched_at: now,
                    ..cached.clone()
                };
                let mut adopted = Vec::new();
                for currency in [Currency::Jmd, Currency::Cad] {
                    if let Some(rate) = quotes.get(currency.code()).copied().filter(|r| valid_rate(*r)) {
                        set.set(currency, rate);
                        adopted.push((currency, rate));
                    }
                }
                if !adopted.is_empty() {
                    info!(jmd = set.jmd, cad = set.cad, "exchange rates fetched from api");
                    self.write_cache(set.clone());
                    if self.write_back {
                        self.spawn_write_back(adopted);
                    }
                    return set;
                }
                warn!("rate api returned no usable JMD/CAD rates; keeping cached rates");
            }
            Err(e) => warn!(error = %e, "rate api request failed; keeping cached rates"),
        }

        ExchangeRateSet {
            source: if populated {
                RateSource::Cache
            } else {
                RateSource::Static
            },
            ..cached
        }
    }

    // Best effort: the resolved set is already returned regardless of how this goes.
    fn spawn_write_back(&self, adopted: Vec<(Currency, f64)>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            for (currency, rate) in adopted {
                if let Err(e) = store.update_rate(currency, rate, RateSource::Api).await {
                    debug!(%currency, error = %e, "rate write-back failed");
                }
            }
        });
    }

    /// Persist both non-USD rates of `set` and wait for the writes, unlike the detached
    /// write-back. Used by the sync binary, which would otherwise exit before it lands.
    pub async fn store_rates(&self, set: &ExchangeRateSet) -> Result<()> {
        for currency in [Currency::Jmd, Currency::Cad] {
            self.store
                .update_rate(currency, set.rate(currency), set.source)
                .await
                .with_context(|| format!("store {currency} rate"))?;
        }
        Ok(())
    }

    /// Convert with the active set; identity when `from == to`.
    pub fn convert(&self, amount: f64, from: Currency, to: Currency) -> f64 {
        if from == to {
            return amount;
        }
        self.current().convert(amount, from, to)
    }

    pub fn format(&self, amount: f64, currency: Currency) -> String {
        format_amount(amount, currency)
    }

    /// Convert from `from` into `to` and format in `to`.
    pub fn convert_and_format(&self, amount: f64, from: Currency, to: Currency) -> String {
        format_amount(self.convert(amount, from, to), to)
    }
}

fn valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        rates: Mutex<Option<StoredRates>>,
        writes: Mutex<Vec<(Currency, f64, RateSource)>>,
        reads: AtomicUsize,
    }

    impl FakeStore {
        fn with(rates: StoredRates) -> Self {
            let s = Self::default();
            *s.rates.lock().unwrap() = Some(rates);
            s
        }
    }

    #[async_trait::async_trait]
    impl RateStore for FakeStore {
        async fn get_rates(&self) -> Result<StoredRates> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.rates
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("relation \"exchange_rates\" does not exist"))
        }

        async fn update_rate(&self, currency: Currency, rate: f64, source: RateSource) -> Result<()> {
            self.writes.lock().unwrap().push((currency, rate, source));
            Ok(())
        }
    }

    struct FakeApi {
        quotes: Option<HashMap<String, f64>>,
        calls: AtomicUsize,
    }

    impl FakeApi {
        fn ok(pairs: &[(&str, f64)]) -> Self {
            Self {
                quotes: Some(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn down() -> Self {
            Self {
                quotes: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl RateApi for FakeApi {
        async fn latest_usd_rates(&self) -> Result<HashMap<String, f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.quotes
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn service(store: Arc<FakeStore>, api: Arc<FakeApi>) -> ExchangeService {
        ExchangeService::new(store, api)
    }

    #[tokio::test]
    async fn database_rates_win_when_complete() {
        let store = Arc::new(FakeStore::with(StoredRates {
            jmd: Some(158.0),
            cad: Some(1.37),
        }));
        let api = Arc::new(FakeApi::ok(&[("JMD", 160.0), ("CAD", 1.4)]));
        let svc = service(store, api.clone());

        let set = svc.resolve_rates().await;
        assert_eq!(set.source, RateSource::Database);
        assert_eq!(set.jmd, 158.0);
        assert_eq!(set.cad, 1.37);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_cache_short_circuits_every_tier() {
        let store = Arc::new(FakeStore::with(StoredRates {
            jmd: Some(158.0),
            cad: Some(1.37),
        }));
        let api = Arc::new(FakeApi::down());
        let svc = service(store.clone(), api);
        let t0 = Utc::now();

        svc.resolve_rates_at(t0).await;
        let again = svc.resolve_rates_at(t0 + Duration::hours(23)).await;
        assert_eq!(again.source, RateSource::Cache);
        assert_eq!(again.jmd, 158.0);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_cache_is_refreshed() {
        let store = Arc::new(FakeStore::with(StoredRates {
            jmd: Some(158.0),
            cad: Some(1.37),
        }));
        let api = Arc::new(FakeApi::down());
        let t0 = Utc::now();
        let svc = service(store.clone(), api).with_cached(ExchangeRateSet {
            jmd: 150.0,
            cad: 1.3,
            source: RateSource::Api,
            fetched_at: t0 - Duration::hours(25),
        });

        let set = svc.resolve_rates_at(t0).await;
        assert_eq!(set.source, RateSource::Database);
        assert_eq!(set.jmd, 158.0);
        assert_eq!(set.fetched_at, t0);
    }

    #[tokio::test]
    async fn incomplete_database_rates_fall_through_to_api_and_write_back() {
        let store = Arc::new(FakeStore::with(StoredRates {
            jmd: Some(158.0),
            cad: None,
        }));
        let api = Arc::new(FakeApi::ok(&[("JMD", 157.5), ("CAD", 1.36), ("EUR", 0.9)]));
        let svc = service(store.clone(), api);

        let set = svc.resolve_rates().await;
        assert_eq!(set.source, RateSource::Api);
        assert_eq!(set.jmd, 157.5);
        assert_eq!(set.cad, 1.36);

        // write-back runs detached
        for _ in 0..50 {
            if store.writes.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let writes = store.writes.lock().unwrap().clone();
        assert!(writes.contains(&(Currency::Jmd, 157.5, RateSource::Api)));
        assert!(writes.contains(&(Currency::Cad, 1.36, RateSource::Api)));
    }

    #[tokio::test]
    async fn api_rates_are_adopted_per_currency() {
        let store = Arc::new(FakeStore::default());
        let api = Arc::new(FakeApi::ok(&[("JMD", -3.0), ("CAD", 1.36)]));
        let svc = service(store, api);

        let set = svc.resolve_rates().await;
        assert_eq!(set.source, RateSource::Api);
        assert_eq!(set.jmd, STATIC_JMD_RATE);
        assert_eq!(set.cad, 1.36);
    }

    #[tokio::test]
    async fn total_failure_returns_static_defaults() {
        let svc = service(Arc::new(FakeStore::default()), Arc::new(FakeApi::down()));

        let set = svc.resolve_rates().await;
        assert_eq!(set.source, RateSource::Static);
        assert_eq!(set.jmd, STATIC_JMD_RATE);
        assert_eq!(set.cad, STATIC_CAD_RATE);
    }

    #[tokio::test]
    async fn api_failure_retains_previously_cached_rates() {
        let t0 = Utc::now();
        let stale = t0 - Duration::hours(48);
        let svc = service(Arc::new(FakeStore::default()), Arc::new(FakeApi::down())).with_cached(
            ExchangeRateSet {
                jmd: 151.0,
                cad: 1.33,
                source: RateSource::Api,
                fetched_at: stale,
            },
        );

        let set = svc.resolve_rates_at(t0).await;
        assert_eq!(set.source, RateSource::Cache);
        assert_eq!((set.jmd, set.cad), (151.0, 1.33));
        assert_eq!(set.fetched_at, stale);
    }

    #[tokio::test]
    async fn store_rates_writes_both_quotes_with_their_source() {
        let store = Arc::new(FakeStore::default());
        let svc = service(store.clone(), Arc::new(FakeApi::down()));
        let set = ExchangeRateSet {
            jmd: 156.1,
            cad: 1.34,
            source: RateSource::Api,
            fetched_at: Utc::now(),
        };

        svc.store_rates(&set).await.unwrap();
        assert_eq!(
            store.writes.lock().unwrap().clone(),
            vec![
                (Currency::Jmd, 156.1, RateSource::Api),
                (Currency::Cad, 1.34, RateSource::Api),
            ]
        );
    }

    #[tokio::test]
    async fn api_rates_are_written_once_when_caller_stores_them() {
        let store = Arc::new(FakeStore::default());
        let api = Arc::new(FakeApi::ok(&[("JMD", 157.5), ("CAD", 1.36)]));
        let svc = service(store.clone(), api).without_write_back();

        let set = svc.resolve_rates().await;
        assert_eq!(set.source, RateSource::Api);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(store.writes.lock().unwrap().is_empty());

        svc.store_rates(&set).await.unwrap();
        assert_eq!(store.writes.lock().unwrap().len(), 2);
    }

    /// Serves `response` verbatim to every connection on a loopback port.
    async fn serve_raw(response: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read += n,
                    }
                }
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}/v4/latest/USD")
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn rate_api_reads_the_rates_object() {
        let url = serve_raw(http_response(
            "200 OK",
            r#"{"base":"USD","rates":{"USD":1,"JMD":157.0,"CAD":1.36}}"#,
        ))
        .await;
        let api = ExchangeRateApi::new(url, 5).unwrap();

        let rates = api.latest_usd_rates().await.unwrap();
        assert_eq!(rates.get("JMD"), Some(&157.0));
        assert_eq!(rates.get("CAD"), Some(&1.36));
    }

    #[tokio::test]
    async fn rate_api_error_status_is_an_error() {
        let url = serve_raw(http_response("503 Service Unavailable", r#"{"error":"busy"}"#)).await;
        let api = ExchangeRateApi::new(url, 5).unwrap();

        assert!(api.latest_usd_rates().await.is_err());
    }

    #[tokio::test]
    async fn rate_api_malformed_body_is_an_error() {
        for body in [r#"{"rates":"#, r#"{"result":"success"}"#, r#"{"rates":{"JMD":"high"}}"#] {
            let url = serve_raw(http_response("200 OK", body)).await;
            let api = ExchangeRateApi::new(url, 5).unwrap();
            assert!(api.latest_usd_rates().await.is_err(), "body {body}");
        }
    }

    #[tokio::test]
    async fn failing_rate_feed_degrades_to_static_rates() {
        let url = serve_raw(http_response("500 Internal Server Error", "oops")).await;
        let api = Arc::new(ExchangeRateApi::new(url, 5).unwrap());
        let svc = ExchangeService::new(Arc::new(FakeStore::default()), api);

        let set = svc.resolve_rates().await;
        assert_eq!(set.source, RateSource::Static);
        assert_eq!((set.jmd, set.cad), (STATIC_JMD_RATE, STATIC_CAD_RATE));
    }

    #[test]
    fn usd_is_always_one_and_identity_conversion_is_exact() {
        let set = ExchangeRateSet::static_defaults(Utc::now());
        assert_eq!(set.rate(Currency::Usd), 1.0);
        assert_eq!(set.convert(100.0, Currency::Usd, Currency::Usd), 100.0);
        assert_eq!(set.convert(0.1, Currency::Jmd, Currency::Jmd), 0.1);
    }

    #[test]
    fn converts_through_usd_base() {
        let set = ExchangeRateSet {
            jmd: 150.0,
            cad: 1.5,
            source: RateSource::Static,
            fetched_at: Utc::now(),
        };
        assert_eq!(set.convert(10.0, Currency::Usd, Currency::Jmd), 1500.0);
        assert!((set.convert(1500.0, Currency::Jmd, Currency::Usd) - 10.0).abs() < 1e-9);
        assert!((set.convert(150.0, Currency::Jmd, Currency::Cad) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn service_formats_converted_amounts() {
        let svc = service(Arc::new(FakeStore::default()), Arc::new(FakeApi::down()));
        assert_eq!(svc.convert(100.0, Currency::Usd, Currency::Usd), 100.0);
        assert_eq!(
            svc.convert_and_format(10.0, Currency::Usd, Currency::Jmd),
            "J$1,558"
        );
        assert_eq!(svc.format(1234.5, Currency::Usd), "$1,234.50");
    }
}
