//! Storefront operations: bulk catalog import and multi-currency pricing support.

pub mod api;

pub mod database_ops {
    pub mod catalog;
    pub mod catalog_import;
    pub mod db;
    pub mod exchange;
    pub mod media_store;
}

pub mod normalization {
    pub mod currency;
}

pub mod util {
    pub mod env;
    pub mod logging;
}

pub use database_ops::catalog::{CatalogProduct, CatalogRecord, CatalogStore, Category};
pub use database_ops::catalog_import::{ImportBatchResult, ImportError, ImportSession};
pub use database_ops::exchange::{ExchangeRateSet, ExchangeService, RateSource};
pub use normalization::currency::Currency;
