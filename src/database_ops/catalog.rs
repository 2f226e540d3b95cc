//! Catalog data model and the persistent product store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, QueryBuilder, Row};
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::database_ops::db::Db;
use crate::normalization::currency::Currency;

pub const DEFAULT_PRICE: f64 = 9.99;
pub const DEFAULT_RATING: f64 = 4.5;
pub const DEFAULT_REVIEW_COUNT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Baby,
    Pharmacy,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Baby => "baby",
            Category::Pharmacy => "pharmacy",
        }
    }

    /// Sub-category ids a product in this category may carry. The first entry is the default.
    pub fn category_ids(self) -> &'static [&'static str] {
        match self {
            Category::Baby => &["apparel", "feeding", "diapering", "nursery", "bath", "toys"],
            Category::Pharmacy => &[
                "pain-relief",
                "cold-flu",
                "vitamins",
                "first-aid",
                "personal-care",
                "digestive",
            ],
        }
    }

    pub fn default_category_id(self) -> &'static str {
        self.category_ids()[0]
    }

    /// Owning category of a sub-category id, if the id is on any allow-list.
    pub fn owning(category_id: &str) -> Option<(Category, &'static str)> {
        [Category::Baby, Category::Pharmacy]
            .into_iter()
            .find_map(|c| {
                c.category_ids()
                    .iter()
                    .find(|id| id.eq_ignore_ascii_case(category_id))
                    .map(|id| (c, *id))
            })
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Baby
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baby" => Ok(Category::Baby),
            "pharmacy" => Ok(Category::Pharmacy),
            other => Err(anyhow::anyhow!("unknown category {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Badge {
    BestSeller,
    TopRated,
    New,
    Standard,
}

impl Badge {
    pub fn as_str(self) -> &'static str {
        match self {
            Badge::BestSeller => "BestSeller",
            Badge::TopRated => "TopRated",
            Badge::New => "New",
            Badge::Standard => "Standard",
        }
    }

    /// Lenient match: case, spaces, dashes and underscores are ignored.
    pub fn parse_loose(raw: &str) -> Option<Badge> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "bestseller" => Some(Badge::BestSeller),
            "toprated" => Some(Badge::TopRated),
            "new" => Some(Badge::New),
            "standard" => Some(Badge::Standard),
            _ => None,
        }
    }
}

/// A normalized product ready to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: Category,
    pub category_id: String,
    pub price: f64,
    pub currency: Currency,
    pub rating: f64,
    pub review_count: i64,
    pub cost_price: Option<f64>,
    pub stock_count: Option<i64>,
    pub sold_count: i64,
    pub in_stock: bool,
    pub badge: Option<Badge>,
    #[serde(default)]
    pub image: String,
}

impl CatalogRecord {
    /// A record carrying only a name; every other field at its default.
    pub fn named(name: impl Into<String>) -> Self {
        let category = Category::default();
        Self {
            name: name.into(),
            description: String::new(),
            category,
            category_id: category.default_category_id().to_string(),
            price: DEFAULT_PRICE,
            currency: Currency::Usd,
            rating: DEFAULT_RATING,
            review_count: DEFAULT_REVIEW_COUNT,
            cost_price: None,
            stock_count: None,
            sold_count: 0,
            in_stock: true,
            badge: None,
            image: String::new(),
        }
    }

    /// Key used for duplicate detection: trimmed, lowercased name.
    pub fn name_key(&self) -> String {
        name_key(&self.name)
    }
}

pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A product as stored, with the identity the store assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProduct {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: CatalogRecord,
    pub is_active: bool,
}

/// Partial update; `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub category_id: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<Currency>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub cost_price: Option<f64>,
    pub stock_count: Option<i64>,
    pub sold_count: Option<i64>,
    pub in_stock: Option<bool>,
    pub badge: Option<Badge>,
    pub image: Option<String>,
    pub is_active: Option<bool>,
}

impl CatalogPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.category_id.is_none()
            && self.price.is_none()
            && self.currency.is_none()
            && self.rating.is_none()
            && self.review_count.is_none()
            && self.cost_price.is_none()
            && self.stock_count.is_none()
            && self.sold_count.is_none()
            && self.in_stock.is_none()
            && self.badge.is_none()
            && self.image.is_none()
            && self.is_active.is_none()
    }

    /// Apply the import rules to an edit. Returns the canonical patch or the first violation.
    ///
    /// A `categoryId` sent alone pulls its owning category along; a `category` sent alone
    /// resets the id to that category's default, so the stored pair always agrees.
    pub fn validated(mut self) -> Result<Self, String> {
        if let Some(name) = self.name.as_deref() {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err("name must not be blank".into());
            }
            self.name = Some(trimmed.to_string());
        }
        if self.price.is_some_and(|p| !(p.is_finite() && p > 0.0)) {
            return Err("price must be positive".into());
        }
        if self
            .rating
            .is_some_and(|r| !(r.is_finite() && (0.0..=5.0).contains(&r)))
        {
            return Err("rating must be between 0 and 5".into());
        }
        if self.cost_price.is_some_and(|c| !(c.is_finite() && c >= 0.0)) {
            return Err("costPrice must not be negative".into());
        }
        for (field, value) in [
            ("reviewCount", self.review_count),
            ("stockCount", self.stock_count),
            ("soldCount", self.sold_count),
        ] {
            if value.is_some_and(|v| v < 0) {
                return Err(format!("{field} must not be negative"));
            }
        }

        match (self.category, self.category_id.as_deref()) {
            (category, Some(raw)) => {
                let Some((owner, id)) = Category::owning(raw.trim()) else {
                    return Err(format!("unknown categoryId {raw:?}"));
                };
                if let Some(c) = category.filter(|c| *c != owner) {
                    return Err(format!("categoryId {id:?} belongs to {owner}, not {c}"));
                }
                self.category = Some(owner);
                self.category_id = Some(id.to_string());
            }
            (Some(category), None) => {
                self.category_id = Some(category.default_category_id().to_string());
            }
            (None, None) => {}
        }
        Ok(self)
    }
}

#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    /// Every product, active or not.
    async fn get_all(&self) -> Result<Vec<CatalogProduct>>;
    /// Insert all records in one operation; returns how many rows were written.
    async fn bulk_insert(&self, records: &[CatalogRecord]) -> Result<u64>;
    /// Returns false when no product has `id`.
    async fn update(&self, id: Uuid, patch: &CatalogPatch) -> Result<bool>;
    /// Soft delete: the product stays but is flagged inactive.
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn hard_delete(&self, id: Uuid) -> Result<bool>;
}

/// Postgres `products` table.
#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

// 15 binds per row; keeps each statement far below the 65535 parameter cap.
const INSERT_CHUNK: usize = 1000;

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn product_from_row(row: &PgRow) -> Result<CatalogProduct> {
    let category: String = row.try_get("category")?;
    let currency: String = row.try_get("currency")?;
    let badge: Option<String> = row.try_get("badge")?;
    Ok(CatalogProduct {
        id: row.try_get("id")?,
        is_active: row.try_get("is_active")?,
        record: CatalogRecord {
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            // Rows written outside this service may carry other labels.
            category: category.parse().unwrap_or_default(),
            category_id: row.try_get("category_id")?,
            price: row.try_get("price")?,
            currency: currency.parse().unwrap_or(Currency::Usd),
            rating: row.try_get("rating")?,
            review_count: row.try_get("review_count")?,
            cost_price: row.try_get("cost_price")?,
            stock_count: row.try_get("stock_count")?,
            sold_count: row.try_get("sold_count")?,
            in_stock: row.try_get("in_stock")?,
            badge: badge.as_deref().and_then(Badge::parse_loose),
            image: row.try_get("image_url")?,
        },
    })
}

#[async_trait::async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip(self))]
    async fn get_all(&self) -> Result<Vec<CatalogProduct>> {
        let rows = sqlx::query(
            "SELECT id, name, description, category, category_id, price::float8 AS price, currency, \
             rating::float8 AS rating, review_count, cost_price::float8 AS cost_price, stock_count, \
             sold_count, in_stock, badge, image_url, is_active \
             FROM products ORDER BY created_at",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await
        .context("load products")?;
        rows.iter().map(product_from_row).collect()
    }

    #[instrument(skip(self, records), fields(rows = records.len()))]
    async fn bulk_insert(&self, records: &[CatalogRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.db.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO products (name, description, category, category_id, price, currency, rating, \
                 review_count, cost_price, stock_count, sold_count, in_stock, badge, image_url, is_active) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.name.trim())
                    .push_bind(&r.description)
                    .push_bind(r.category.as_str())
                    .push_bind(&r.category_id)
                    .push_bind(r.price)
                    .push_bind(r.currency.code())
                    .push_bind(r.rating)
                    .push_bind(r.review_count)
                    .push_bind(r.cost_price)
                    .push_bind(r.stock_count)
                    .push_bind(r.sold_count)
                    .push_bind(r.in_stock)
                    .push_bind(r.badge.map(Badge::as_str))
                    .push_bind(&r.image)
                    .push_bind(true);
            });
            let res = qb.build().persistent(false).execute(&mut *tx).await?;
            inserted += res.rows_affected();
        }
        tx.commit().await.context("commit product insert")?;
        info!(inserted, "bulk inserted products");
        Ok(inserted)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: Uuid, patch: &CatalogPatch) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> =
            QueryBuilder::new("UPDATE products SET updated_at = now()");
        macro_rules! set_col {
            ($col:literal, $val:expr) => {
                if let Some(v) = $val {
                    qb.push(concat!(", ", $col, " = ")).push_bind(v);
                }
            };
        }
        set_col!("name", patch.name.as_deref().map(str::trim));
        set_col!("description", patch.description.as_deref());
        set_col!("category", patch.category.map(Category::as_str));
        set_col!("category_id", patch.category_id.as_deref());
        set_col!("price", patch.price);
        set_col!("currency", patch.currency.map(Currency::code));
        set_col!("rating", patch.rating);
        set_col!("review_count", patch.review_count);
        set_col!("cost_price", patch.cost_price);
        set_col!("stock_count", patch.stock_count);
        set_col!("sold_count", patch.sold_count);
        set_col!("in_stock", patch.in_stock);
        set_col!("badge", patch.badge.map(Badge::as_str));
        set_col!("image_url", patch.image.as_deref());
        set_col!("is_active", patch.is_active);
        qb.push(" WHERE id = ").push_bind(id);

        let res = qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool> {
        let res =
            sqlx::query("UPDATE products SET is_active = false, updated_at = now() WHERE id = $1")
                .persistent(false)
                .bind(id)
                .execute(&self.db.pool)
                .await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM products WHERE id = $1")
            .persistent(false)
            .bind(id)
            .execute(&self.db.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_ids_resolve_to_their_owner() {
        assert_eq!(Category::owning("feeding"), Some((Category::Baby, "feeding")));
        assert_eq!(
            Category::owning("Vitamins"),
            Some((Category::Pharmacy, "vitamins"))
        );
        assert_eq!(Category::owning("garden"), None);
        assert_eq!(Category::Baby.default_category_id(), "apparel");
        assert_eq!(Category::Pharmacy.default_category_id(), "pain-relief");
    }

    #[test]
    fn badges_match_loosely() {
        assert_eq!(Badge::parse_loose("Best Seller"), Some(Badge::BestSeller));
        assert_eq!(Badge::parse_loose("top-rated"), Some(Badge::TopRated));
        assert_eq!(Badge::parse_loose("NEW"), Some(Badge::New));
        assert_eq!(Badge::parse_loose("hot deal"), None);
    }

    #[test]
    fn name_key_ignores_case_and_padding() {
        let r = CatalogRecord::named("  Widget ");
        assert_eq!(r.name_key(), "widget");
        assert_eq!(name_key("WIDGET"), r.name_key());
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(CatalogPatch::default().is_empty());
        let patch = CatalogPatch {
            in_stock: Some(false),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn patch_rejects_values_the_importer_would_not_store() {
        let bad = [
            CatalogPatch { name: Some("   ".into()), ..Default::default() },
            CatalogPatch { price: Some(0.0), ..Default::default() },
            CatalogPatch { rating: Some(9.0), ..Default::default() },
            CatalogPatch { rating: Some(f64::NAN), ..Default::default() },
            CatalogPatch { cost_price: Some(-1.0), ..Default::default() },
            CatalogPatch { review_count: Some(-1), ..Default::default() },
            CatalogPatch { stock_count: Some(-5), ..Default::default() },
            CatalogPatch { sold_count: Some(-2), ..Default::default() },
            CatalogPatch { category_id: Some("garden".into()), ..Default::default() },
            CatalogPatch {
                category: Some(Category::Baby),
                category_id: Some("vitamins".into()),
                ..Default::default()
            },
        ];
        for patch in bad {
            assert!(patch.clone().validated().is_err(), "accepted {patch:?}");
        }
    }

    #[test]
    fn patch_is_canonicalized() {
        let patch = CatalogPatch {
            name: Some("  Crib ".into()),
            category_id: Some("Vitamins".into()),
            stock_count: Some(0),
            rating: Some(5.0),
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(patch.name.as_deref(), Some("Crib"));
        assert_eq!(patch.category, Some(Category::Pharmacy));
        assert_eq!(patch.category_id.as_deref(), Some("vitamins"));

        let moved = CatalogPatch {
            category: Some(Category::Pharmacy),
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(moved.category_id.as_deref(), Some("pain-relief"));
    }

    #[test]
    fn product_serializes_flat_camel_case() {
        let product = CatalogProduct {
            id: Uuid::nil(),
            record: CatalogRecord::named("Widget"),
            is_active: true,
        };
        let v = serde_json::to_value(&product).unwrap();
        assert_eq!(v["name"], "Widget");
        assert_eq!(v["categoryId"], "apparel");
        assert_eq!(v["currency"], "USD");
        assert_eq!(v["isActive"], true);
    }
}
