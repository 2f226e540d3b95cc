//! CSV preview: structural checks, per-row validation with smart defaults, duplicate detection.

use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::image_url::normalize_image_url;
use super::ImportBatchResult;
use crate::database_ops::catalog::{
    name_key, Badge, CatalogProduct, CatalogRecord, Category, DEFAULT_PRICE, DEFAULT_RATING,
    DEFAULT_REVIEW_COUNT,
};
use crate::normalization::currency::Currency;

/// Normalized header names this importer understands.
pub const KNOWN_COLUMNS: [&str; 14] = [
    "name",
    "description",
    "category",
    "categoryid",
    "price",
    "currency",
    "costprice",
    "stockcount",
    "soldcount",
    "rating",
    "reviewcount",
    "image",
    "instock",
    "badge",
];

/// Lowercase and drop everything but ASCII letters and digits: `Category ID` -> `categoryid`.
pub fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// One data row after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Valid {
        row: u64,
        record: CatalogRecord,
        warnings: Vec<String>,
    },
    Blocking {
        row: u64,
        error: String,
    },
}

struct Columns {
    index: HashMap<&'static str, usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> (Self, Vec<String>) {
        let mut index = HashMap::new();
        let mut unknown = Vec::new();
        for (i, raw) in headers.iter().enumerate() {
            let norm = normalize_header(raw);
            match KNOWN_COLUMNS.iter().find(|k| **k == norm) {
                // first occurrence wins
                Some(known) => {
                    index.entry(*known).or_insert(i);
                }
                None if !raw.trim().is_empty() => unknown.push(raw.trim().to_string()),
                None => {}
            }
        }
        (Self { index }, unknown)
    }

    fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Trimmed cell value; `None` for a missing column or blank cell.
    fn get<'r>(&self, record: &'r StringRecord, key: &str) -> Option<&'r str> {
        let i = *self.index.get(key)?;
        record.get(i).map(str::trim).filter(|v| !v.is_empty())
    }
}

fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_count(raw: &str) -> Option<i64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<i64>().ok().filter(|v| *v >= 0)
}

fn is_false_like(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "n" | "off"
    )
}

fn validate_row(row: u64, rec: &StringRecord, cols: &Columns) -> RowOutcome {
    let Some(name) = cols.get(rec, "name") else {
        return RowOutcome::Blocking {
            row,
            error: format!("Row {row}: name is required"),
        };
    };
    let mut warnings = Vec::new();
    let mut warn = |msg: String| warnings.push(format!("Row {row}: {msg}"));

    let price = if !cols.has("price") {
        DEFAULT_PRICE
    } else {
        match cols.get(rec, "price") {
            None => {
                warn(format!("price missing, defaulted to {DEFAULT_PRICE}"));
                DEFAULT_PRICE
            }
            Some(raw) => match parse_decimal(raw).filter(|p| *p > 0.0) {
                Some(p) => p,
                None => {
                    warn(format!("invalid price {raw:?}, defaulted to {DEFAULT_PRICE}"));
                    DEFAULT_PRICE
                }
            },
        }
    };

    let (category, category_id) = resolve_category(
        cols.get(rec, "category"),
        cols.get(rec, "categoryid"),
        &mut warn,
    );

    let currency = match cols.get(rec, "currency") {
        None => Currency::Usd,
        Some(raw) => raw.parse::<Currency>().unwrap_or_else(|_| {
            warn(format!("unsupported currency {raw:?}, defaulted to USD"));
            Currency::Usd
        }),
    };

    let rating = match cols.get(rec, "rating") {
        None => DEFAULT_RATING,
        Some(raw) => match parse_decimal(raw).filter(|r| (0.0..=5.0).contains(r)) {
            Some(r) => r,
            None => {
                warn(format!("rating {raw:?} must be between 0 and 5, defaulted to {DEFAULT_RATING}"));
                DEFAULT_RATING
            }
        },
    };

    let review_count = match cols.get(rec, "reviewcount") {
        None => DEFAULT_REVIEW_COUNT,
        Some(raw) => parse_count(raw).unwrap_or_else(|| {
            warn(format!("invalid review count {raw:?}, defaulted to {DEFAULT_REVIEW_COUNT}"));
            DEFAULT_REVIEW_COUNT
        }),
    };

    let cost_price = cols.get(rec, "costprice").and_then(|raw| {
        let parsed = parse_decimal(raw).filter(|c| *c >= 0.0);
        if parsed.is_none() {
            warn(format!("invalid cost price {raw:?}, left empty"));
        }
        parsed
    });

    let stock_count = cols.get(rec, "stockcount").and_then(|raw| {
        let parsed = parse_count(raw);
        if parsed.is_none() {
            warn(format!("invalid stock count {raw:?}, left empty"));
        }
        parsed
    });

    let sold_count = match cols.get(rec, "soldcount") {
        None => 0,
        Some(raw) => parse_count(raw).unwrap_or_else(|| {
            warn(format!("invalid sold count {raw:?}, defaulted to 0"));
            0
        }),
    };

    let in_stock = !cols.get(rec, "instock").is_some_and(is_false_like);

    let badge = cols.get(rec, "badge").map(|raw| {
        Badge::parse_loose(raw).unwrap_or_else(|| {
            warn(format!("unknown badge {raw:?}, using Standard"));
            Badge::Standard
        })
    });

    let record = CatalogRecord {
        name: name.to_string(),
        description: cols.get(rec, "description").unwrap_or_default().to_string(),
        category,
        category_id,
        price,
        currency,
        rating,
        review_count,
        cost_price,
        stock_count,
        sold_count,
        in_stock,
        badge,
        image: cols.get(rec, "image").map(normalize_image_url).unwrap_or_default(),
    };
    RowOutcome::Valid {
        row,
        record,
        warnings,
    }
}

/// A valid `categoryId` wins and implies its category; otherwise a valid `category`
/// picks its default id; otherwise baby/apparel.
fn resolve_category(
    category_raw: Option<&str>,
    category_id_raw: Option<&str>,
    warn: &mut impl FnMut(String),
) -> (Category, String) {
    let category = category_raw.and_then(|raw| raw.parse::<Category>().ok());

    if let Some(raw) = category_id_raw {
        if let Some((owner, id)) = Category::owning(raw) {
            if let Some(c) = category.filter(|c| *c != owner) {
                warn(format!(
                    "categoryId {id:?} belongs to {owner}, not {c}; using {owner}"
                ));
            }
            return (owner, id.to_string());
        }
    }

    let resolved = category.unwrap_or_default();
    let default_id = resolved.default_category_id();
    if let (Some(raw), None) = (category_raw, category) {
        warn(format!("unknown category {raw:?}, using {resolved}"));
    }
    if let Some(raw) = category_id_raw {
        warn(format!("unknown categoryId {raw:?}, using {default_id}"));
    }
    (resolved, default_id.to_string())
}

/// Parse and validate an uploaded CSV against the existing catalog snapshot.
///
/// Any blocking problem anywhere (malformed rows, no `name` column, a row without a name)
/// rejects the whole file: `accepted` comes back empty and `errors` lists every problem.
pub fn parse(file_text: &str, existing: &[CatalogProduct]) -> ImportBatchResult {
    // Spreadsheet exports often lead with a BOM.
    let text = file_text.strip_prefix('\u{feff}').unwrap_or(file_text);
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(Trim::None)
        .from_reader(text.as_bytes());

    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(e) => return ImportBatchResult::rejected(vec![format!("Unreadable header row: {e}")], vec![]),
    };
    if headers.iter().all(|h| h.trim().is_empty()) {
        return ImportBatchResult::rejected(vec!["File is empty".to_string()], vec![]);
    }

    let mut records: Vec<(u64, StringRecord)> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let fallback_row = i as u64 + 2;
        match result {
            Ok(rec) => {
                let row = rec.position().map(|p| p.line()).unwrap_or(fallback_row);
                records.push((row, rec));
            }
            Err(e) => {
                let row = e.position().map(|p| p.line()).unwrap_or(fallback_row);
                let msg = match e.kind() {
                    csv::ErrorKind::UnequalLengths {
                        expected_len, len, ..
                    } => format!("Row {row}: expected {expected_len} fields, found {len}"),
                    _ => format!("Row {row}: {e}"),
                };
                errors.push(msg);
            }
        }
    }
    if !errors.is_empty() {
        debug!(errors = errors.len(), "csv structurally malformed");
        return ImportBatchResult::rejected(errors, vec![]);
    }

    let (cols, unknown) = Columns::from_headers(&headers);
    if !cols.has("name") {
        return ImportBatchResult::rejected(
            vec!["Missing required column: name".to_string()],
            vec![],
        );
    }
    let mut warnings = Vec::new();
    if !unknown.is_empty() {
        warnings.push(format!("Ignoring unrecognized columns: {}", unknown.join(", ")));
    }
    if !cols.has("price") {
        warnings.push(format!(
            "No price column; every product defaults to {DEFAULT_PRICE}"
        ));
    }
    if records.is_empty() {
        return ImportBatchResult::rejected(vec!["File has no data rows".to_string()], warnings);
    }

    let outcomes: Vec<RowOutcome> = records
        .iter()
        .map(|(row, rec)| validate_row(*row, rec, &cols))
        .collect();

    let mut valid: Vec<(u64, CatalogRecord)> = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            RowOutcome::Valid {
                row,
                record,
                warnings: row_warnings,
            } => {
                warnings.extend(row_warnings);
                valid.push((row, record));
            }
            RowOutcome::Blocking { error, .. } => errors.push(error),
        }
    }
    if !errors.is_empty() {
        info!(
            errors = errors.len(),
            valid_rows = valid.len(),
            "import rejected: blocking row errors"
        );
        return ImportBatchResult::rejected(errors, warnings);
    }

    let (accepted, duplicates) = split_duplicates(valid, existing);
    info!(
        accepted = accepted.len(),
        duplicates = duplicates.len(),
        warnings = warnings.len(),
        "import preview ready"
    );
    ImportBatchResult {
        accepted,
        errors,
        warnings,
        duplicates,
    }
}

/// Catalog matches are reported before within-file repeats; the first occurrence in the file is kept.
fn split_duplicates(
    rows: Vec<(u64, CatalogRecord)>,
    existing: &[CatalogProduct],
) -> (Vec<CatalogRecord>, Vec<String>) {
    let catalog: HashSet<String> = existing.iter().map(|p| p.record.name_key()).collect();
    let mut first_seen: HashMap<String, u64> = HashMap::new();
    let mut accepted = Vec::with_capacity(rows.len());
    let mut duplicates = Vec::new();

    for (row, record) in rows {
        let key = name_key(&record.name);
        if catalog.contains(&key) {
            duplicates.push(format!(
                "Row {row}: \"{}\" already exists in the catalog",
                record.name
            ));
        } else if let Some(first) = first_seen.get(&key) {
            duplicates.push(format!(
                "Row {row}: \"{}\" duplicates row {first}",
                record.name
            ));
        } else {
            first_seen.insert(key, row);
            accepted.push(record);
        }
    }
    (accepted, duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn existing(name: &str, category: Category) -> CatalogProduct {
        let mut record = CatalogRecord::named(name);
        record.category = category;
        CatalogProduct {
            id: Uuid::new_v4(),
            record,
            is_active: true,
        }
    }

    #[test]
    fn headers_normalize_case_and_punctuation() {
        assert_eq!(normalize_header("Category ID"), "categoryid");
        assert_eq!(normalize_header(" Review_Count "), "reviewcount");
        assert_eq!(normalize_header("In-Stock?"), "instock");
    }

    #[test]
    fn blank_name_rejects_the_whole_file() {
        let result = parse("name,price\nAspirin,5.99\n,3.00\n", &[]);
        assert!(result.is_rejected());
        assert!(result.accepted.is_empty());
        assert_eq!(result.errors, vec!["Row 3: name is required".to_string()]);
    }

    #[test]
    fn missing_name_column_is_blocking() {
        let result = parse("title,price\nAspirin,5.99\n", &[]);
        assert!(result.accepted.is_empty());
        assert_eq!(result.errors, vec!["Missing required column: name".to_string()]);
    }

    #[test]
    fn ragged_rows_abort_before_validation() {
        let result = parse("name,price\nAspirin,5.99\nIbuprofen\n", &[]);
        assert!(result.accepted.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Row 3:"), "{:?}", result.errors);
    }

    #[test]
    fn empty_and_header_only_files_are_rejected() {
        assert!(parse("", &[]).is_rejected());
        let header_only = parse("name,price\n", &[]);
        assert_eq!(header_only.errors, vec!["File has no data rows".to_string()]);
    }

    #[test]
    fn bad_prices_default_with_a_warning() {
        let result = parse("name,price\nA,0\nB,-4\nC,abc\nD,NaN\nE,\nF,$1,299.50\n", &[]);
        // F's comma splits the cell, so quote it in real files; here it is ragged.
        assert!(result.is_rejected());

        let result = parse("name,price\nA,0\nB,-4\nC,abc\nD,NaN\nE,\n", &[]);
        assert!(!result.is_rejected());
        assert_eq!(result.accepted.len(), 5);
        for r in &result.accepted {
            assert_eq!(r.price, DEFAULT_PRICE, "{}", r.name);
        }
        for row in 2..=6 {
            let prefix = format!("Row {row}: ");
            assert!(
                result.warnings.iter().any(|w| w.starts_with(&prefix) && w.contains("price")),
                "no price warning for row {row}: {:?}",
                result.warnings
            );
        }
    }

    #[test]
    fn quoted_prices_with_symbols_parse() {
        let result = parse("name,price\n\"Crib\",\"$1,299.50\"\n", &[]);
        assert_eq!(result.accepted[0].price, 1299.5);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn missing_price_column_warns_once() {
        let result = parse("name\nBib\nRattle\n", &[]);
        assert_eq!(result.accepted.len(), 2);
        assert!(result.accepted.iter().all(|r| r.price == DEFAULT_PRICE));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("No price column"));
    }

    #[test]
    fn catalog_duplicates_are_case_insensitive() {
        let catalog = vec![existing("Widget", Category::Baby)];
        let result = parse("name,price\nWIDGET,4.00\nGizmo,2.00\n", &catalog);
        assert!(!result.is_rejected());
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.accepted[0].name, "Gizmo");
        assert_eq!(
            result.duplicates,
            vec!["Row 2: \"WIDGET\" already exists in the catalog".to_string()]
        );
    }

    #[test]
    fn second_occurrence_in_file_is_a_duplicate() {
        let result = parse("name,price\nGadget,1.00\n gadget ,2.00\n", &[]);
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.accepted[0].price, 1.0);
        assert_eq!(
            result.duplicates,
            vec!["Row 3: \"gadget\" duplicates row 2".to_string()]
        );
        assert!(result.errors.is_empty());
    }

    #[test]
    fn category_id_precedence() {
        let csv = "name,category,categoryId\n\
                   A,pharmacy,vitamins\n\
                   B,pharmacy,\n\
                   C,,feeding\n\
                   D,garden,\n\
                   E,baby,vitamins\n\
                   F,,\n";
        let result = parse(csv, &[]);
        let got: Vec<(Category, &str)> = result
            .accepted
            .iter()
            .map(|r| (r.category, r.category_id.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                (Category::Pharmacy, "vitamins"),
                (Category::Pharmacy, "pain-relief"),
                (Category::Baby, "feeding"),
                (Category::Baby, "apparel"),
                (Category::Pharmacy, "vitamins"),
                (Category::Baby, "apparel"),
            ]
        );
        assert!(result.warnings.iter().any(|w| w.starts_with("Row 5: unknown category")));
        assert!(result.warnings.iter().any(|w| w.starts_with("Row 6: categoryId")));
        assert!(!result.warnings.iter().any(|w| w.starts_with("Row 7:")));
    }

    #[test]
    fn optional_fields_default_and_coerce() {
        let csv = "Name,Currency,Rating,Review Count,Cost Price,Stock Count,Sold Count,In Stock,Badge,Image\n\
                   Bottle,jmd,4.9,12,3.5,40,7,no,best seller,https://www.dropbox.com/s/a/b.jpg?dl=0\n\
                   Pacifier,EUR,9,-1,-2,x,y,yes,mega,\n";
        let result = parse(csv, &[]);
        assert!(!result.is_rejected(), "{:?}", result.errors);

        let bottle = &result.accepted[0];
        assert_eq!(bottle.currency, Currency::Jmd);
        assert_eq!(bottle.rating, 4.9);
        assert_eq!(bottle.review_count, 12);
        assert_eq!(bottle.cost_price, Some(3.5));
        assert_eq!(bottle.stock_count, Some(40));
        assert_eq!(bottle.sold_count, 7);
        assert!(!bottle.in_stock);
        assert_eq!(bottle.badge, Some(Badge::BestSeller));
        assert_eq!(bottle.image, "https://www.dropbox.com/s/a/b.jpg?dl=1");

        let pacifier = &result.accepted[1];
        assert_eq!(pacifier.currency, Currency::Usd);
        assert_eq!(pacifier.rating, DEFAULT_RATING);
        assert_eq!(pacifier.review_count, DEFAULT_REVIEW_COUNT);
        assert_eq!(pacifier.cost_price, None);
        assert_eq!(pacifier.stock_count, None);
        assert_eq!(pacifier.sold_count, 0);
        assert!(pacifier.in_stock);
        assert_eq!(pacifier.badge, Some(Badge::Standard));
        assert_eq!(pacifier.image, "");

        let row3: Vec<&String> = result
            .warnings
            .iter()
            .filter(|w| w.starts_with("Row 3:"))
            .collect();
        assert_eq!(row3.len(), 7, "{row3:?}");
    }

    #[test]
    fn unknown_columns_are_reported_not_fatal() {
        let result = parse("name,price,colour\nHat,2.50,red\n", &[]);
        assert_eq!(result.accepted.len(), 1);
        assert!(result.warnings[0].contains("colour"));
    }

    #[test]
    fn validate_row_yields_tagged_outcomes() {
        let headers = StringRecord::from(vec!["name", "price"]);
        let (cols, _) = Columns::from_headers(&headers);
        let blank = StringRecord::from(vec!["  ", "1.00"]);
        assert_eq!(
            validate_row(4, &blank, &cols),
            RowOutcome::Blocking {
                row: 4,
                error: "Row 4: name is required".into()
            }
        );
        let ok = StringRecord::from(vec![" Soap ", "1.00"]);
        match validate_row(5, &ok, &cols) {
            RowOutcome::Valid { record, warnings, .. } => {
                assert_eq!(record.name, "Soap");
                assert!(warnings.is_empty());
            }
            other => panic!("expected valid row, got {other:?}"),
        }
    }
}
