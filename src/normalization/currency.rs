//! Storefront currencies: display rules, region inference and the per-user preference.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::util::env::env_opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Jmd,
    Cad,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Jmd, Currency::Cad];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Jmd => "JMD",
            Currency::Cad => "CAD",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Currency::Usd => "$",
            Currency::Jmd => "J$",
            Currency::Cad => "C$",
        }
    }

    /// JMD is shown in whole dollars.
    pub fn decimals(self) -> usize {
        match self {
            Currency::Jmd => 0,
            Currency::Usd | Currency::Cad => 2,
        }
    }

    /// Region (ISO 3166 alpha-2) to storefront currency. Anything unknown shops in USD.
    pub fn for_region(region: &str) -> Currency {
        match region.trim().to_ascii_uppercase().as_str() {
            "JM" => Currency::Jmd,
            "CA" => Currency::Cad,
            _ => Currency::Usd,
        }
    }

    /// Infer from a locale tag such as `en-JM`, `en_CA.UTF-8` or `fr_CA@euro`.
    pub fn for_locale(locale: &str) -> Currency {
        let tag = locale
            .split(['.', '@'])
            .next()
            .unwrap_or_default();
        match tag.split(['-', '_']).nth(1) {
            Some(region) => Currency::for_region(region),
            None => Currency::Usd,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "JMD" => Ok(Currency::Jmd),
            "CAD" => Ok(Currency::Cad),
            other => Err(anyhow::anyhow!("unsupported currency {other:?}")),
        }
    }
}

/// Symbol-prefixed amount with `,` grouping, rounded to the currency's display precision.
pub fn format_amount(amount: f64, currency: Currency) -> String {
    let decimals = currency.decimals();
    // Half away from zero; `{:.N}` alone would round exact ties to even.
    let factor = 10f64.powi(decimals as i32);
    let rounded = (amount.abs() * factor).round() / factor;
    let fixed = format!("{:.*}", decimals, rounded);
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (fixed.as_str(), None),
    };
    let mut out = String::with_capacity(fixed.len() + 6);
    // "-0" after rounding is just zero
    if amount < 0.0 && fixed.chars().any(|c| c.is_ascii_digit() && c != '0') {
        out.push('-');
    }
    out.push_str(currency.symbol());
    out.push_str(&group_thousands(int_part));
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Locale of the running process, from the usual POSIX variables.
pub fn system_locale() -> Option<String> {
    ["LC_ALL", "LC_MONETARY", "LANG"]
        .into_iter()
        .find_map(env_opt)
        .filter(|l| l != "C" && l != "POSIX")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferenceFile {
    currency: Option<Currency>,
}

/// Display-currency choice of the local user. Client-side only; never synced to the store.
#[derive(Debug, Clone)]
pub struct CurrencyPreference {
    path: PathBuf,
}

impl CurrencyPreference {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `CURRENCY_PREF_PATH`, else `$HOME/.storefront/currency.json`.
    pub fn from_env() -> Self {
        let path = env_opt("CURRENCY_PREF_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env_opt("HOME").unwrap_or_else(|| ".".into());
                Path::new(&home).join(".storefront").join("currency.json")
            });
        Self::new(path)
    }

    fn stored(&self) -> Option<Currency> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<PreferenceFile>(&raw) {
            Ok(file) => file.currency,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "ignoring unreadable currency preference");
                None
            }
        }
    }

    /// Stored choice, else inferred from `locale` (or the process locale when `None`).
    pub fn get(&self, locale: Option<&str>) -> Currency {
        if let Some(c) = self.stored() {
            return c;
        }
        locale
            .map(str::to_string)
            .or_else(system_locale)
            .map(|l| Currency::for_locale(&l))
            .unwrap_or(Currency::Usd)
    }

    pub fn set(&self, currency: Currency) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(&PreferenceFile {
            currency: Some(currency),
        })?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("write {}", self.path.display()))?;
        Ok(())
    }
}
