//! Image fetch-and-store: copies product images into the storefront's object storage bucket.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use bytes::Bytes;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::util::env::{env_first, env_opt, env_parse};

#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch `source` (remote URL or `data:` URL) and store it; returns the public URL.
    async fn store(&self, source: &str) -> Result<String>;
    /// True when `url` already points into the target storage.
    fn is_hosted(&self, url: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub base_url: String,
    pub bucket: String,
    pub service_key: String,
    pub fetch_timeout_secs: u64,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = env_first(&["STORAGE_URL", "SUPABASE_URL"])
            .ok_or_else(|| anyhow!("STORAGE_URL (or SUPABASE_URL) is required for image uploads"))?;
        let service_key = env_first(&["STORAGE_SERVICE_KEY", "SUPABASE_SERVICE_ROLE_KEY"])
            .ok_or_else(|| anyhow!("STORAGE_SERVICE_KEY (or SUPABASE_SERVICE_ROLE_KEY) is required"))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: env_opt("STORAGE_BUCKET").unwrap_or_else(|| "product-images".into()),
            service_key,
            fetch_timeout_secs: env_parse("IMAGE_FETCH_TIMEOUT_SECS", 20u64),
        })
    }
}

/// Object storage speaking the Supabase storage REST dialect.
#[derive(Clone)]
pub struct StorageImageStore {
    http: Client,
    config: StorageConfig,
}

impl StorageImageStore {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .context("build storage client")?;
        Ok(Self { http, config })
    }

    fn public_prefix(&self) -> String {
        format!(
            "{}/storage/v1/object/public/{}/",
            self.config.base_url, self.config.bucket
        )
    }

    async fn fetch(&self, source: &str) -> Result<(Bytes, String)> {
        if source.starts_with("data:") {
            return decode_data_url(source);
        }
        let resp = self
            .http
            .get(source)
            .send()
            .await
            .with_context(|| format!("fetch image {source}"))?
            .error_for_status()?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        if !content_type.starts_with("image/") {
            return Err(anyhow!("{source} is not an image ({content_type})"));
        }
        Ok((resp.bytes().await?, content_type))
    }
}

#[async_trait::async_trait]
impl ImageStore for StorageImageStore {
    #[instrument(skip(self, source), fields(inline = source.starts_with("data:")))]
    async fn store(&self, source: &str) -> Result<String> {
        let (body, content_type) = self.fetch(source).await?;
        let path = object_path(&body, &content_type);
        let upload_url = format!(
            "{}/storage/v1/object/{}/{}",
            self.config.base_url, self.config.bucket, path
        );
        self.http
            .post(&upload_url)
            .bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .context("upload image")?
            .error_for_status()?;
        let public = format!("{}{}", self.public_prefix(), path);
        debug!(url = %public, "stored image");
        Ok(public)
    }

    fn is_hosted(&self, url: &str) -> bool {
        url.starts_with(&self.public_prefix())
    }
}

/// Content-addressed name, so re-importing the same image overwrites rather than duplicates.
fn object_path(body: &[u8], content_type: &str) -> String {
    let digest = Sha256::digest(body);
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    format!("products/{hex}.{}", extension_for(content_type))
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        _ => "jpg",
    }
}

/// `data:image/png;base64,....` only; other encodings are rejected.
fn decode_data_url(source: &str) -> Result<(Bytes, String)> {
    let rest = source
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data url"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("malformed data url"))?;
    let content_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("only base64 data urls are supported"))?;
    if !content_type.starts_with("image/") {
        return Err(anyhow!("data url is not an image ({content_type})"));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("decode base64 image")?;
    Ok((Bytes::from(bytes), content_type.to_string()))
}
