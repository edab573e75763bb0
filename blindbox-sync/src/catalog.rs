//! Where a session's catalog comes from.
//!
//! Every source hands back an already shuffled list. Failures are logged and
//! yield an empty catalog, which is a valid (if dull) session.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use blindbox_core::{parse_catalog_csv, shuffled, CatalogEntry};

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Ordered, shuffled catalog. Empty on any failure.
    async fn fetch(&self) -> Vec<CatalogEntry>;
}

/// Catalog CSV downloaded over HTTP.
pub struct HttpCatalogSource {
    url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    async fn download(&self) -> Result<String, reqwest::Error> {
        self.http
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Vec<CatalogEntry> {
        match self.download().await {
            Ok(text) => {
                let entries = parse_catalog_csv(&text);
                log::info!("Fetched {} catalog entries from {}", entries.len(), self.url);
                shuffled(entries)
            }
            Err(e) => {
                log::error!("Catalog download from {} failed: {e}", self.url);
                Vec::new()
            }
        }
    }
}

/// Catalog CSV read from disk.
pub struct FileCatalogSource {
    path: PathBuf,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    async fn fetch(&self) -> Vec<CatalogEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => shuffled(parse_catalog_csv(&text)),
            Err(e) => {
                log::error!("Cannot read catalog {}: {e}", self.path.display());
                Vec::new()
            }
        }
    }
}

/// Fixed catalog, shuffled on each fetch unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
    shuffle: bool,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries,
            shuffle: true,
        }
    }

    /// Keep the given order. Handy in tests.
    pub fn in_order(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries,
            shuffle: false,
        }
    }

    pub fn from_csv(text: &str) -> Self {
        Self::new(parse_catalog_csv(text))
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch(&self) -> Vec<CatalogEntry> {
        if self.shuffle {
            shuffled(self.entries.clone())
        } else {
            self.entries.clone()
        }
    }
}
