//! Persistence contracts, store implementations and HTTP fetch utilities for AquaTrack.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use aquatrack_core::{DataSource, IngestionLog, NewDataSource, Reading, ReadingKey, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use reqwest::Url;

pub const CRATE_NAME: &str = "aquatrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait DataSourceStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Option<DataSource>, StoreError>;

    async fn create(&self, data_source: NewDataSource) -> Result<DataSource, StoreError>;
}

#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Exact, case-sensitive match scoped to `data_source_id`; only found sensors are returned.
    async fn resolve_by_external_ids(
        &self,
        data_source_id: Uuid,
        external_ids: &[String],
    ) -> Result<HashMap<String, Sensor>, StoreError>;

    /// Persist locally staged sensors as one batch.
    async fn create_many(&self, sensors: &[Sensor]) -> Result<Vec<Sensor>, StoreError>;
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Keys already stored for `sensor_ids` with recorded_at in `[min, max]`.
    /// Returns an empty set when `sensor_ids` is empty.
    async fn existing_keys(
        &self,
        sensor_ids: &[Uuid],
        min_recorded_at: DateTime<Utc>,
        max_recorded_at: DateTime<Utc>,
    ) -> Result<HashSet<ReadingKey>, StoreError>;

    /// Persist readings as one batch, returning the number written.
    async fn create_many(&self, readings: &[Reading]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait IngestionLogStore: Send + Sync {
    async fn latest(&self, data_source_id: Uuid) -> Result<Option<IngestionLog>, StoreError>;

    async fn append(
        &self,
        data_source_id: Uuid,
        record_count: i32,
        last_recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config
            .user_agent
            .unwrap_or_else(|| format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET; any transport error or non-2xx status is returned to the caller.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %url);
        async move {
            let resp = self.client.get(url.clone()).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetcher_builds_with_default_config() {
        assert!(HttpFetcher::new(HttpClientConfig::default()).is_ok());
    }

    #[test]
    fn http_status_error_names_status_and_url() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://waterservices.usgs.gov/nwis/iv/".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "http status 503 for https://waterservices.usgs.gov/nwis/iv/"
        );
    }
}
