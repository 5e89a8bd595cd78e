//! Core entity model for AquaTrack ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aquatrack-core";

/// Parameter code recorded for series that carry no variable code.
pub const UNKNOWN_PARAMETER: &str = "UNKNOWN";

/// Fractional digits kept for sensor coordinates (NUMERIC(9,6)).
pub const COORDINATE_SCALE: u32 = 6;

/// Closed set of feed categories a data source can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    Public,
    Private,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown data source kind: {0:?}")]
pub struct UnknownDataSourceKind(pub String);

impl FromStr for DataSourceKind {
    type Err = UnknownDataSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            _ => Err(UnknownDataSourceKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub kind: DataSourceKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub pull_interval_secs: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a data source; id and creation time are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub kind: DataSourceKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub pull_interval_secs: i32,
    pub is_active: bool,
}

/// A physical monitoring location, keyed by the feed's site identifier within its data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Uuid,
    pub data_source_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub municipality: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Sensor {
    /// Stage a sensor for first sighting of `external_id`. The id is assigned here so
    /// readings can reference it before the sensor batch is written.
    pub fn stage(
        data_source_id: Uuid,
        external_id: impl Into<String>,
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_source_id,
            external_id: external_id.into(),
            name: name.into(),
            latitude: coordinate(latitude),
            longitude: coordinate(longitude),
            municipality: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

pub fn coordinate(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(COORDINATE_SCALE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: Uuid,
    pub sensor_id: Uuid,
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl Reading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            sensor_id: self.sensor_id,
            parameter: self.parameter.clone(),
            recorded_at: self.recorded_at,
        }
    }
}

/// Flattened, not-yet-deduplicated reading produced from a feed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReading {
    pub sensor_id: Uuid,
    pub parameter: String,
    pub unit: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

impl CandidateReading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            sensor_id: self.sensor_id,
            parameter: self.parameter.clone(),
            recorded_at: self.recorded_at,
        }
    }

    pub fn into_reading(self, ingested_at: DateTime<Utc>) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            sensor_id: self.sensor_id,
            parameter: self.parameter,
            value: self.value,
            unit: self.unit,
            recorded_at: self.recorded_at,
            ingested_at,
        }
    }
}

/// Composite natural key: no two persisted readings may share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingKey {
    pub sensor_id: Uuid,
    pub parameter: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only progress marker; the newest row per data source is the resumption watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionLog {
    pub id: Uuid,
    pub data_source_id: Uuid,
    pub ingested_at: DateTime<Utc>,
    pub record_count: i32,
    pub last_recorded_at: DateTime<Utc>,
}
