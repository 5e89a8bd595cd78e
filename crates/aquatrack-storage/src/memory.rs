use std::collections::{HashMap, HashSet};

use aquatrack_core::{DataSource, IngestionLog, NewDataSource, Reading, ReadingKey, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{DataSourceStore, IngestionLogStore, ReadingStore, SensorStore, StoreError};

/// In-process store. Sensor uniqueness is enforced; reading uniqueness is not,
/// so duplicate suppression has to happen before `create_many`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data_sources: Vec<DataSource>,
    sensors: Vec<Sensor>,
    readings: Vec<Reading>,
    ingestion_logs: Vec<IngestionLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn data_sources(&self) -> Vec<DataSource> {
        self.state.lock().await.data_sources.clone()
    }

    pub async fn sensors(&self) -> Vec<Sensor> {
        self.state.lock().await.sensors.clone()
    }

    pub async fn readings(&self) -> Vec<Reading> {
        self.state.lock().await.readings.clone()
    }

    pub async fn ingestion_logs(&self) -> Vec<IngestionLog> {
        self.state.lock().await.ingestion_logs.clone()
    }
}

#[async_trait]
impl DataSourceStore for MemoryStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<DataSource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.data_sources.iter().find(|ds| ds.name == name).cloned())
    }

    async fn create(&self, data_source: NewDataSource) -> Result<DataSource, StoreError> {
        let created = DataSource {
            id: Uuid::new_v4(),
            name: data_source.name,
            kind: data_source.kind,
            base_url: data_source.base_url,
            api_key: data_source.api_key,
            pull_interval_secs: data_source.pull_interval_secs,
            is_active: data_source.is_active,
            created_at: Utc::now(),
        };
        self.state.lock().await.data_sources.push(created.clone());
        Ok(created)
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    async fn resolve_by_external_ids(
        &self,
        data_source_id: Uuid,
        external_ids: &[String],
    ) -> Result<HashMap<String, Sensor>, StoreError> {
        let wanted: HashSet<&str> = external_ids.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        Ok(state
            .sensors
            .iter()
            .filter(|s| {
                s.data_source_id == data_source_id && wanted.contains(s.external_id.as_str())
            })
            .map(|s| (s.external_id.clone(), s.clone()))
            .collect())
    }

    async fn create_many(&self, sensors: &[Sensor]) -> Result<Vec<Sensor>, StoreError> {
        let mut state = self.state.lock().await;
        let mut seen: HashSet<(Uuid, &str)> = state
            .sensors
            .iter()
            .map(|s| (s.data_source_id, s.external_id.as_str()))
            .collect();
        for sensor in sensors {
            if !seen.insert((sensor.data_source_id, sensor.external_id.as_str())) {
                return Err(StoreError::Duplicate {
                    entity: "sensor",
                    key: format!("{}/{}", sensor.data_source_id, sensor.external_id),
                });
            }
        }
        drop(seen);
        state.sensors.extend_from_slice(sensors);
        Ok(sensors.to_vec())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn existing_keys(
        &self,
        sensor_ids: &[Uuid],
        min_recorded_at: DateTime<Utc>,
        max_recorded_at: DateTime<Utc>,
    ) -> Result<HashSet<ReadingKey>, StoreError> {
        if sensor_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let wanted: HashSet<Uuid> = sensor_ids.iter().copied().collect();
        let state = self.state.lock().await;
        Ok(state
            .readings
            .iter()
            .filter(|r| {
                wanted.contains(&r.sensor_id)
                    && r.recorded_at >= min_recorded_at
                    && r.recorded_at <= max_recorded_at
            })
            .map(Reading::key)
            .collect())
    }

    async fn create_many(&self, readings: &[Reading]) -> Result<u64, StoreError> {
        self.state.lock().await.readings.extend_from_slice(readings);
        Ok(readings.len() as u64)
    }
}

#[async_trait]
impl IngestionLogStore for MemoryStore {
    async fn latest(&self, data_source_id: Uuid) -> Result<Option<IngestionLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ingestion_logs
            .iter()
            .filter(|l| l.data_source_id == data_source_id)
            .max_by_key(|l| l.ingested_at)
            .cloned())
    }

    async fn append(
        &self,
        data_source_id: Uuid,
        record_count: i32,
        last_recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state.lock().await.ingestion_logs.push(IngestionLog {
            id: Uuid::new_v4(),
            data_source_id,
            ingested_at: Utc::now(),
            record_count,
            last_recorded_at,
        });
        Ok(())
    }
}
