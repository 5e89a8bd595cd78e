use std::collections::{HashMap, HashSet};

use aquatrack_core::{DataSource, IngestionLog, NewDataSource, Reading, ReadingKey, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::{DataSourceStore, IngestionLogStore, ReadingStore, SensorStore, StoreError};

// Postgres caps a statement at 65535 bind parameters.
const SENSOR_BATCH_ROWS: usize = 1_000;
const READING_BATCH_ROWS: usize = 5_000;

const DATA_SOURCE_COLUMNS: &str =
    "id, name, kind, base_url, api_key, pull_interval_secs, is_active, created_at";
const SENSOR_COLUMNS: &str = "id, data_source_id, external_id, name, latitude, longitude, \
     municipality, is_active, created_at";

/// sqlx-backed store implementing every persistence contract against one pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct DataSourceRow {
    id: Uuid,
    name: String,
    kind: String,
    base_url: Option<String>,
    api_key: Option<String>,
    pull_interval_secs: i32,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl DataSourceRow {
    fn into_domain(self) -> Result<DataSource, StoreError> {
        let kind = self
            .kind
            .parse()
            .map_err(|err: aquatrack_core::UnknownDataSourceKind| {
                StoreError::Invalid(err.to_string())
            })?;
        Ok(DataSource {
            id: self.id,
            name: self.name,
            kind,
            base_url: self.base_url,
            api_key: self.api_key,
            pull_interval_secs: self.pull_interval_secs,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SensorRow {
    id: Uuid,
    data_source_id: Uuid,
    external_id: String,
    name: String,
    latitude: Decimal,
    longitude: Decimal,
    municipality: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        Sensor {
            id: row.id,
            data_source_id: row.data_source_id,
            external_id: row.external_id,
            name: row.name,
            latitude: row.latitude,
            longitude: row.longitude,
            municipality: row.municipality,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct IngestionLogRow {
    id: Uuid,
    data_source_id: Uuid,
    ingested_at: DateTime<Utc>,
    record_count: i32,
    last_recorded_at: DateTime<Utc>,
}

impl From<IngestionLogRow> for IngestionLog {
    fn from(row: IngestionLogRow) -> Self {
        IngestionLog {
            id: row.id,
            data_source_id: row.data_source_id,
            ingested_at: row.ingested_at,
            record_count: row.record_count,
            last_recorded_at: row.last_recorded_at,
        }
    }
}

fn map_write_error(err: sqlx::Error, entity: &'static str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate {
                entity,
                key: db.constraint().unwrap_or("unique constraint").to_string(),
            };
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl DataSourceStore for PgStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<DataSource>, StoreError> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources \
             WHERE name = $1 ORDER BY created_at LIMIT 1"
        );
        let row = sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DataSourceRow::into_domain).transpose()
    }

    async fn create(&self, data_source: NewDataSource) -> Result<DataSource, StoreError> {
        let sql = format!(
            "INSERT INTO data_sources ({DATA_SOURCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {DATA_SOURCE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(data_source.name.as_str())
            .bind(data_source.kind.as_str())
            .bind(data_source.base_url.as_deref())
            .bind(data_source.api_key.as_deref())
            .bind(data_source.pull_interval_secs)
            .bind(data_source.is_active)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_write_error(err, "data source"))?;
        row.into_domain()
    }
}

#[async_trait]
impl SensorStore for PgStore {
    async fn resolve_by_external_ids(
        &self,
        data_source_id: Uuid,
        external_ids: &[String],
    ) -> Result<HashMap<String, Sensor>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors \
             WHERE data_source_id = $1 AND external_id = ANY($2)"
        );
        let rows = sqlx::query_as::<_, SensorRow>(&sql)
            .bind(data_source_id)
            .bind(external_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.external_id.clone(), Sensor::from(row)))
            .collect())
    }

    async fn create_many(&self, sensors: &[Sensor]) -> Result<Vec<Sensor>, StoreError> {
        if sensors.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(sensors.len());
        for chunk in sensors.chunks(SENSOR_BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO sensors ({SENSOR_COLUMNS}) "));
            qb.push_values(chunk, |mut row, sensor| {
                row.push_bind(sensor.id)
                    .push_bind(sensor.data_source_id)
                    .push_bind(sensor.external_id.as_str())
                    .push_bind(sensor.name.as_str())
                    .push_bind(sensor.latitude)
                    .push_bind(sensor.longitude)
                    .push_bind(sensor.municipality.as_deref())
                    .push_bind(sensor.is_active)
                    .push_bind(sensor.created_at);
            });
            qb.push(format!(" RETURNING {SENSOR_COLUMNS}"));
            let rows = qb
                .build_query_as::<SensorRow>()
                .fetch_all(&mut *tx)
                .await
                .map_err(|err| map_write_error(err, "sensor"))?;
            created.extend(rows.into_iter().map(Sensor::from));
        }
        tx.commit().await?;

        debug!(count = created.len(), "sensor batch committed");
        Ok(created)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn existing_keys(
        &self,
        sensor_ids: &[Uuid],
        min_recorded_at: DateTime<Utc>,
        max_recorded_at: DateTime<Utc>,
    ) -> Result<HashSet<ReadingKey>, StoreError> {
        if sensor_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>)>(
            r#"
            SELECT sensor_id, parameter, recorded_at
            FROM readings
            WHERE sensor_id = ANY($1)
              AND recorded_at >= $2
              AND recorded_at <= $3
            "#,
        )
        .bind(sensor_ids)
        .bind(min_recorded_at)
        .bind(max_recorded_at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sensor_id, parameter, recorded_at)| ReadingKey {
                sensor_id,
                parameter,
                recorded_at,
            })
            .collect())
    }

    async fn create_many(&self, readings: &[Reading]) -> Result<u64, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for chunk in readings.chunks(READING_BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO readings \
                 (id, sensor_id, parameter, value, unit, recorded_at, ingested_at) ",
            );
            qb.push_values(chunk, |mut row, reading| {
                row.push_bind(reading.id)
                    .push_bind(reading.sensor_id)
                    .push_bind(reading.parameter.as_str())
                    .push_bind(reading.value)
                    .push_bind(reading.unit.as_str())
                    .push_bind(reading.recorded_at)
                    .push_bind(reading.ingested_at);
            });
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|err| map_write_error(err, "reading"))?;
            written += result.rows_affected();
        }
        tx.commit().await?;

        debug!(count = written, "reading batch committed");
        Ok(written)
    }
}

#[async_trait]
impl IngestionLogStore for PgStore {
    async fn latest(&self, data_source_id: Uuid) -> Result<Option<IngestionLog>, StoreError> {
        let row = sqlx::query_as::<_, IngestionLogRow>(
            r#"
            SELECT id, data_source_id, ingested_at, record_count, last_recorded_at
            FROM ingestion_logs
            WHERE data_source_id = $1
            ORDER BY ingested_at DESC
            LIMIT 1
            "#,
        )
        .bind(data_source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(IngestionLog::from))
    }

    async fn append(
        &self,
        data_source_id: Uuid,
        record_count: i32,
        last_recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_logs
                (id, data_source_id, ingested_at, record_count, last_recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data_source_id)
        .bind(Utc::now())
        .bind(record_count)
        .bind(last_recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_constraint_errors_stay_database_errors() {
        let err = map_write_error(sqlx::Error::PoolTimedOut, "reading");
        assert!(matches!(err, StoreError::Database(sqlx::Error::PoolTimedOut)));
    }

    #[test]
    fn corrupt_kind_column_is_rejected() {
        let row = DataSourceRow {
            id: Uuid::new_v4(),
            name: "USGS Puerto Rico".to_string(),
            kind: "Partner".to_string(),
            base_url: None,
            api_key: None,
            pull_interval_secs: 900,
            is_active: true,
            created_at: Utc::now(),
        };
        assert!(matches!(row.into_domain(), Err(StoreError::Invalid(_))));
    }
}
