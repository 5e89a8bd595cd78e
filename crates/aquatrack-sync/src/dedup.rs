use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use aquatrack_adapters::NormalizedPayload;
use aquatrack_core::{CandidateReading, Sensor};
use aquatrack_storage::{ReadingStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Numeric value of a feed point, or `None` for qualifier codes, blanks and non-finite values.
pub fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<CandidateReading>,
    pub dropped_points: usize,
}

/// Flatten every series point into a candidate keyed to its resolved sensor.
pub fn candidate_readings(
    payload: &NormalizedPayload,
    sensors: &HashMap<String, Sensor>,
) -> CandidateBatch {
    let mut batch = CandidateBatch::default();

    for series in &payload.series {
        let Some(sensor) = sensors.get(&series.site.external_id) else {
            debug!(site = %series.site.external_id, "no sensor resolved for series");
            continue;
        };
        for point in &series.points {
            match point.value.as_deref().and_then(parse_value) {
                Some(value) => batch.candidates.push(CandidateReading {
                    sensor_id: sensor.id,
                    parameter: series.parameter_code.clone(),
                    unit: series.unit_code.clone(),
                    value,
                    recorded_at: point.recorded_at,
                }),
                None => {
                    debug!(
                        site = %series.site.external_id,
                        parameter = %series.parameter_code,
                        raw = ?point.value,
                        recorded_at = %point.recorded_at,
                        "dropping non-numeric point"
                    );
                    batch.dropped_points += 1;
                }
            }
        }
    }

    batch
}

/// Inclusive recorded-at range covered by `candidates`.
pub fn recorded_bounds(candidates: &[CandidateReading]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let min = candidates.iter().map(|c| c.recorded_at).min()?;
    let max = candidates.iter().map(|c| c.recorded_at).max()?;
    Some((min, max))
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub fresh: Vec<CandidateReading>,
    pub duplicates: usize,
}

/// Drops candidates whose composite key is already stored, or repeated earlier in the batch.
#[derive(Clone)]
pub struct ReadingDeduplicator {
    readings: Arc<dyn ReadingStore>,
}

impl ReadingDeduplicator {
    pub fn new(readings: Arc<dyn ReadingStore>) -> Self {
        Self { readings }
    }

    pub async fn filter_new(
        &self,
        candidates: Vec<CandidateReading>,
    ) -> Result<DedupOutcome, StoreError> {
        let Some((min, max)) = recorded_bounds(&candidates) else {
            return Ok(DedupOutcome::default());
        };
        let sensor_ids: Vec<Uuid> = candidates
            .iter()
            .map(|c| c.sensor_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut seen = self.readings.existing_keys(&sensor_ids, min, max).await?;
        debug!(
            sensors = sensor_ids.len(),
            stored = seen.len(),
            %min,
            %max,
            "loaded existing reading keys"
        );

        let total = candidates.len();
        let fresh: Vec<CandidateReading> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.key()))
            .collect();

        Ok(DedupOutcome {
            duplicates: total - fresh.len(),
            fresh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquatrack_adapters::{NormalizedSeries, RawPoint, SiteInfo};
    use aquatrack_storage::MemoryStore;
    use chrono::TimeZone;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 25, 12, minute, 0).single().unwrap()
    }

    fn candidate(sensor_id: Uuid, parameter: &str, recorded_at: DateTime<Utc>) -> CandidateReading {
        CandidateReading {
            sensor_id,
            parameter: parameter.to_string(),
            unit: "ft".to_string(),
            value: 2.4,
            recorded_at,
        }
    }

    fn point(value: Option<&str>, minute: u32) -> RawPoint {
        RawPoint {
            value: value.map(str::to_string),
            recorded_at: t(minute),
        }
    }

    #[test]
    fn parse_value_accepts_padded_numbers_only() {
        assert_eq!(parse_value("12.5"), Some(12.5));
        assert_eq!(parse_value(" -0.31 "), Some(-0.31));
        assert_eq!(parse_value("Eqp"), None);
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("inf"), None);
    }

    #[test]
    fn malformed_points_are_counted_not_fatal() {
        let sensor = Sensor::stage(Uuid::new_v4(), "50065500", "RIO MAMEYES", 18.3, -65.7);
        let payload = NormalizedPayload {
            series: vec![NormalizedSeries {
                site: SiteInfo {
                    external_id: "50065500".to_string(),
                    name: "RIO MAMEYES".to_string(),
                    latitude: 18.3,
                    longitude: -65.7,
                },
                parameter_code: "00060".to_string(),
                unit_code: "ft3/s".to_string(),
                points: vec![
                    point(Some("12.5"), 0),
                    point(Some("Ice"), 15),
                    point(None, 20),
                    point(Some("13.0"), 30),
                ],
            }],
            site_ids: vec!["50065500".to_string()],
        };
        let sensors = HashMap::from([("50065500".to_string(), sensor.clone())]);

        let batch = candidate_readings(&payload, &sensors);
        assert_eq!(batch.dropped_points, 2);
        assert_eq!(batch.candidates.len(), 2);
        assert!(batch.candidates.iter().all(|c| c.sensor_id == sensor.id && c.unit == "ft3/s"));
    }

    #[tokio::test]
    async fn stored_and_repeated_keys_are_removed() {
        let store = Arc::new(MemoryStore::new());
        let sensor = Uuid::new_v4();
        let stored = candidate(sensor, "00065", t(0)).into_reading(Utc::now());
        ReadingStore::create_many(store.as_ref(), &[stored]).await.unwrap();

        let dedup = ReadingDeduplicator::new(store);
        let outcome = dedup
            .filter_new(vec![
                candidate(sensor, "00065", t(0)),
                candidate(sensor, "00065", t(15)),
                candidate(sensor, "00065", t(15)),
                candidate(sensor, "00060", t(0)),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.fresh.len(), 2);
        assert_eq!(outcome.fresh[0].recorded_at, t(15));
        assert_eq!(outcome.fresh[1].parameter, "00060");
    }

    #[tokio::test]
    async fn empty_candidates_skip_the_store() {
        let dedup = ReadingDeduplicator::new(Arc::new(MemoryStore::new()));
        let outcome = dedup.filter_new(Vec::new()).await.unwrap();
        assert!(outcome.fresh.is_empty());
        assert_eq!(outcome.duplicates, 0);
    }

    #[test]
    fn bounds_cover_all_candidates() {
        let sensor = Uuid::new_v4();
        let candidates = vec![
            candidate(sensor, "00065", t(30)),
            candidate(sensor, "00065", t(0)),
            candidate(sensor, "00065", t(15)),
        ];
        assert_eq!(recorded_bounds(&candidates), Some((t(0), t(30))));
        assert_eq!(recorded_bounds(&[]), None);
    }
}
