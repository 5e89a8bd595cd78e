use std::collections::HashMap;

use aquatrack_adapters::NormalizedPayload;
use aquatrack_core::Sensor;
use aquatrack_storage::{SensorStore, StoreError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct SensorResolution {
    /// Every site in the payload mapped to its sensor, stored or staged.
    pub by_external_id: HashMap<String, Sensor>,
    /// Sensors created locally for first-seen sites, not yet persisted.
    pub staged: Vec<Sensor>,
}

/// Batch-resolve the payload's sites against `data_source_id` and stage a sensor for each miss.
pub async fn resolve_sensors(
    store: &dyn SensorStore,
    data_source_id: Uuid,
    payload: &NormalizedPayload,
) -> Result<SensorResolution, StoreError> {
    let mut by_external_id = store
        .resolve_by_external_ids(data_source_id, &payload.site_ids)
        .await?;
    debug!(
        requested = payload.site_ids.len(),
        found = by_external_id.len(),
        "resolved existing sensors"
    );

    let mut staged = Vec::new();
    for external_id in &payload.site_ids {
        if by_external_id.contains_key(external_id) {
            continue;
        }
        let Some(site) = payload.site(external_id) else {
            continue;
        };
        let sensor = Sensor::stage(
            data_source_id,
            external_id.clone(),
            site.name.clone(),
            site.latitude,
            site.longitude,
        );
        by_external_id.insert(external_id.clone(), sensor.clone());
        staged.push(sensor);
    }

    Ok(SensorResolution {
        by_external_id,
        staged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquatrack_adapters::{NormalizedSeries, SiteInfo};
    use aquatrack_storage::MemoryStore;

    fn payload(sites: &[(&str, &str)]) -> NormalizedPayload {
        NormalizedPayload {
            series: sites
                .iter()
                .map(|(id, name)| NormalizedSeries {
                    site: SiteInfo {
                        external_id: id.to_string(),
                        name: name.to_string(),
                        latitude: 18.3605,
                        longitude: -65.8138333,
                    },
                    parameter_code: "00060".to_string(),
                    unit_code: "ft3/s".to_string(),
                    points: Vec::new(),
                })
                .collect(),
            site_ids: sites.iter().map(|(id, _)| id.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn known_sites_resolve_and_new_sites_are_staged_once() {
        let store = MemoryStore::new();
        let source = Uuid::new_v4();
        let existing =
            Sensor::stage(source, "50063800", "RIO ESPIRITU SANTO", 18.3605, -65.8138333);
        SensorStore::create_many(&store, &[existing.clone()])
            .await
            .unwrap();

        let resolution = resolve_sensors(
            &store,
            source,
            &payload(&[("50063800", "RIO ESPIRITU SANTO"), ("50065500", "RIO MAMEYES")]),
        )
        .await
        .unwrap();

        assert_eq!(resolution.by_external_id.len(), 2);
        assert_eq!(resolution.by_external_id["50063800"].id, existing.id);
        assert_eq!(resolution.staged.len(), 1);
        let staged = &resolution.staged[0];
        assert_eq!(staged.external_id, "50065500");
        assert_eq!(staged.name, "RIO MAMEYES");
        assert_eq!(staged.data_source_id, source);
        assert_eq!(resolution.by_external_id["50065500"].id, staged.id);
    }

    #[tokio::test]
    async fn matching_is_case_sensitive() {
        let store = MemoryStore::new();
        let source = Uuid::new_v4();
        SensorStore::create_many(&store, &[Sensor::stage(source, "pr-01", "A", 0.0, 0.0)])
            .await
            .unwrap();

        let resolution = resolve_sensors(&store, source, &payload(&[("PR-01", "A")]))
            .await
            .unwrap();
        assert_eq!(resolution.staged.len(), 1);
    }
}
