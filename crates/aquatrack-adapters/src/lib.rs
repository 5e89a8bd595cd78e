//! USGS instantaneous-values feed: payload model, feed clients and payload normalization.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use aquatrack_core::UNKNOWN_PARAMETER;
use aquatrack_storage::{FetchError, HttpFetcher, Url};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "aquatrack-adapters";

pub const USGS_SOURCE_ID: &str = "usgs-nwis-iv";
pub const DEFAULT_USGS_IV_URL: &str = "https://waterservices.usgs.gov/nwis/iv/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsgsResponse {
    pub value: UsgsValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsValue {
    #[serde(default)]
    pub time_series: Vec<UsgsTimeSeries>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsTimeSeries {
    pub source_info: UsgsSourceInfo,
    pub variable: UsgsVariable,
    #[serde(default)]
    pub values: Vec<UsgsValues>,
}

impl UsgsTimeSeries {
    /// First non-blank site code, used verbatim.
    pub fn site_id(&self) -> Option<&str> {
        self.source_info
            .site_code
            .iter()
            .map(|code| code.value.as_str())
            .find(|value| !value.trim().is_empty())
    }

    pub fn parameter_code(&self) -> &str {
        self.variable
            .variable_code
            .iter()
            .map(|code| code.value.as_str())
            .find(|value| !value.trim().is_empty())
            .unwrap_or(UNKNOWN_PARAMETER)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsSourceInfo {
    pub site_name: String,
    #[serde(default)]
    pub site_code: Vec<UsgsSiteCode>,
    pub geo_location: UsgsGeoLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsSiteCode {
    pub value: String,
    #[serde(default)]
    pub agency_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsGeoLocation {
    pub geog_location: UsgsGeogLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsgsGeogLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsVariable {
    #[serde(default)]
    pub variable_code: Vec<UsgsVariableCode>,
    #[serde(default)]
    pub variable_name: Option<String>,
    pub unit: UsgsUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsgsVariableCode {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsUnit {
    pub unit_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsgsValues {
    #[serde(default)]
    pub value: Vec<UsgsPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsgsPoint {
    /// `None` when the feed sends `null` or a non-scalar value.
    #[serde(default, deserialize_with = "lenient_point_value")]
    pub value: Option<String>,
    pub date_time: DateTime<Utc>,
}

/// Point values are normally strings, but a `null` or bare number must not fail the
/// whole response.
fn lenient_point_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(raw)) => Some(raw),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Lower bound of a feed request: an absolute start instant, or a relative lookback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWindow {
    Since(DateTime<Utc>),
    Lookback(Duration),
}

impl FetchWindow {
    fn query_pair(&self) -> (&'static str, String) {
        match self {
            Self::Since(start) => ("startDT", start.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Lookback(period) => ("period", iso8601_period(*period)),
        }
    }
}

pub fn iso8601_period(period: Duration) -> String {
    let secs = period.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("PT{}H", secs / 3600)
    } else if secs % 60 == 0 {
        format!("PT{}M", secs / 60)
    } else {
        format!("PT{secs}S")
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("malformed feed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid feed url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("reading fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(
        &self,
        region_code: &str,
        window: &FetchWindow,
    ) -> Result<UsgsResponse, FeedError>;
}

pub fn decode_response(bytes: &[u8]) -> Result<UsgsResponse, FeedError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// HTTP client for the NWIS instantaneous-values service.
#[derive(Debug, Clone)]
pub struct UsgsClient {
    http: HttpFetcher,
    base_url: Url,
}

impl UsgsClient {
    pub fn new(http: HttpFetcher, base_url: &str) -> Result<Self, FeedError> {
        let base_url = Url::parse(base_url).map_err(|err| FeedError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { http, base_url })
    }

    pub fn request_url(&self, region_code: &str, window: &FetchWindow) -> Url {
        let mut url = self.base_url.clone();
        let (window_key, window_value) = window.query_pair();
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("stateCd", region_code)
            .append_pair(window_key, &window_value)
            .append_pair("siteStatus", "active");
        url
    }
}

#[async_trait]
impl FeedClient for UsgsClient {
    fn source_id(&self) -> &'static str {
        USGS_SOURCE_ID
    }

    async fn fetch(
        &self,
        region_code: &str,
        window: &FetchWindow,
    ) -> Result<UsgsResponse, FeedError> {
        let url = self.request_url(region_code, window);
        info!(%url, "fetching instantaneous values");

        let response = self.http.fetch_bytes(USGS_SOURCE_ID, &url).await?;
        let payload = decode_response(&response.body)?;
        info!(
            status = response.status.as_u16(),
            url = %response.final_url,
            series = payload.value.time_series.len(),
            "retrieved time series"
        );
        Ok(payload)
    }
}

/// Replays a captured feed response from disk regardless of region or window.
#[derive(Debug, Clone)]
pub struct FixtureFeedClient {
    path: PathBuf,
}

impl FixtureFeedClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedClient for FixtureFeedClient {
    fn source_id(&self) -> &'static str {
        USGS_SOURCE_ID
    }

    async fn fetch(
        &self,
        region_code: &str,
        window: &FetchWindow,
    ) -> Result<UsgsResponse, FeedError> {
        debug!(path = %self.path.display(), region_code, ?window, "replaying fixture response");
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FeedError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        decode_response(&bytes)
    }
}

pub fn load_fixture_response(path: impl AsRef<Path>) -> Result<UsgsResponse> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub external_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    pub value: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSeries {
    pub site: SiteInfo,
    pub parameter_code: String,
    pub unit_code: String,
    pub points: Vec<RawPoint>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedPayload {
    pub series: Vec<NormalizedSeries>,
    /// Distinct site identifiers in first-seen order.
    pub site_ids: Vec<String>,
}

impl NormalizedPayload {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    /// Site metadata from the first series that references `external_id`.
    pub fn site(&self, external_id: &str) -> Option<&SiteInfo> {
        self.series
            .iter()
            .map(|s| &s.site)
            .find(|site| site.external_id == external_id)
    }
}

/// Flatten the nested payload. Series without a usable site identifier are skipped whole;
/// values stay as strings so numeric parsing happens once, downstream.
pub fn normalize_payload(response: &UsgsResponse) -> NormalizedPayload {
    let mut seen = HashSet::new();
    let mut normalized = NormalizedPayload::default();

    for ts in &response.value.time_series {
        let Some(site_id) = ts.site_id() else {
            debug!(
                site_name = %ts.source_info.site_name,
                "skipping series without site identifier"
            );
            continue;
        };

        if seen.insert(site_id.to_string()) {
            normalized.site_ids.push(site_id.to_string());
        }

        let location = &ts.source_info.geo_location.geog_location;
        normalized.series.push(NormalizedSeries {
            site: SiteInfo {
                external_id: site_id.to_string(),
                name: ts.source_info.site_name.clone(),
                latitude: location.latitude,
                longitude: location.longitude,
            },
            parameter_code: ts.parameter_code().to_string(),
            unit_code: ts.variable.unit.unit_code.clone(),
            points: ts
                .values
                .iter()
                .flat_map(|set| set.value.iter())
                .map(|point| RawPoint {
                    value: point.value.clone(),
                    recorded_at: point.date_time,
                })
                .collect(),
        });
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn series(
        site_codes: &[&str],
        variable_codes: &[&str],
        points: &[(&str, &str)],
    ) -> serde_json::Value {
        let site_code: Vec<_> = site_codes
            .iter()
            .map(|c| json!({ "value": c, "agencyCode": "USGS" }))
            .collect();
        let variable_code: Vec<_> = variable_codes.iter().map(|c| json!({ "value": c })).collect();
        let values: Vec<_> = points
            .iter()
            .map(|(v, t)| json!({ "value": v, "dateTime": t }))
            .collect();
        json!({
            "sourceInfo": {
                "siteName": "RIO MAMEYES NR SABANA, PR",
                "siteCode": site_code,
                "geoLocation": {
                    "geogLocation": { "latitude": 18.32911111, "longitude": -65.7507778 }
                }
            },
            "variable": {
                "variableCode": variable_code,
                "unit": { "unitCode": "ft3/s" }
            },
            "values": [{ "value": values }]
        })
    }

    fn response(series: Vec<serde_json::Value>) -> UsgsResponse {
        serde_json::from_value(json!({ "value": { "timeSeries": series } })).unwrap()
    }

    #[test]
    fn series_without_site_identifier_is_skipped_entirely() {
        let payload = response(vec![
            series(&[], &["00060"], &[("1.0", "2026-02-25T08:00:00.000-04:00")]),
            series(&["  "], &["00060"], &[("2.0", "2026-02-25T08:00:00.000-04:00")]),
        ]);
        let normalized = normalize_payload(&payload);
        assert!(normalized.is_empty());
        assert!(normalized.site_ids.is_empty());
    }

    #[test]
    fn first_non_blank_site_code_is_used_verbatim() {
        let payload = response(vec![series(&["", "pr-0042"], &["00060"], &[])]);
        let normalized = normalize_payload(&payload);
        assert_eq!(normalized.site_ids, vec!["pr-0042".to_string()]);
        assert_eq!(normalized.series[0].site.external_id, "pr-0042");
    }

    #[test]
    fn crate_name_is_stable() {
        assert_eq!(CRATE_NAME, "aquatrack-adapters");
    }

    #[test]
    fn missing_parameter_code_defaults_to_unknown() {
        let point = ("1.0", "2026-02-25T08:00:00.000-04:00");
        let payload = response(vec![series(&["50065500"], &[], &[point])]);
        let normalized = normalize_payload(&payload);
        assert_eq!(normalized.series[0].parameter_code, UNKNOWN_PARAMETER);
        assert_eq!(normalized.series[0].unit_code, "ft3/s");
    }

    #[test]
    fn points_keep_raw_values_and_utc_timestamps() {
        let payload = response(vec![series(
            &["50065500"],
            &["00060"],
            &[("12.5", "2026-02-25T08:00:00.000-04:00"), ("bad", "2026-02-25T08:15:00.000-04:00")],
        )]);
        let normalized = normalize_payload(&payload);
        let points = &normalized.series[0].points;
        assert_eq!(normalized.point_count(), 2);
        assert_eq!(points[1].value.as_deref(), Some("bad"));
        assert_eq!(
            points[0].recorded_at,
            Utc.with_ymd_and_hms(2026, 2, 25, 12, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn distinct_site_ids_keep_first_seen_order() {
        let payload = response(vec![
            series(&["50065500"], &["00060"], &[]),
            series(&["50063800"], &["00060"], &[]),
            series(&["50065500"], &["00065"], &[]),
        ]);
        let normalized = normalize_payload(&payload);
        assert_eq!(normalized.site_ids, vec!["50065500".to_string(), "50063800".to_string()]);
        assert_eq!(normalized.series.len(), 3);
        assert!(normalized.site("50063800").is_some());
        assert!(normalized.site("00000000").is_none());
    }

    #[test]
    fn null_and_numeric_point_values_do_not_fail_decoding() {
        let payload = decode_response(
            br#"{"value": {"timeSeries": [{
                "sourceInfo": {
                    "siteName": "RIO MAMEYES NR SABANA, PR",
                    "siteCode": [{ "value": "50065500" }],
                    "geoLocation": { "geogLocation": { "latitude": 18.3, "longitude": -65.7 } }
                },
                "variable": {
                    "variableCode": [{ "value": "00060" }],
                    "unit": { "unitCode": "ft3/s" }
                },
                "values": [{ "value": [
                    { "value": "12.5", "dateTime": "2026-02-25T08:00:00.000-04:00" },
                    { "value": null, "dateTime": "2026-02-25T08:15:00.000-04:00" },
                    { "value": 13.1, "dateTime": "2026-02-25T08:30:00.000-04:00" },
                    { "dateTime": "2026-02-25T08:45:00.000-04:00" }
                ]}]
            }]}}"#,
        )
        .unwrap();

        let points = &normalize_payload(&payload).series[0].points;
        let values: Vec<Option<&str>> = points.iter().map(|p| p.value.as_deref()).collect();
        assert_eq!(values, vec![Some("12.5"), None, Some("13.1"), None]);
    }

    #[test]
    fn malformed_top_level_response_is_a_decode_error() {
        let err = decode_response(br#"{"value": {"timeSeries": "nope"}}"#).unwrap_err();
        assert!(matches!(err, FeedError::Decode(_)));
        assert!(decode_response(b"<html>503</html>").is_err());
    }

    #[test]
    fn lookback_periods_render_as_iso8601() {
        assert_eq!(iso8601_period(Duration::from_secs(30 * 60)), "PT30M");
        assert_eq!(iso8601_period(Duration::from_secs(2 * 3600)), "PT2H");
        assert_eq!(iso8601_period(Duration::from_secs(90)), "PT90S");
    }

    #[test]
    fn request_url_uses_start_boundary_when_watermark_known() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let client = UsgsClient::new(http, DEFAULT_USGS_IV_URL).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 2, 25, 12, 15, 0).single().unwrap();

        let url = client.request_url("PR", &FetchWindow::Since(start));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("stateCd".to_string(), "PR".to_string())));
        assert!(pairs.contains(&("format".to_string(), "json".to_string())));
        assert!(pairs.contains(&("startDT".to_string(), "2026-02-25T12:15:00.000Z".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "period"));

        let url = client.request_url("PR", &FetchWindow::Lookback(Duration::from_secs(1800)));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("period".to_string(), "PT30M".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "startDT"));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        assert!(matches!(
            UsgsClient::new(http, "not a url"),
            Err(FeedError::InvalidUrl { .. })
        ));
    }
}
