//! Core domain model for the Boston food inspections sync: raw source records,
//! normalized inspection rows, coordinate validation and sync provenance.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "bfi-core";

/// Source tag written to every provenance row produced by this dataset.
pub const SYNC_SOURCE: &str = "inspections";

/// Stand-in business name used for key derivation when the source omits it.
pub const UNKNOWN_BUSINESS: &str = "UNKNOWN";

/// Result codes counted as a passing inspection.
pub const PASSING_RESULTS: [&str; 4] = ["Pass", "HE_Pass", "NoViol", "PassViol"];

/// A completed sync older than this is reported as degraded.
pub const STALE_AFTER_HOURS: f64 = 36.0;

/// Inclusive latitude/longitude rectangle, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub const BOSTON: BoundingBox = BoundingBox {
        min_lat: 42.2,
        max_lat: 42.4,
        min_lng: -71.2,
        max_lng: -70.9,
    };

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lng..=self.max_lng).contains(&longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

fn coordinate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\(\s*([+-]?(?:[0-9]+\.?[0-9]*|\.[0-9]+))\s*,\s*([+-]?(?:[0-9]+\.?[0-9]*|\.[0-9]+))\s*\)")
            .expect("coordinate pattern is valid")
    })
}

/// Parse a `"(lat, lng)"` location string into coordinates inside the Boston
/// bounding box. Anything else, including out-of-box points, yields `None`.
pub fn parse_coordinates(location: Option<&str>) -> Option<Coordinates> {
    parse_coordinates_within(location, &BoundingBox::BOSTON)
}

pub fn parse_coordinates_within(location: Option<&str>, bounds: &BoundingBox) -> Option<Coordinates> {
    let location = location?.trim();
    if location.is_empty() {
        return None;
    }
    let captures = coordinate_pattern().captures(location)?;
    let latitude: f64 = captures.get(1)?.as_str().parse().ok()?;
    let longitude: f64 = captures.get(2)?.as_str().parse().ok()?;
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    bounds
        .contains(latitude, longitude)
        .then_some(Coordinates {
            latitude,
            longitude,
        })
}

/// Loosely typed record as returned by the datastore API. Missing keys and
/// explicit JSON nulls both read as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, JsonValue>);

impl RawRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// Field value rendered as text: strings verbatim, scalars in their JSON
    /// form.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, JsonValue>> for RawRecord {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// Identity of one violation line: business name, result timestamp and
/// violation code joined with `_`.
pub fn inspection_key(raw: &RawRecord) -> String {
    let business = raw
        .text("businessname")
        .unwrap_or_else(|| UNKNOWN_BUSINESS.to_string());
    let result_at = raw.text("resultdttm").unwrap_or_default();
    let violation = raw.text("violation").unwrap_or_default();
    format!("{business}_{result_at}_{violation}")
}

/// Storage-shaped inspection row. Date fields stay in their source string
/// form; the store parses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub inspection_key: String,
    pub businessname: Option<String>,
    pub dbaname: Option<String>,
    pub legalowner: Option<String>,
    pub licenseno: Option<String>,
    pub licstatus: Option<String>,
    pub licensecat: Option<String>,
    pub license_issued_date: Option<String>,
    pub license_expiration_date: Option<String>,
    pub result: Option<String>,
    pub resultdttm: Option<String>,
    pub violation_code: Option<String>,
    pub viol_level: Option<String>,
    pub violdesc: Option<String>,
    pub violdttm: Option<String>,
    pub viol_status: Option<String>,
    pub comments: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub property_id: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl InspectionRecord {
    pub fn from_raw(raw: &RawRecord) -> Self {
        Self {
            inspection_key: inspection_key(raw),
            businessname: raw.text("businessname"),
            dbaname: raw.text("dbaname"),
            legalowner: raw.text("legalowner"),
            licenseno: raw.text("licenseno"),
            licstatus: raw.text("licstatus"),
            licensecat: raw.text("licensecat"),
            license_issued_date: raw.text("issdttm"),
            license_expiration_date: raw.text("expdttm"),
            result: raw.text("result"),
            resultdttm: raw.text("resultdttm"),
            violation_code: raw.text("violation"),
            viol_level: raw.text("viol_level"),
            violdesc: raw.text("violdesc"),
            violdttm: raw.text("violdttm"),
            viol_status: raw.text("viol_status"),
            comments: raw.text("comments"),
            address: raw.text("address"),
            city: raw.text("city"),
            state: raw.text("state"),
            zip: raw.text("zip"),
            property_id: raw.text("property_id"),
            coordinates: parse_coordinates(raw.text("location").as_deref()),
        }
    }

    pub fn latitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(SyncStatus::Running),
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Terminal state written to a provenance row when a run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
}

impl SyncOutcome {
    pub fn success(counts: SyncCounts) -> Self {
        Self {
            status: SyncStatus::Success,
            counts,
            error_message: None,
        }
    }

    pub fn failed(counts: SyncCounts, message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Error,
            counts,
            error_message: Some(message.into()),
        }
    }
}

/// One row of the provenance log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i32,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<SyncStatus>,
    pub records_fetched: Option<i32>,
    pub records_inserted: Option<i32>,
    pub records_updated: Option<i32>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub database: String,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours_since_sync: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_synced: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn database_error(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            database: "error".to_string(),
            last_sync: None,
            hours_since_sync: None,
            records_synced: None,
            warning: None,
            error: Some(message.into()),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.status != HealthState::Unhealthy
    }
}

/// Health derived from the most recent provenance row. Staleness is measured
/// from completion, or from the start time of a run that never finished.
pub fn assess_health(last: Option<&SyncRun>, now: DateTime<Utc>) -> HealthReport {
    let Some(run) = last else {
        return HealthReport {
            status: HealthState::Unhealthy,
            database: "connected".to_string(),
            last_sync: None,
            hours_since_sync: None,
            records_synced: None,
            warning: None,
            error: Some("No sync records found".to_string()),
        };
    };

    let reference = run.completed_at.unwrap_or(run.started_at);
    let hours = (now - reference).num_seconds() as f64 / 3600.0;
    let mut report = HealthReport {
        status: HealthState::Healthy,
        database: "connected".to_string(),
        last_sync: run.completed_at,
        hours_since_sync: Some(round_tenths(hours)),
        records_synced: None,
        warning: None,
        error: None,
    };

    if hours > STALE_AFTER_HOURS {
        report.status = HealthState::Degraded;
        report.warning = Some(format!(
            "Last sync was more than {STALE_AFTER_HOURS} hours ago"
        ));
    } else if run.status == Some(SyncStatus::Error) {
        report.status = HealthState::Degraded;
        report.warning = Some(format!(
            "Last sync failed: {}",
            run.error_message.as_deref().unwrap_or("Unknown error")
        ));
    } else {
        report.records_synced = Some(
            i64::from(run.records_inserted.unwrap_or(0)) + i64::from(run.records_updated.unwrap_or(0)),
        );
    }
    report
}

pub fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn sample_raw() -> RawRecord {
        RawRecord::new()
            .with("businessname", "Sullivan's Castle Island")
            .with("dbaname", "Sullivan's")
            .with("licenseno", "24153")
            .with("licstatus", "Active")
            .with("issdttm", "2025-01-01 00:00:00")
            .with("expdttm", "2026-12-31 23:59:00")
            .with("result", "HE_Pass")
            .with("resultdttm", "2026-02-20 10:15:00")
            .with("violation", "37")
            .with("viol_level", "*")
            .with("violdesc", "Food Contact Surfaces Clean")
            .with("address", "2080 William J Day Blvd")
            .with("city", "South Boston")
            .with("state", "MA")
            .with("zip", "02127")
            .with("location", "(42.33706, -71.02425)")
    }

    #[test]
    fn parses_in_box_coordinates_exactly() {
        let cases = [
            ("(42.35108502118551, -71.0607889159121)", 42.35108502118551, -71.0607889159121),
            ("(42.3580012487741, -71.05424532932895)", 42.3580012487741, -71.05424532932895),
            ("(42.26, -71.17)", 42.26, -71.17),
            ("  (42.3 ,-71.0)  ", 42.3, -71.0),
            ("(+42.3, -71.0)", 42.3, -71.0),
            ("(42.3, -71.)", 42.3, -71.0),
            ("(42.25, -71.)", 42.25, -71.0),
        ];
        for (input, lat, lng) in cases {
            let parsed = parse_coordinates(Some(input)).unwrap_or_else(|| panic!("{input} should parse"));
            assert_eq!(parsed.latitude, lat);
            assert_eq!(parsed.longitude, lng);
        }
    }

    #[test]
    fn bounding_box_edges_are_inclusive() {
        assert!(parse_coordinates(Some("(42.2, -71.2)")).is_some());
        assert!(parse_coordinates(Some("(42.4, -70.9)")).is_some());
        assert!(parse_coordinates(Some("(42.41, -71.0)")).is_none());
        assert!(parse_coordinates(Some("(42.3, -70.89)")).is_none());
    }

    #[test]
    fn rejects_missing_malformed_and_out_of_region_input() {
        let rejected = [
            None,
            Some(""),
            Some("   "),
            Some("invalid"),
            Some("(40.7128, -74.0060)"),
            Some("42.351, -71.060"),
            Some("(42.351 -71.060)"),
            Some("(abc, def)"),
            Some("(1-2, -71.0)"),
            Some("(42.3, )"),
            Some("(NaN, inf)"),
            Some("(-42.3, 71.0)"),
        ];
        for input in rejected {
            assert_eq!(parse_coordinates(input), None, "{input:?} should be rejected");
        }
    }

    #[test]
    fn key_joins_business_result_time_and_violation() {
        assert_eq!(
            inspection_key(&sample_raw()),
            "Sullivan's Castle Island_2026-02-20 10:15:00_37"
        );
    }

    #[test]
    fn key_substitutes_sentinel_for_missing_business() {
        let raw = RawRecord::new()
            .with("resultdttm", "2026-02-20 10:15:00")
            .with("violation", 12);
        assert_eq!(inspection_key(&raw), "UNKNOWN_2026-02-20 10:15:00_12");

        let null_name = raw.clone().with("businessname", JsonValue::Null);
        assert_eq!(inspection_key(&null_name), "UNKNOWN_2026-02-20 10:15:00_12");
    }

    #[test]
    fn key_tolerates_an_empty_record() {
        assert_eq!(inspection_key(&RawRecord::new()), "UNKNOWN__");
        let record = InspectionRecord::from_raw(&RawRecord::new());
        assert_eq!(record.businessname, None);
        assert_eq!(record.coordinates, None);
    }

    #[test]
    fn normalizes_source_fields_into_storage_columns() {
        let record = InspectionRecord::from_raw(&sample_raw());
        assert_eq!(record.violation_code.as_deref(), Some("37"));
        assert_eq!(record.license_issued_date.as_deref(), Some("2025-01-01 00:00:00"));
        assert_eq!(record.license_expiration_date.as_deref(), Some("2026-12-31 23:59:00"));
        assert_eq!(record.zip.as_deref(), Some("02127"));
        assert_eq!(record.latitude(), Some(42.33706));
        assert_eq!(record.longitude(), Some(-71.02425));
        assert_eq!(record.comments, None);
    }

    #[test]
    fn out_of_box_location_drops_both_coordinates() {
        let raw = sample_raw().with("location", "(42.9, -71.0)");
        let record = InspectionRecord::from_raw(&raw);
        assert_eq!(record.latitude(), None);
        assert_eq!(record.longitude(), None);
    }

    #[test]
    fn raw_record_deserializes_from_api_json() {
        let raw: RawRecord = serde_json::from_value(json!({
            "_id": 7,
            "businessname": "Flour Bakery",
            "violation": null,
            "property_id": 123456
        }))
        .unwrap();
        assert_eq!(raw.text("businessname").as_deref(), Some("Flour Bakery"));
        assert_eq!(raw.text("violation"), None);
        assert_eq!(raw.text("property_id").as_deref(), Some("123456"));
        assert_eq!(raw.len(), 4);
    }

    fn run(status: SyncStatus, started: DateTime<Utc>, completed: Option<DateTime<Utc>>) -> SyncRun {
        SyncRun {
            id: 1,
            source: SYNC_SOURCE.to_string(),
            started_at: started,
            completed_at: completed,
            status: Some(status),
            records_fetched: Some(120),
            records_inserted: Some(20),
            records_updated: Some(95),
            error_message: None,
        }
    }

    #[test]
    fn health_without_runs_is_unhealthy() {
        let report = assess_health(None, at(12));
        assert_eq!(report.status, HealthState::Unhealthy);
        assert!(!report.is_serving());
        assert_eq!(report.error.as_deref(), Some("No sync records found"));
    }

    #[test]
    fn fresh_successful_run_is_healthy() {
        let last = run(SyncStatus::Success, at(6), Some(at(7)));
        let report = assess_health(Some(&last), at(12));
        assert_eq!(report.status, HealthState::Healthy);
        assert_eq!(report.records_synced, Some(115));
        assert_eq!(report.hours_since_sync, Some(5.0));
        assert_eq!(report.last_sync, Some(at(7)));
    }

    #[test]
    fn stale_run_is_degraded_with_hours() {
        let completed = at(7);
        let last = run(SyncStatus::Success, at(6), Some(completed));
        let now = completed + Duration::hours(40) + Duration::minutes(30);
        let report = assess_health(Some(&last), now);
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(report.hours_since_sync, Some(40.5));
        assert!(report.warning.as_deref().unwrap().contains("36"));
        assert!(report.is_serving());
    }

    #[test]
    fn failed_run_is_degraded_with_message() {
        let mut last = run(SyncStatus::Error, at(6), Some(at(7)));
        last.error_message = Some("CKAN API error: timeout".to_string());
        let report = assess_health(Some(&last), at(8));
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(
            report.warning.as_deref(),
            Some("Last sync failed: CKAN API error: timeout")
        );
        assert_eq!(report.records_synced, None);
    }

    #[test]
    fn unfinished_run_ages_from_start() {
        let last = run(SyncStatus::Running, at(0), None);
        let report = assess_health(Some(&last), at(0) + Duration::hours(48));
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(report.last_sync, None);
    }

    #[test]
    fn sync_status_round_trips_through_text() {
        for status in [SyncStatus::Running, SyncStatus::Success, SyncStatus::Error] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("cancelled"), None);
    }
}
