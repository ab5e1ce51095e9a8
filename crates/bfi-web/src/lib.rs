//! Axum JSON API over the inspections store, plus static hosting for the
//! dashboard front end.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bfi_core::{assess_health, round_tenths, HealthReport, PASSING_RESULTS, SYNC_SOURCE};
use bfi_storage::{InspectionStore, PgStore};
use bfi_sync::env_parse;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "bfi-web";

const DEFAULT_DAYS: i64 = 90;
const MAX_DAYS: i64 = 3650;
const DEFAULT_LIMIT: i64 = 1000;
const MAX_LIMIT: i64 = 5000;
const TOP_ZIPS: i64 = 15;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: String,
    pub frontend_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8000),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/boston_inspections".to_string()),
            frontend_dir: std::env::var("FRONTEND_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./frontend")),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: PgStore,
    pub frontend_dir: PathBuf,
}

impl AppState {
    pub fn new(store: PgStore, frontend_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            frontend_dir: frontend_dir.into(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/inspections", get(inspections_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/neighborhoods", get(neighborhoods_handler))
        .route("/api/results", get(results_handler))
        .route("/api/health", get(health_handler))
        .fallback(static_handler)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Connect, make sure the schema exists, and serve until shutdown.
pub async fn serve(config: &ServerConfig) -> anyhow::Result<()> {
    let store = PgStore::connect(&config.database_url).await?;
    store.ensure_schema().await?;
    if !config.frontend_dir.is_dir() {
        warn!(dir = %config.frontend_dir.display(), "frontend directory missing; static files will 404");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "serving inspections API");
    axum::serve(listener, app(AppState::new(store, &config.frontend_dir))).await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct InspectionsQuery {
    pub zip: Option<String>,
    pub result: Option<String>,
    pub days: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionFilter {
    pub zip: Option<String>,
    pub result: Option<String>,
    pub days: i32,
    pub limit: i64,
    pub offset: i64,
}

impl InspectionsQuery {
    pub fn validate(self) -> Result<InspectionFilter, String> {
        let days = check_range("days", self.days.unwrap_or(DEFAULT_DAYS), 1, MAX_DAYS)?;
        let limit = check_range("limit", self.limit.unwrap_or(DEFAULT_LIMIT), 1, MAX_LIMIT)?;
        let offset = check_range("offset", self.offset.unwrap_or(0), 0, i64::MAX)?;
        Ok(InspectionFilter {
            zip: self.zip.filter(|z| !z.is_empty()),
            result: self.result.filter(|r| !r.is_empty()),
            days: days as i32,
            limit,
            offset,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<i64>,
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<i64, String> {
    if value < min || value > max {
        if max == i64::MAX {
            return Err(format!("{name} must be at least {min}"));
        }
        return Err(format!("{name} must be between {min} and {max}"));
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionRow {
    pub id: i32,
    pub inspection_key: String,
    pub businessname: Option<String>,
    pub dbaname: Option<String>,
    pub legalowner: Option<String>,
    pub licenseno: Option<String>,
    pub licstatus: Option<String>,
    pub licensecat: Option<String>,
    pub license_issued_date: Option<NaiveDateTime>,
    pub license_expiration_date: Option<NaiveDateTime>,
    pub result: Option<String>,
    pub resultdttm: Option<NaiveDateTime>,
    pub violation_code: Option<String>,
    pub viol_level: Option<String>,
    pub violdesc: Option<String>,
    pub violdttm: Option<NaiveDateTime>,
    pub viol_status: Option<String>,
    pub comments: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub property_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InspectionRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            inspection_key: row.try_get("inspection_key")?,
            businessname: row.try_get("businessname")?,
            dbaname: row.try_get("dbaname")?,
            legalowner: row.try_get("legalowner")?,
            licenseno: row.try_get("licenseno")?,
            licstatus: row.try_get("licstatus")?,
            licensecat: row.try_get("licensecat")?,
            license_issued_date: row.try_get("license_issued_date")?,
            license_expiration_date: row.try_get("license_expiration_date")?,
            result: row.try_get("result")?,
            resultdttm: row.try_get("resultdttm")?,
            violation_code: row.try_get("violation_code")?,
            viol_level: row.try_get("viol_level")?,
            violdesc: row.try_get("violdesc")?,
            violdttm: row.try_get("violdttm")?,
            viol_status: row.try_get("viol_status")?,
            comments: row.try_get("comments")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            zip: row.try_get("zip")?,
            property_id: row.try_get("property_id")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct InspectionPage {
    pub data: Vec<InspectionRow>,
    pub count: usize,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct ResultCount {
    pub result: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct ZipCount {
    pub zip: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub period_days: i32,
    pub total_establishments: i64,
    pub pass_rate: f64,
    pub total_violations: i64,
    pub by_result: Vec<ResultCount>,
    pub by_zip: Vec<ZipCount>,
}

#[derive(Debug, Serialize)]
pub struct ResultOption {
    pub code: String,
    pub label: String,
}

// Rows in the window, with coordinates, narrowed by the optional filters.
const WINDOW_WITH_COORDS: &str = r#"
    resultdttm >= CURRENT_DATE - make_interval(days => $1)
    AND ($2::text IS NULL OR zip = $2::text)
    AND ($3::text IS NULL OR result = $3::text)
    AND latitude IS NOT NULL
    AND longitude IS NOT NULL
"#;

pub async fn fetch_inspections(pool: &PgPool, filter: &InspectionFilter) -> Result<InspectionPage, sqlx::Error> {
    let page_sql = format!(
        r#"
        WITH latest_inspections AS (
            SELECT DISTINCT ON (businessname, address) *
              FROM inspections
             WHERE {WINDOW_WITH_COORDS}
             ORDER BY businessname, address, resultdttm DESC
        )
        SELECT * FROM latest_inspections
         ORDER BY resultdttm DESC
         LIMIT $4 OFFSET $5
        "#
    );
    let rows = sqlx::query(&page_sql)
        .bind(filter.days)
        .bind(filter.zip.as_deref())
        .bind(filter.result.as_deref())
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await?;
    let data = rows.iter().map(InspectionRow::from_row).collect::<Result<Vec<_>, _>>()?;

    let count_sql = format!(
        "SELECT COUNT(DISTINCT businessname || '_' || address) AS n FROM inspections WHERE {WINDOW_WITH_COORDS}"
    );
    let total: i64 = sqlx::query(&count_sql)
        .bind(filter.days)
        .bind(filter.zip.as_deref())
        .bind(filter.result.as_deref())
        .fetch_one(pool)
        .await?
        .try_get("n")?;

    Ok(InspectionPage {
        count: data.len(),
        data,
        total,
        limit: filter.limit,
        offset: filter.offset,
    })
}

pub async fn fetch_stats(pool: &PgPool, days: i32) -> Result<Stats, sqlx::Error> {
    let total_establishments: i64 = sqlx::query(
        r#"
        SELECT COUNT(DISTINCT businessname || '_' || address) AS n
          FROM inspections
         WHERE resultdttm >= CURRENT_DATE - make_interval(days => $1)
        "#,
    )
    .bind(days)
    .fetch_one(pool)
    .await?
    .try_get("n")?;

    let passing: Vec<String> = PASSING_RESULTS.iter().map(|r| r.to_string()).collect();
    let pass_row = sqlx::query(
        r#"
        WITH latest_by_business AS (
            SELECT DISTINCT ON (businessname, address) result
              FROM inspections
             WHERE resultdttm >= CURRENT_DATE - make_interval(days => $1)
             ORDER BY businessname, address, resultdttm DESC
        )
        SELECT COUNT(*) FILTER (WHERE result = ANY($2)) AS passed,
               COUNT(*) AS total
          FROM latest_by_business
        "#,
    )
    .bind(days)
    .bind(passing)
    .fetch_one(pool)
    .await?;
    let pass_rate = pass_rate(pass_row.try_get("passed")?, pass_row.try_get("total")?);

    let total_violations: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS n
          FROM inspections
         WHERE resultdttm >= CURRENT_DATE - make_interval(days => $1)
           AND violation_code IS NOT NULL
        "#,
    )
    .bind(days)
    .fetch_one(pool)
    .await?
    .try_get("n")?;

    let by_result = sqlx::query(
        r#"
        WITH latest_by_business AS (
            SELECT DISTINCT ON (businessname, address) result
              FROM inspections
             WHERE resultdttm >= CURRENT_DATE - make_interval(days => $1)
             ORDER BY businessname, address, resultdttm DESC
        )
        SELECT result, COUNT(*) AS n
          FROM latest_by_business
         WHERE result IS NOT NULL
         GROUP BY result
         ORDER BY n DESC
        "#,
    )
    .bind(days)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| -> Result<ResultCount, sqlx::Error> {
        Ok(ResultCount {
            result: row.try_get("result")?,
            count: row.try_get("n")?,
        })
    })
    .collect::<Result<Vec<_>, _>>()?;

    let by_zip = sqlx::query(
        r#"
        WITH latest_by_business AS (
            SELECT DISTINCT ON (businessname, address) zip
              FROM inspections
             WHERE resultdttm >= CURRENT_DATE - make_interval(days => $1)
             ORDER BY businessname, address, resultdttm DESC
        )
        SELECT zip, COUNT(*) AS n
          FROM latest_by_business
         WHERE zip IS NOT NULL
         GROUP BY zip
         ORDER BY n DESC
         LIMIT $2
        "#,
    )
    .bind(days)
    .bind(TOP_ZIPS)
    .fetch_all(pool)
    .await?
    .iter()
    .map(zip_count)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        period_days: days,
        total_establishments,
        pass_rate,
        total_violations,
        by_result,
        by_zip,
    })
}

pub async fn fetch_neighborhoods(pool: &PgPool) -> Result<Vec<ZipCount>, sqlx::Error> {
    sqlx::query(
        r#"
        SELECT zip, COUNT(DISTINCT businessname || '_' || address) AS n
          FROM inspections
         WHERE zip IS NOT NULL
         GROUP BY zip
         ORDER BY zip
        "#,
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(zip_count)
    .collect()
}

pub async fn fetch_result_options(pool: &PgPool) -> Result<Vec<ResultOption>, sqlx::Error> {
    sqlx::query("SELECT DISTINCT result FROM inspections WHERE result IS NOT NULL ORDER BY result")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| -> Result<ResultOption, sqlx::Error> {
            let code: String = row.try_get("result")?;
            Ok(ResultOption {
                label: code.clone(),
                code,
            })
        })
        .collect()
}

fn zip_count(row: &PgRow) -> Result<ZipCount, sqlx::Error> {
    Ok(ZipCount {
        zip: row.try_get("zip")?,
        count: row.try_get("n")?,
    })
}

/// Percentage of passing establishments, to one decimal. Zero when the
/// window is empty.
pub fn pass_rate(passed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    round_tenths(passed as f64 / total as f64 * 100.0)
}

async fn inspections_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<InspectionsQuery>, QueryRejection>,
) -> Response {
    let filter = match query.map_err(|e| e.body_text()).and_then(|Query(q)| q.validate()) {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };
    match fetch_inspections(state.store.pool(), &filter).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error("inspections", err),
    }
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Response {
    let days = match query
        .map_err(|e| e.body_text())
        .and_then(|Query(q)| check_range("days", q.days.unwrap_or(DEFAULT_DAYS), 1, MAX_DAYS))
    {
        Ok(days) => days as i32,
        Err(message) => return bad_request(message),
    };
    match fetch_stats(state.store.pool(), days).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error("stats", err),
    }
}

async fn neighborhoods_handler(State(state): State<Arc<AppState>>) -> Response {
    match fetch_neighborhoods(state.store.pool()).await {
        Ok(data) => Json(json!({ "data": data })).into_response(),
        Err(err) => server_error("neighborhoods", err),
    }
}

async fn results_handler(State(state): State<Arc<AppState>>) -> Response {
    match fetch_result_options(state.store.pool()).await {
        Ok(data) => Json(json!({ "data": data })).into_response(),
        Err(err) => server_error("result types", err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = match state.store.last_sync_run(SYNC_SOURCE).await {
        Ok(last) => assess_health(last.as_ref(), Utc::now()),
        Err(err) => {
            error!(error = %err, "health check failed");
            HealthReport::database_error(err.to_string())
        }
    };
    let status = if report.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn static_handler(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let Some(mut path) = resolve_static_path(&state.frontend_dir, uri.path()) else {
        return not_found();
    };
    if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
        path.push("index.html");
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Err(_) => not_found(),
    }
}

/// Map a request path onto `root`. Anything that is not a plain relative
/// path (parent references, absolute prefixes) is refused.
pub fn resolve_static_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "geojson" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(what: &str, err: impl std::fmt::Display) -> Response {
    error!(error = %err, "error fetching {what}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}
