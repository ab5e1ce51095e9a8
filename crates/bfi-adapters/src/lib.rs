//! CKAN datastore adapter: query templating, response decoding and the
//! paginated fetch that walks a date window to exhaustion.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bfi_core::RawRecord;
use bfi_storage::{HttpError, HttpFetcher};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "bfi-adapters";

pub const DEFAULT_CKAN_SQL_API_URL: &str = "https://data.boston.gov/api/3/action/datastore_search_sql";

/// Food Establishment Inspections resource on Analyze Boston.
pub const DEFAULT_RESOURCE_ID: &str = "4582bec6-2b4f-4f9e-bc55-cbaa73117f4c";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("CKAN API error: {0}")]
    Api(String),
    #[error("malformed datastore response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Http(HttpError::Timeout(_)))
    }
}

/// Lower bound on `resultdttm` for one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub cutoff: NaiveDate,
}

impl FetchWindow {
    pub fn trailing_days(days: u32, today: NaiveDate) -> Self {
        let cutoff = today
            .checked_sub_days(chrono::Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { cutoff }
    }

    pub fn trailing_days_from_today(days: u32) -> Self {
        Self::trailing_days(days, Local::now().date_naive())
    }
}

/// One page of the windowed inspection query, newest results first.
pub fn window_sql(resource_id: &str, window: &FetchWindow, limit: usize, offset: usize) -> String {
    let table = resource_id.replace('"', "\"\"");
    format!(
        r#"SELECT * FROM "{table}" WHERE "resultdttm" >= '{cutoff}' ORDER BY "resultdttm" DESC LIMIT {limit} OFFSET {offset}"#,
        cutoff = window.cutoff.format("%Y-%m-%d"),
    )
}

#[derive(Debug, Deserialize)]
struct DatastoreEnvelope {
    success: bool,
    #[serde(default)]
    result: Option<DatastoreResult>,
    #[serde(default)]
    error: Option<DatastoreErrorBody>,
}

#[derive(Debug, Deserialize)]
struct DatastoreResult {
    records: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct DatastoreErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Decode a `datastore_search_sql` response body into its records.
pub fn parse_datastore_page(body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let envelope: DatastoreEnvelope = serde_json::from_slice(body)?;
    if !envelope.success {
        let message = envelope
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| "Unknown API error".to_string());
        return Err(FetchError::Api(message));
    }
    envelope
        .result
        .map(|r| r.records)
        .ok_or_else(|| FetchError::Api("response is missing a result".to_string()))
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_datastore_page(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Source of result pages for a fetch window.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        window: &FetchWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct CkanDatastore {
    http: HttpFetcher,
    api_url: String,
    resource_id: String,
}

impl CkanDatastore {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            resource_id: resource_id.into(),
        }
    }
}

#[async_trait]
impl PageSource for CkanDatastore {
    async fn fetch_page(
        &self,
        window: &FetchWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let sql = window_sql(&self.resource_id, window, limit, offset);
        debug!(%sql, "querying datastore");
        match self.http.get_with_query(&self.api_url, &[("sql", sql.as_str())]).await {
            Ok(resp) => parse_datastore_page(&resp.body),
            // CKAN reports query errors with a 4xx status and a normal envelope.
            Err(HttpError::HttpStatus { status, url, body }) => match parse_datastore_page(&body) {
                Err(api @ FetchError::Api(_)) => Err(api),
                _ => Err(FetchError::Http(HttpError::HttpStatus { status, url, body })),
            },
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PagingPolicy {
    pub page_size: usize,
    pub page_delay: Duration,
}

impl Default for PagingPolicy {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            page_delay: Duration::from_secs(1),
        }
    }
}

/// Fetch every record in `window`, page by page.
///
/// The offset advances by the number of records each page actually returned.
/// Paging stops at an empty page or at the first page shorter than
/// `page_size`; a short page is taken as the end of the result set without a
/// confirming request. Any page error fails the whole fetch and discards the
/// pages already collected.
pub async fn fetch_all<S>(
    source: &S,
    window: &FetchWindow,
    policy: &PagingPolicy,
) -> Result<Vec<RawRecord>, FetchError>
where
    S: PageSource + ?Sized,
{
    let page_size = policy.page_size.max(1);
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        info!(cutoff = %window.cutoff, offset, "fetching inspection page");
        let page = source.fetch_page(window, page_size, offset).await?;
        if page.is_empty() {
            info!(total = records.len(), "no more records");
            break;
        }

        let returned = page.len();
        records.extend(page);
        offset += returned;
        info!(returned, total = records.len(), "fetched page");

        if returned < page_size {
            info!(page_size, "short page, pagination complete");
            break;
        }

        tokio::time::sleep(policy.page_delay).await;
    }

    Ok(records)
}
