//! Postgres persistence for inspection rows and the sync provenance log, plus
//! the HTTP fetch utilities used to reach the upstream datastore.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bfi_core::{InspectionRecord, SyncOutcome, SyncRun, SyncStatus};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "bfi-storage";

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS inspections (
        id SERIAL PRIMARY KEY,
        inspection_key VARCHAR(255) UNIQUE NOT NULL,
        businessname VARCHAR(255),
        dbaname VARCHAR(255),
        legalowner VARCHAR(255),
        licenseno VARCHAR(50),
        licstatus VARCHAR(50),
        licensecat VARCHAR(100),
        license_issued_date TIMESTAMP,
        license_expiration_date TIMESTAMP,
        result VARCHAR(50),
        resultdttm TIMESTAMP,
        violation_code VARCHAR(50),
        viol_level VARCHAR(10),
        violdesc TEXT,
        violdttm TIMESTAMP,
        viol_status VARCHAR(50),
        comments TEXT,
        address VARCHAR(255),
        city VARCHAR(100),
        state VARCHAR(10),
        zip VARCHAR(10),
        property_id VARCHAR(50),
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT inspections_coordinates_paired
            CHECK ((latitude IS NULL) = (longitude IS NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_inspections_resultdttm ON inspections(resultdttm DESC)",
    "CREATE INDEX IF NOT EXISTS idx_inspections_businessname ON inspections(businessname)",
    "CREATE INDEX IF NOT EXISTS idx_inspections_zip ON inspections(zip)",
    "CREATE INDEX IF NOT EXISTS idx_inspections_result ON inspections(result)",
    "CREATE INDEX IF NOT EXISTS idx_inspections_licstatus ON inspections(licstatus)",
    "CREATE INDEX IF NOT EXISTS idx_inspections_coords ON inspections(latitude, longitude)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_log (
        id SERIAL PRIMARY KEY,
        source VARCHAR(50) NOT NULL DEFAULT 'inspections',
        started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at TIMESTAMPTZ,
        status VARCHAR(20),
        records_fetched INTEGER,
        records_inserted INTEGER,
        records_updated INTEGER,
        error_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sync_log_source ON sync_log(source)",
    "CREATE INDEX IF NOT EXISTS idx_sync_log_started ON sync_log(started_at DESC)",
];

const UPSERT_INSPECTION_SQL: &str = r#"
    INSERT INTO inspections (
        inspection_key, businessname, dbaname, legalowner,
        licenseno, licstatus, licensecat,
        license_issued_date, license_expiration_date,
        result, resultdttm,
        violation_code, viol_level, violdesc, violdttm, viol_status,
        comments, address, city, state, zip,
        property_id, latitude, longitude,
        created_at, updated_at
    ) VALUES (
        $1, $2, $3, $4,
        $5, $6, $7,
        NULLIF($8, '')::timestamp, NULLIF($9, '')::timestamp,
        $10, NULLIF($11, '')::timestamp,
        $12, $13, $14, NULLIF($15, '')::timestamp, $16,
        $17, $18, $19, $20, $21,
        $22, $23, $24,
        clock_timestamp(), clock_timestamp()
    )
    ON CONFLICT (inspection_key) DO UPDATE SET
        businessname = EXCLUDED.businessname,
        dbaname = EXCLUDED.dbaname,
        legalowner = EXCLUDED.legalowner,
        licenseno = EXCLUDED.licenseno,
        licstatus = EXCLUDED.licstatus,
        licensecat = EXCLUDED.licensecat,
        license_issued_date = EXCLUDED.license_issued_date,
        license_expiration_date = EXCLUDED.license_expiration_date,
        result = EXCLUDED.result,
        resultdttm = EXCLUDED.resultdttm,
        violation_code = EXCLUDED.violation_code,
        viol_level = EXCLUDED.viol_level,
        violdesc = EXCLUDED.violdesc,
        violdttm = EXCLUDED.violdttm,
        viol_status = EXCLUDED.viol_status,
        comments = EXCLUDED.comments,
        address = EXCLUDED.address,
        city = EXCLUDED.city,
        state = EXCLUDED.state,
        zip = EXCLUDED.zip,
        property_id = EXCLUDED.property_id,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        updated_at = clock_timestamp()
    RETURNING (xmax = 0) AS inserted
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unreachable: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("database query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("sync run {0} is not in the running state")]
    RunNotRunning(i32),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err),
            other => StoreError::Query(other),
        }
    }
}

/// A single inspection row could not be written.
#[derive(Debug, Error)]
#[error("failed to upsert inspection for {business}: {source}")]
pub struct UpsertError {
    pub business: String,
    pub inspection_key: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl UpsertError {
    pub fn new(
        record: &InspectionRecord,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            business: record
                .businessname
                .clone()
                .unwrap_or_else(|| bfi_core::UNKNOWN_BUSINESS.to_string()),
            inspection_key: record.inspection_key.clone(),
            source: source.into(),
        }
    }
}

/// Failure from one upsert inside a batch. `Record` only affects that row;
/// `Store` means the batch connection itself is gone.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Record(#[from] UpsertError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BatchError {
    fn from_sqlx(record: &InspectionRecord, err: sqlx::Error) -> Self {
        match StoreError::from(err) {
            StoreError::Connection(err) => BatchError::Store(StoreError::Connection(err)),
            StoreError::Query(err) => BatchError::Record(UpsertError::new(record, err)),
            other => BatchError::Store(other),
        }
    }
}

/// Persistence seam used by the sync orchestrator.
#[async_trait]
pub trait InspectionStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert a `running` provenance row, committed immediately.
    async fn open_sync_run(&self, source: &str) -> Result<i32, StoreError>;

    /// Start the transaction that holds every upsert of one run.
    async fn begin_batch(&self) -> Result<Box<dyn UpsertBatch>, StoreError>;

    /// Move a `running` row to its terminal state. Fails if the row is
    /// already terminal.
    async fn finish_sync_run(&self, run_id: i32, outcome: &SyncOutcome) -> Result<(), StoreError>;

    async fn last_sync_run(&self, source: &str) -> Result<Option<SyncRun>, StoreError>;
}

/// Open write transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait UpsertBatch: Send {
    /// Returns `true` when the row was created, `false` when an existing row
    /// was overwritten.
    async fn upsert(&mut self, record: &InspectionRecord) -> Result<bool, BatchError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    /// Pool that defers connecting until first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert outside of a sync run, in its own transaction.
    pub async fn upsert_one(&self, record: &InspectionRecord) -> Result<bool, UpsertError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| UpsertError::new(record, err))?;
        upsert_inspection(&mut *conn, record)
            .await
            .map_err(|err| UpsertError::new(record, err))
    }
}

#[async_trait]
impl InspectionStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(*statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("database schema ready");
        Ok(())
    }

    async fn open_sync_run(&self, source: &str) -> Result<i32, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_log (source, started_at, status)
            VALUES ($1, now(), $2)
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(SyncStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn begin_batch(&self) -> Result<Box<dyn UpsertBatch>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBatch { tx }))
    }

    async fn finish_sync_run(&self, run_id: i32, outcome: &SyncOutcome) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_log
               SET completed_at = now(),
                   status = $1,
                   records_fetched = $2,
                   records_inserted = $3,
                   records_updated = $4,
                   error_message = $5
             WHERE id = $6
               AND status = 'running'
            "#,
        )
        .bind(outcome.status.as_str())
        .bind(db_count(outcome.counts.fetched))
        .bind(db_count(outcome.counts.inserted))
        .bind(db_count(outcome.counts.updated))
        .bind(outcome.error_message.as_deref())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotRunning(run_id));
        }
        Ok(())
    }

    async fn last_sync_run(&self, source: &str) -> Result<Option<SyncRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source, started_at, completed_at, status,
                   records_fetched, records_inserted, records_updated, error_message
              FROM sync_log
             WHERE source = $1
             ORDER BY started_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_run_from_row).transpose()
    }
}

struct PgBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UpsertBatch for PgBatch {
    async fn upsert(&mut self, record: &InspectionRecord) -> Result<bool, BatchError> {
        // A failed statement aborts the whole Postgres transaction, so each
        // row gets its own savepoint.
        let mut savepoint = Connection::begin(&mut *self.tx)
            .await
            .map_err(|err| BatchError::from_sqlx(record, err))?;
        match upsert_inspection(&mut *savepoint, record).await {
            Ok(inserted) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|err| BatchError::from_sqlx(record, err))?;
                Ok(inserted)
            }
            Err(err) => {
                if let Err(rollback_err) = savepoint.rollback().await {
                    debug!(error = %rollback_err, "savepoint rollback failed");
                }
                Err(BatchError::from_sqlx(record, err))
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn upsert_inspection<'e, E>(executor: E, record: &InspectionRecord) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(UPSERT_INSPECTION_SQL)
        .bind(&record.inspection_key)
        .bind(record.businessname.as_deref())
        .bind(record.dbaname.as_deref())
        .bind(record.legalowner.as_deref())
        .bind(record.licenseno.as_deref())
        .bind(record.licstatus.as_deref())
        .bind(record.licensecat.as_deref())
        .bind(record.license_issued_date.as_deref())
        .bind(record.license_expiration_date.as_deref())
        .bind(record.result.as_deref())
        .bind(record.resultdttm.as_deref())
        .bind(record.violation_code.as_deref())
        .bind(record.viol_level.as_deref())
        .bind(record.violdesc.as_deref())
        .bind(record.violdttm.as_deref())
        .bind(record.viol_status.as_deref())
        .bind(record.comments.as_deref())
        .bind(record.address.as_deref())
        .bind(record.city.as_deref())
        .bind(record.state.as_deref())
        .bind(record.zip.as_deref())
        .bind(record.property_id.as_deref())
        .bind(record.latitude())
        .bind(record.longitude())
        .fetch_one(executor)
        .await?;
    row.try_get("inserted")
}

fn sync_run_from_row(row: &PgRow) -> Result<SyncRun, StoreError> {
    let status: Option<String> = row.try_get("status")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: status.as_deref().and_then(SyncStatus::parse),
        records_fetched: row.try_get("records_fetched")?,
        records_inserted: row.try_get("records_inserted")?,
        records_updated: row.try_get("records_updated")?,
        error_message: row.try_get("error_message")?,
    })
}

fn db_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts are final: each attempt already waited the full client timeout.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: Vec<u8> },
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout(err)
        } else {
            HttpError::Request(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` parameters, retrying transient failures per the
    /// backoff policy.
    pub async fn get_with_query(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        self.send_with_retry(url, query).instrument(span).await
    }

    async fn send_with_retry(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::from(err));
                }
            }
        }
    }
}
