//! Sync run orchestration: fetch the inspection window, upsert every record,
//! and keep the provenance log in step with the outcome.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bfi_adapters::{
    fetch_all, CkanDatastore, FetchError, FetchWindow, PageSource, PagingPolicy, DEFAULT_CKAN_SQL_API_URL,
    DEFAULT_RESOURCE_ID,
};
use bfi_core::{InspectionRecord, SyncCounts, SyncOutcome, SyncStatus, SYNC_SOURCE};
use bfi_storage::{BatchError, HttpClientConfig, HttpFetcher, InspectionStore, PgStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bfi-sync";

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub days_back: u32,
    pub page_size: usize,
    pub page_delay: Duration,
    pub api_url: String,
    pub resource_id: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/boston_inspections".to_string()),
            days_back: env_parse("SYNC_DAYS_BACK", 90),
            page_size: env_parse("SYNC_PAGE_SIZE", 10_000),
            page_delay: Duration::from_millis(env_parse("SYNC_PAGE_DELAY_MS", 1_000)),
            api_url: std::env::var("CKAN_SQL_API_URL")
                .unwrap_or_else(|_| DEFAULT_CKAN_SQL_API_URL.to_string()),
            resource_id: std::env::var("CKAN_RESOURCE_ID")
                .unwrap_or_else(|_| DEFAULT_RESOURCE_ID.to_string()),
            http_timeout_secs: env_parse("BFI_HTTP_TIMEOUT_SECS", 120),
            user_agent: std::env::var("BFI_USER_AGENT")
                .unwrap_or_else(|_| "bfi-sync/0.1".to_string()),
            scheduler_enabled: std::env::var("BFI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn with_days_back(mut self, days_back: Option<u32>) -> Self {
        if let Some(days) = days_back {
            self.days_back = days;
        }
        self
    }

    pub fn paging(&self) -> PagingPolicy {
        PagingPolicy {
            page_size: self.page_size,
            page_delay: self.page_delay,
        }
    }
}

/// Load `.env` from the working directory when one exists, returning its
/// path. Runs before logging is configured so `RUST_LOG` can live there too.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenv::dotenv().ok()
}

/// Parse an environment variable, falling back to `default` when it is unset
/// or unparseable.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable environment value");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: i32,
    pub status: SyncStatus,
    pub days_back: u32,
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct SyncPipeline<S, P> {
    store: S,
    source: P,
    days_back: u32,
    paging: PagingPolicy,
}

impl<S, P> SyncPipeline<S, P>
where
    S: InspectionStore,
    P: PageSource,
{
    pub fn new(store: S, source: P, days_back: u32, paging: PagingPolicy) -> Self {
        Self {
            store,
            source,
            days_back,
            paging,
        }
    }

    /// Run one full sync. Per-record failures are logged and skipped; a
    /// fetch or store failure marks the run as `error` and is returned.
    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        self.store.ensure_schema().await?;
        let run_id = self.store.open_sync_run(SYNC_SOURCE).await?;
        let span = info_span!("sync_run", run_id, days_back = self.days_back);
        self.finish_run(run_id, started_at).instrument(span).await
    }

    async fn finish_run(&self, run_id: i32, started_at: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        info!("sync run started");
        match self.process().await {
            Ok((counts, skipped)) => {
                self.store
                    .finish_sync_run(run_id, &SyncOutcome::success(counts))
                    .await?;
                info!(
                    fetched = counts.fetched,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    skipped,
                    "sync run succeeded"
                );
                Ok(SyncReport {
                    run_id,
                    status: SyncStatus::Success,
                    days_back: self.days_back,
                    counts,
                    skipped,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err((counts, err)) => {
                error!(error = %err, "sync run failed");
                let outcome = SyncOutcome::failed(counts, err.to_string());
                if let Err(log_err) = self.store.finish_sync_run(run_id, &outcome).await {
                    error!(error = %log_err, "could not record sync failure");
                }
                Err(err)
            }
        }
    }

    /// Fetch everything, then write it in one transaction. The error side
    /// carries the counts reached before the failure.
    async fn process(&self) -> Result<(SyncCounts, usize), (SyncCounts, SyncError)> {
        let mut counts = SyncCounts::default();
        let window = FetchWindow::trailing_days_from_today(self.days_back);

        let records = fetch_all(&self.source, &window, &self.paging)
            .await
            .map_err(|err| (counts, SyncError::from(err)))?;
        counts.fetched = records.len();
        info!(fetched = counts.fetched, cutoff = %window.cutoff, "fetch complete");

        let mut batch = self
            .store
            .begin_batch()
            .await
            .map_err(|err| (counts, SyncError::from(err)))?;

        let mut skipped = 0usize;
        for (index, raw) in records.iter().enumerate() {
            let record = InspectionRecord::from_raw(raw);
            match batch.upsert(&record).await {
                Ok(true) => counts.inserted += 1,
                Ok(false) => counts.updated += 1,
                Err(BatchError::Record(err)) => {
                    skipped += 1;
                    warn!(business = %err.business, error = %err, "skipping inspection record");
                }
                // Dropping the batch rolls back whatever it had written.
                Err(BatchError::Store(err)) => return Err((counts, SyncError::Store(err))),
            }

            let processed = index + 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(processed, total = records.len(), "upsert progress");
            }
        }

        batch
            .commit()
            .await
            .map_err(|err| (counts, SyncError::from(err)))?;
        Ok((counts, skipped))
    }
}

/// Build the production pipeline from `config` and run it once.
pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncReport> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let source = CkanDatastore::new(http, config.api_url.clone(), config.resource_id.clone());
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to inspections database")?;
    let pipeline = SyncPipeline::new(store, source, config.days_back, config.paging());
    Ok(pipeline.run_once().await?)
}

pub async fn run_sync_once_from_env(days_back: Option<u32>) -> Result<SyncReport> {
    let config = SyncConfig::from_env().with_days_back(days_back);
    run_sync_once(&config).await
}

/// Cron scheduler running the sync in-process, or `None` when disabled.
/// Overlapping triggers are skipped while a run is in progress.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));
    let job_config = config.clone();
    let job = Job::new_async(&config.sync_cron, move |_uuid, _l| {
        let config = job_config.clone();
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_running) = in_flight.try_lock() else {
                warn!("previous scheduled sync still running; skipping trigger");
                return;
            };
            match run_sync_once(&config).await {
                Ok(report) => info!(run_id = report.run_id, "scheduled sync finished"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %config.sync_cron, "scheduled sync enabled");
    Ok(Some(sched))
}
