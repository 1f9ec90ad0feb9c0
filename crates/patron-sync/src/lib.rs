//! Synchronization engine: pagination loop, single-flight guard, scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patron_client::{AfdianClient, ApiError, ClientConfig};
use patron_core::{reconcile, SponsorPage};
use patron_storage::SponsorStore;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "patron-sync";

/// Upstream page size for the sponsor listing.
pub const SPONSOR_PAGE_SIZE: u32 = 100;
/// Pause between successive page fetches, to avoid hammering the upstream.
pub const PAGE_DELAY: Duration = Duration::from_millis(500);

/// Service configuration read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub user_id: String,
    pub token: String,
    pub base_url: String,
    pub database_url: String,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    /// Read configuration from the environment. The upstream credentials
    /// have no sensible default and are required.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            user_id: std::env::var("AFDIAN_USER_ID").context("AFDIAN_USER_ID is required")?,
            token: std::env::var("AFDIAN_API_TOKEN").context("AFDIAN_API_TOKEN is required")?,
            base_url: std::env::var("AFDIAN_API_BASE_URL")
                .unwrap_or_else(|_| patron_client::DEFAULT_BASE_URL.to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://patron.db".to_string()),
            sync_cron: std::env::var("SYNC_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        })
    }

    pub fn client(&self) -> Result<AfdianClient, ApiError> {
        AfdianClient::new(ClientConfig {
            base_url: self.base_url.clone(),
            user_id: self.user_id.clone(),
            token: self.token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        })
    }
}

/// Paginated listing seam between the orchestrator and the HTTP client.
#[async_trait]
pub trait SponsorApi: Send + Sync {
    async fn query_sponsor(&self, page: u32, per_page: u32) -> Result<SponsorPage, ApiError>;
}

#[async_trait]
impl SponsorApi for AfdianClient {
    async fn query_sponsor(&self, page: u32, per_page: u32) -> Result<SponsorPage, ApiError> {
        AfdianClient::query_sponsor(self, page, per_page).await
    }
}

/// What one synchronization run did.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub synced: usize,
    pub skipped: usize,
    /// False when a page-level fetch error aborted the loop early.
    pub completed: bool,
}

impl SyncRunSummary {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Owns the pagination loop and the process-local single-flight guard.
pub struct SyncOrchestrator {
    api: Arc<dyn SponsorApi>,
    store: SponsorStore,
    per_page: u32,
    page_delay: Duration,
    in_flight: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(api: Arc<dyn SponsorApi>, store: SponsorStore) -> Self {
        Self {
            api,
            store,
            per_page: SPONSOR_PAGE_SIZE,
            page_delay: PAGE_DELAY,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Override page size and inter-page delay, mainly for tests.
    pub fn with_pacing(mut self, per_page: u32, page_delay: Duration) -> Self {
        self.per_page = per_page;
        self.page_delay = page_delay;
        self
    }

    /// Run one full synchronization. Returns `None` when a run is already in
    /// flight; the rejected invocation is dropped, not queued.
    pub async fn run(&self) -> Option<SyncRunSummary> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("previous sync still in progress, skipping this run");
            return None;
        }
        let _guard = FlightGuard(&self.in_flight);

        let started_at = Utc::now();
        info!("sponsor sync started");
        let (pages_fetched, synced, skipped, completed) = self.sync_pages().await;

        // The watermark marks when the most recent attempt finished, aborted
        // runs included. Nothing resumes pagination from it.
        if let Err(err) = self.store.set_last_sync_time(Utc::now().timestamp()).await {
            error!(%err, "failed to update the sync watermark");
        }

        let summary = SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            synced,
            skipped,
            completed,
        };
        info!(
            synced = summary.synced,
            skipped = summary.skipped,
            pages = summary.pages_fetched,
            completed = summary.completed,
            elapsed_ms = summary.elapsed().num_milliseconds(),
            "sponsor sync finished"
        );
        Some(summary)
    }

    async fn sync_pages(&self) -> (u32, usize, usize, bool) {
        let mut page = 1u32;
        let mut pages_fetched = 0u32;
        let mut synced = 0usize;
        let mut skipped = 0usize;

        loop {
            let data = match self.api.query_sponsor(page, self.per_page).await {
                Ok(data) => data,
                Err(err) => {
                    // No retry here: an unreliable upstream is picked up
                    // again on the next scheduled run.
                    warn!(page, %err, "page fetch failed, aborting this run");
                    return (pages_fetched, synced, skipped, false);
                }
            };
            pages_fetched += 1;

            if data.list.is_empty() {
                break;
            }

            let mut page_synced = 0usize;
            for raw in &data.list {
                match reconcile(raw) {
                    Ok(record) => match self.store.upsert(&record).await {
                        Ok(()) => page_synced += 1,
                        Err(err) => {
                            error!(user_id = %record.user_id, %err, "failed to persist sponsor");
                            skipped += 1;
                        }
                    },
                    Err(rejection) => {
                        warn!(%rejection, "skipping raw sponsor");
                        skipped += 1;
                    }
                }
            }
            synced += page_synced;
            info!(page, page_synced, page_total = data.list.len(), "page processed");

            // A short page ends the run even when total_page disagrees.
            if data.list.len() < self.per_page as usize || page >= data.total_page {
                break;
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }

        (pages_fetched, synced, skipped, true)
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Register the recurring sync job and fire one eager run at startup.
pub async fn start_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
    cron: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;

    let job_orchestrator = orchestrator.clone();
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let orchestrator = job_orchestrator.clone();
        Box::pin(async move {
            orchestrator.run().await;
        })
    })
    .with_context(|| format!("creating sync job for cron {cron}"))?;
    scheduler.add(job).await.context("adding sync job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(cron, "sync schedule started");

    tokio::spawn(async move {
        orchestrator.run().await;
    });

    Ok(scheduler)
}
