use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use jobsnap_adapters::{
    select_job, AuthenticatedContext, BrowserError, BrowserLauncher, ReportView, SessionError, SessionManager,
    SiteConfig,
};
use jobsnap_core::{BatchEntry, ScrapeOutcome};
use jobsnap_storage::{SnapshotStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::collect_metrics;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("address is required and must be a non-empty string")]
    EmptyAddress,
    #[error("addresses must be a non-empty list")]
    EmptyBatch,
    #[error("job {0:?} not found in the job list")]
    JobNotFound(String),
    #[error("session expired while loading the {view} view")]
    SessionExpired { view: ReportView },
    #[error("scrape panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeOptions {
    pub active: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self { active: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Outcome of one batch: the run summary plus one entry per input address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRun {
    pub summary: ScrapeRunSummary,
    pub entries: Vec<BatchEntry>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drives scrapes against one site with one cached session and one store.
///
/// Runs are serialized: a batch or single scrape holds the run lock for its
/// whole duration, so overlapping callers queue rather than share a page.
pub struct Scraper {
    sessions: SessionManager,
    store: Arc<dyn SnapshotStore>,
    site: Arc<SiteConfig>,
    run_lock: Mutex<()>,
}

impl Scraper {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, site: SiteConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let site = Arc::new(site);
        Self {
            sessions: SessionManager::new(launcher, Arc::clone(&site)),
            store,
            site,
            run_lock: Mutex::new(()),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Scrape and persist a single project in a context of its own.
    pub async fn scrape_one(&self, address: &str, options: ScrapeOptions) -> Result<ScrapeOutcome, ScrapeError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ScrapeError::EmptyAddress);
        }

        let _run = self.run_lock.lock().await;
        info!(%address, "starting scrape");
        let context = self.sessions.open_context().await?;
        let result = self.scrape_in_context(&context, address, options).await;
        if let Err(ScrapeError::SessionExpired { .. }) = &result {
            self.sessions.invalidate(context.session());
        }
        context.close().await;
        result
    }

    /// Scrape every address over one shared context. Item failures are
    /// recorded in their entry; the call itself only fails when the batch
    /// cannot start.
    pub async fn scrape_batch(&self, addresses: &[String], options: ScrapeOptions) -> Result<Vec<BatchEntry>, ScrapeError> {
        Ok(self.run_batch(addresses, options).await?.entries)
    }

    pub async fn run_batch(&self, addresses: &[String], options: ScrapeOptions) -> Result<BatchRun, ScrapeError> {
        if addresses.is_empty() {
            return Err(ScrapeError::EmptyBatch);
        }

        let _run = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_batch", %run_id, requested = addresses.len());
        async move {
            let started_at = Utc::now();
            let context = self.sessions.open_context().await?;

            let mut entries = Vec::with_capacity(addresses.len());
            for raw in addresses {
                entries.push(self.batch_item(&context, raw, options).await);
            }
            context.close().await;

            let succeeded = entries.iter().filter(|entry| entry.ok).count();
            let summary = ScrapeRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                requested: entries.len(),
                succeeded,
                failed: entries.len() - succeeded,
            };
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
                "batch finished"
            );
            Ok::<_, ScrapeError>(BatchRun { summary, entries })
        }
        .instrument(span)
        .await
    }

    /// Batch-scrape every project currently flagged active. With none active
    /// nothing is launched and the run is empty.
    pub async fn refresh_active(&self) -> Result<BatchRun, ScrapeError> {
        let addresses: Vec<String> = self
            .store
            .list_projects(true)
            .await?
            .into_iter()
            .map(|project| project.address)
            .collect();
        if addresses.is_empty() {
            info!("no active projects to refresh");
            let now = Utc::now();
            return Ok(BatchRun {
                summary: ScrapeRunSummary {
                    run_id: Uuid::new_v4(),
                    started_at: now,
                    finished_at: now,
                    requested: 0,
                    succeeded: 0,
                    failed: 0,
                },
                entries: Vec::new(),
            });
        }
        info!(projects = addresses.len(), "refreshing active projects");
        self.run_batch(&addresses, ScrapeOptions { active: true }).await
    }

    async fn batch_item(&self, context: &AuthenticatedContext, raw: &str, options: ScrapeOptions) -> BatchEntry {
        let address = raw.trim();
        if address.is_empty() {
            warn!("skipping empty address in batch");
            return BatchEntry::failed(raw, ScrapeError::EmptyAddress.to_string());
        }

        info!(%address, "starting batch item");
        let attempt = AssertUnwindSafe(self.scrape_in_context(context, address, options))
            .catch_unwind()
            .await;
        match attempt {
            Ok(Ok(outcome)) => BatchEntry::succeeded(raw, outcome),
            Ok(Err(err)) => {
                if let ScrapeError::SessionExpired { .. } = err {
                    self.sessions.invalidate(context.session());
                }
                warn!(%address, error = %err, "batch item failed");
                BatchEntry::failed(raw, err.to_string())
            }
            Err(payload) => {
                let err = ScrapeError::Panicked(panic_message(payload.as_ref()));
                warn!(%address, error = %err, "batch item panicked");
                BatchEntry::failed(raw, err.to_string())
            }
        }
    }

    async fn scrape_in_context(
        &self,
        context: &AuthenticatedContext,
        address: &str,
        options: ScrapeOptions,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let project = self.store.upsert_project(address, options.active, None).await?;
        debug!(%address, project_id = project.id, "upserted project");

        if !select_job(context.page(), &self.site, address).await {
            return Err(ScrapeError::JobNotFound(address.to_string()));
        }

        let metrics = collect_metrics(context.page(), &self.site).await?;
        let snapshot = self.store.append_snapshot(project.id, &metrics).await?;
        info!(%address, project_id = project.id, snapshot_id = snapshot.id, "created snapshot");

        Ok(ScrapeOutcome {
            project,
            snapshot,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use jobsnap_adapters::testing::{JobFixture, ScriptedSite};
    use jobsnap_storage::SqliteStore;

    use super::*;

    async fn scraper(site: &ScriptedSite) -> Scraper {
        let store = SqliteStore::open_in_memory().await.unwrap();
        Scraper::new(site.launcher(), ScriptedSite::site_config(), Arc::new(store))
    }

    fn full_job() -> JobFixture {
        JobFixture::new()
            .estimate(Some("$10,000.00"), Some("$12,500.00"))
            .job_cost(true, &["", "", "", "", "$8,000.00", "$8,250.00"])
            .invoices(Some("$1,000.00"), Some("$400.00"))
            .change_orders(Some("$500.00"), Some("($50.00)"))
    }

    #[tokio::test]
    async fn scrape_one_persists_every_view() {
        let site = ScriptedSite::new().with_job("12 Elm St", full_job());
        let scraper = scraper(&site).await;

        let outcome = scraper
            .scrape_one(" 12 Elm St ", ScrapeOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.project.address, "12 Elm St");
        assert!(outcome.project.active);
        assert_eq!(outcome.metrics.estimate_builder_cost, Some(10_000.00));
        assert_eq!(outcome.metrics.estimate_client_price, Some(12_500.00));
        assert_eq!(outcome.metrics.job_cost, Some(8_250.00));
        assert_eq!(outcome.metrics.invoice_due, Some(600.00));
        assert_eq!(outcome.metrics.change_order_client_price, Some(-50.00));
        assert_eq!(outcome.snapshot.metrics, outcome.metrics);

        let latest = scraper
            .store()
            .get_latest_snapshot(outcome.project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, outcome.snapshot.id);
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn scrape_one_rejects_blank_address_before_touching_the_browser() {
        let site = ScriptedSite::new();
        let scraper = scraper(&site).await;

        let err = scraper.scrape_one("   ", ScrapeOptions::default()).await.unwrap_err();
        assert!(matches!(err, ScrapeError::EmptyAddress));
        assert_eq!(site.launch_count(), 0);
    }

    #[tokio::test]
    async fn scrape_one_reports_unknown_job_but_keeps_the_project_row() {
        let site = ScriptedSite::new();
        let scraper = scraper(&site).await;

        let err = scraper
            .scrape_one("99 Nowhere Rd", ScrapeOptions { active: false })
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::JobNotFound(_)));

        let project = scraper
            .store()
            .get_project_by_address("99 Nowhere Rd")
            .await
            .unwrap()
            .unwrap();
        assert!(!project.active);
        assert!(scraper.store().get_latest_snapshot(project.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_job_still_produces_a_snapshot() {
        let site = ScriptedSite::new().with_job("12 Elm St", JobFixture::new());
        let scraper = scraper(&site).await;

        let outcome = scraper.scrape_one("12 Elm St", ScrapeOptions::default()).await.unwrap();
        assert!(outcome.metrics.is_empty());
        assert!(outcome.snapshot.id > 0);
    }

    #[tokio::test]
    async fn batch_rejects_an_empty_list() {
        let site = ScriptedSite::new();
        let scraper = scraper(&site).await;

        let err = scraper.scrape_batch(&[], ScrapeOptions::default()).await.unwrap_err();
        assert!(matches!(err, ScrapeError::EmptyBatch));
        assert_eq!(site.launch_count(), 0);
    }

    #[tokio::test]
    async fn batch_records_blank_entries_and_reuses_one_context() {
        let site = ScriptedSite::new()
            .with_job("12 Elm St", full_job())
            .with_job("40 Oak Ave", full_job());
        let scraper = scraper(&site).await;
        let addresses = vec!["12 Elm St".to_string(), "  ".to_string(), " 40 Oak Ave ".to_string()];

        let run = scraper.run_batch(&addresses, ScrapeOptions::default()).await.unwrap();

        let oks: Vec<bool> = run.entries.iter().map(|entry| entry.ok).collect();
        assert_eq!(oks, vec![true, false, true]);
        // Entries echo the input verbatim; the stored project uses the trimmed address.
        let echoed: Vec<&str> = run.entries.iter().map(|entry| entry.address.as_str()).collect();
        assert_eq!(echoed, addresses.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(run.entries[2].result.as_ref().unwrap().project.address, "40 Oak Ave");
        assert_eq!(run.summary.requested, 3);
        assert_eq!(run.summary.succeeded, 2);
        assert_eq!(run.summary.failed, 1);
        // One visible login browser plus one shared scraping context.
        assert_eq!(site.launch_count(), 2);
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn report_redirect_to_login_is_a_session_expiry() {
        let site = ScriptedSite::new().with_job("12 Elm St", full_job());
        let scraper = scraper(&site).await;

        // Expire between context creation and the report views.
        let context = scraper.sessions().open_context().await.unwrap();
        site.expire_sessions();
        let err = scraper
            .scrape_in_context(&context, "12 Elm St", ScrapeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::SessionExpired { view: ReportView::Estimate }));
        context.close().await;

        // The next run notices the stale session on landing and signs in again.
        scraper.scrape_one("12 Elm St", ScrapeOptions::default()).await.unwrap();
        assert_eq!(scraper.sessions().login_count(), 2);
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn refresh_only_visits_active_projects() {
        let site = ScriptedSite::new()
            .with_job("12 Elm St", full_job())
            .with_job("40 Oak Ave", full_job());
        let scraper = scraper(&site).await;
        scraper.store().upsert_project("12 Elm St", true, None).await.unwrap();
        scraper.store().upsert_project("40 Oak Ave", false, None).await.unwrap();

        let run = scraper.refresh_active().await.unwrap();
        assert_eq!(run.entries.len(), 1);
        assert_eq!(run.entries[0].address, "12 Elm St");
        assert!(run.entries[0].ok);
    }

    #[tokio::test]
    async fn refresh_with_no_active_projects_launches_nothing() {
        let site = ScriptedSite::new();
        let scraper = scraper(&site).await;
        scraper.store().upsert_project("40 Oak Ave", false, None).await.unwrap();

        let run = scraper.refresh_active().await.unwrap();
        assert!(run.entries.is_empty());
        assert_eq!(run.summary.requested, 0);
        assert_eq!(site.launch_count(), 0);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
