//! Scrape orchestration: config loading, the per-project snapshot pipeline,
//! batch runs over one shared session, and the cron refresh scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobsnap_adapters::ChromiumLauncher;
use jobsnap_storage::SqliteStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod config;
pub mod pipeline;
pub mod scraper;

pub use config::{AppConfig, ConfigError, ScheduleConfig};
pub use pipeline::collect_metrics;
pub use scraper::{BatchRun, ScrapeError, ScrapeOptions, ScrapeRunSummary, Scraper};

pub const CRATE_NAME: &str = "jobsnap-sync";

/// Open the SQLite store and a Chromium-backed scraper for `config`.
pub async fn scraper_from_config(config: &AppConfig) -> Result<Scraper> {
    let store = SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let launcher = ChromiumLauncher::new().with_request_timeout(config.site.browser.navigation_timeout());
    Ok(Scraper::new(Arc::new(launcher), config.site.clone(), Arc::new(store)))
}

/// Build a scheduler that runs `refresh_active` on every configured cron, or
/// `None` when scheduling is disabled. The caller starts it.
pub async fn maybe_build_scheduler(scraper: Arc<Scraper>, schedule: &ScheduleConfig) -> Result<Option<JobScheduler>> {
    if !schedule.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in schedule.crons.iter().filter(|cron| !cron.trim().is_empty()) {
        let scraper = Arc::clone(&scraper);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let scraper = Arc::clone(&scraper);
            Box::pin(async move {
                match scraper.refresh_active().await {
                    Ok(run) => info!(
                        run_id = %run.summary.run_id,
                        succeeded = run.summary.succeeded,
                        failed = run.summary.failed,
                        "scheduled refresh finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled active-project refresh");
    }
    Ok(Some(sched))
}
