use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use jobsnap_storage::{SnapshotStore, SqliteStore};
use jobsnap_sync::{maybe_build_scheduler, scraper_from_config, AppConfig, ScrapeOptions, Scraper};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobsnap-cli")]
#[command(about = "Scrape construction job metrics into point-in-time snapshots")]
struct Cli {
    /// Config file; defaults to $JOBSNAP_CONFIG, then ./jobsnap.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sign in (interactively if needed) and report where the app landed.
    Login,
    /// Scrape one project and store a snapshot.
    Scrape {
        address: String,
        #[arg(long)]
        inactive: bool,
    },
    /// Scrape several projects over one shared session.
    Batch {
        #[arg(required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        inactive: bool,
    },
    /// Scrape every active project.
    Refresh,
    Projects {
        #[arg(long)]
        active_only: bool,
    },
    AddProject {
        address: String,
        #[arg(long)]
        external_id: Option<i64>,
    },
    SetActive {
        address: String,
        #[arg(action = ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        active: bool,
    },
    Snapshots {
        address: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Run the configured refresh schedule until Ctrl-C.
    Schedule,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

/// Run `work`, aborting any interactive login on Ctrl-C and then letting
/// `work` finish so the browser is released.
async fn with_login_abort<F, T>(scraper: &Scraper, work: F) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => output,
        _ = tokio::signal::ctrl_c() => {
            if scraper.sessions().abort_login() {
                warn!("interrupt received; abandoning login");
            }
            work.await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.unwrap_or_else(AppConfig::path_from_env);
    let config = AppConfig::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;

    match cli.command {
        Commands::Login => {
            let scraper = scraper_from_config(&config).await?;
            let url = with_login_abort(&scraper, scraper.sessions().verify_login()).await?;
            print_json(&json!({ "logged_in": true, "url": url }))?;
        }
        Commands::Scrape { address, inactive } => {
            let scraper = scraper_from_config(&config).await?;
            let options = ScrapeOptions { active: !inactive };
            let outcome = with_login_abort(&scraper, scraper.scrape_one(&address, options)).await?;
            print_json(&outcome)?;
        }
        Commands::Batch { addresses, inactive } => {
            let scraper = scraper_from_config(&config).await?;
            let options = ScrapeOptions { active: !inactive };
            let entries = with_login_abort(&scraper, scraper.scrape_batch(&addresses, options)).await?;
            print_json(&entries)?;
        }
        Commands::Refresh => {
            let scraper = scraper_from_config(&config).await?;
            let run = with_login_abort(&scraper, scraper.refresh_active()).await?;
            print_json(&run)?;
        }
        Commands::Projects { active_only } => {
            let store = open_store(&config).await?;
            print_json(&store.list_projects(active_only).await?)?;
        }
        Commands::AddProject { address, external_id } => {
            let store = open_store(&config).await?;
            print_json(&store.create_project(&address, external_id).await?)?;
        }
        Commands::SetActive { address, active } => {
            let store = open_store(&config).await?;
            let changed = store.set_project_active(&address, active).await?;
            if changed == 0 {
                bail!("no project with address {address:?}");
            }
            print_json(&store.get_project_by_address(&address).await?)?;
        }
        Commands::Snapshots { address, limit } => {
            let store = open_store(&config).await?;
            let project = store
                .get_project_by_address(&address)
                .await?
                .ok_or_else(|| anyhow!("no project with address {address:?}"))?;
            let snapshots = store.list_snapshots(project.id, limit).await?;
            print_json(&json!({ "project": project, "snapshots": snapshots }))?;
        }
        Commands::Schedule => {
            let scraper = Arc::new(scraper_from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(Arc::clone(&scraper), &config.schedule).await? else {
                bail!("schedule.enabled is false in {}", config_path.display());
            };
            sched.start().await.context("starting scheduler")?;
            info!(jobs = config.schedule.crons.len(), "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            scraper.sessions().abort_login();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))
}
