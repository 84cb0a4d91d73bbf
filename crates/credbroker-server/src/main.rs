//! `credbroker` daemon.
//!
//! Loads configuration, opens the database and keyring, builds the credential
//! repository (which registers its maintenance jobs) and runs the job
//! scheduler until interrupted.

mod config;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use credbroker_jobs::Scheduler;
use credbroker_kms::Kms;
use credbroker_store::{Database, Repository};
use tracing::info;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::load()?;
    telemetry::init_tracing(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting credbroker");

    let db = Database::open_and_migrate(config.database.path.clone())
        .await
        .with_context(|| format!("failed to open database {}", config.database.path.display()))?;

    let root = config.kms.root_key_provider()?;
    let kms = Kms::open(&config.kms.database_path, root).with_context(|| {
        format!(
            "failed to open keyring {}",
            config.kms.database_path.display()
        )
    })?;

    let scheduler = Scheduler::new();
    let repo = Repository::new(db, Arc::new(kms), &scheduler, config.repository_config())
        .context("failed to build credential repository")?;
    let worker = scheduler.start();

    info!(
        jobs = scheduler.all_jobs().len(),
        default_limit = repo.config().default_limit,
        "credbroker running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    scheduler.shutdown();
    worker.await.context("scheduler worker failed")?;
    Ok(())
}
