// Worker clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Brewtrack Background Worker
//!
//! Drives the billing sweeps by calling the API's internal endpoints:
//! - Grace-period expiry (hourly)
//! - Deferred plan activation (every 15 minutes)
//! - Scheduled downgrades (every 15 minutes)
//! - Abandoned checkout release (every 30 minutes)
//! - Invariant checks (daily at 4:00 AM UTC)

mod client;
mod config;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::client::{log_invariant_summary, log_sweep_summary, Sweep, SweepClient};
use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,brewtrack_worker=debug")),
        )
        .init();

    info!("Starting Brewtrack Worker");

    let config = WorkerConfig::from_env()?;
    info!(config = ?config, "Configuration loaded");

    let client = SweepClient::new(&config)?;
    let mut scheduler = JobScheduler::new().await?;

    for sweep in Sweep::ALL {
        let schedule = config.schedules.for_sweep(sweep);
        let job_client = client.clone();
        scheduler
            .add(Job::new_async(schedule, move |_uuid, _l| {
                let client = job_client.clone();
                Box::pin(async move {
                    info!(sweep = sweep.name(), "Running scheduled sweep");
                    match client.run_sweep(sweep).await {
                        Ok(summary) => log_sweep_summary(&summary),
                        Err(e) => error!(sweep = sweep.name(), error = %e, "Sweep request failed"),
                    }
                })
            })?)
            .await?;
        info!(sweep = sweep.name(), schedule = %schedule, "Scheduled sweep");
    }

    let invariant_client = client.clone();
    scheduler
        .add(Job::new_async(
            config.schedules.invariants.as_str(),
            move |_uuid, _l| {
                let client = invariant_client.clone();
                Box::pin(async move {
                    info!("Running billing invariant checks");
                    match client.check_invariants().await {
                        Ok(summary) => log_invariant_summary(&summary),
                        Err(e) => error!(error = %e, "Invariant check request failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(schedule = %config.schedules.invariants, "Scheduled invariant checks");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!(
        "Brewtrack Worker started with {} scheduled jobs",
        Sweep::ALL.len() + 1
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.shutdown().await?;

    Ok(())
}
