//! # Reconciliation Sweeper
//!
//! Background task that runs [`Orchestrator::sweep`] on a fixed interval so
//! that every reservation converges even when its callback never arrives.

use crate::orchestrator::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Spawn the periodic sweep. Abort the handle to stop it.
pub fn spawn_sweeper(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reconciliation sweep every {}s", every.as_secs());
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match orchestrator.sweep().await {
                Ok(report) if report.is_empty() => debug!("Sweep: nothing to reconcile"),
                Ok(report) => info!(
                    "Sweep: examined={}, confirmed={}, expired={}, already_settled={}, released={}, errors={}",
                    report.examined,
                    report.confirmed,
                    report.expired,
                    report.already_settled,
                    report.released,
                    report.errors
                ),
                Err(e) => error!("Sweep failed: {}", e),
            }
        }
    })
}
