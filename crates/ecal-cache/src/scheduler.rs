//! Caller-side maintenance schedule. The service never schedules itself.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{CacheConfig, CacheService};

/// `None` unless `ECAL_SCHEDULER_ENABLED` is set. The returned scheduler is
/// not started; the caller owns its lifecycle.
pub async fn maybe_build_sweep_scheduler(
    config: &CacheConfig,
    service: Arc<CacheService>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sweep_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            match service.sweep_expired(Utc::now()).await {
                Ok(report) => info!(
                    earnings_removed = report.earnings_removed,
                    analysts_removed = report.analysts_removed,
                    "scheduled sweep finished"
                ),
                Err(err) => warn!(error = %err, "scheduled sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {cron}"))?;
    sched.add(job).await.context("adding sweep job")?;
    info!(cron, "sweep scheduler prepared");
    Ok(Some(sched))
}
