use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio_cron_scheduler::{Job, JobScheduler};

pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named group of cron specs that all run the same callback.
pub struct CronJobs {
    pub label: &'static str,
    pub specs: Vec<String>,
    pub callback: JobCallback,
}

pub async fn configure_jobs(groups: Vec<CronJobs>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    for group in groups {
        for spec in &group.specs {
            let cron_label = spec.clone();
            let job_label = group.label;
            let cb = group.callback.clone();
            let job = Job::new_async(spec.as_str(), move |_id, _l| {
                let cb = cb.clone();
                let cron_label = cron_label.clone();
                Box::pin(async move {
                    tracing::debug!(target: "scheduler", job = job_label, cron = %cron_label, "job triggered");
                    cb().await;
                })
            })?;
            scheduler.add(job).await?;
            tracing::info!(target: "scheduler", job = group.label, cron = %spec, "job registered");
        }
    }
    scheduler.start().await?;
    Ok(scheduler)
}
