use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use super::{CronSchedule, JobCallback, JobKey, Scheduler, SchedulerError, Trigger};

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn backend(e: JobSchedulerError) -> SchedulerError {
    SchedulerError::Backend(e.to_string())
}

/// [`Scheduler`] backed by `tokio-cron-scheduler`, firing cron jobs in local time.
pub struct CronScheduler {
    inner: JobScheduler,
    jobs: tokio::sync::Mutex<HashMap<JobKey, Uuid>>,
}

impl CronScheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        Ok(Self {
            inner: JobScheduler::new().await.map_err(backend)?,
            jobs: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Starts firing jobs. Jobs upserted before or after start both run.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner.start().await.map_err(backend)
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.clone();
        inner.shutdown().await.map_err(backend)
    }
}

fn runner(
    key: &JobKey,
    callback: JobCallback,
) -> impl FnMut(Uuid, JobScheduler) -> JobFuture + Send + Sync + 'static {
    let label = key.to_string();
    move |_id: Uuid, _scheduler: JobScheduler| -> JobFuture {
        let label = label.clone();
        let work = callback();
        Box::pin(async move {
            tracing::debug!(job = %label, "Job triggered");
            work.await;
        })
    }
}

fn build_job(key: &JobKey, trigger: Trigger, callback: JobCallback) -> Result<Job, SchedulerError> {
    let run = runner(key, callback);
    match trigger {
        Trigger::Cron(expr) => {
            let schedule = CronSchedule::parse(&expr)?;
            Job::new_async_tz(schedule.to_six_field().as_str(), chrono::Local, run).map_err(backend)
        }
        Trigger::Interval(every) => Job::new_repeated_async(every, run).map_err(backend),
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    async fn upsert(
        &self,
        key: JobKey,
        trigger: Trigger,
        callback: JobCallback,
    ) -> Result<(), SchedulerError> {
        // Build first: an invalid trigger must leave the existing job in place
        let job = build_job(&key, trigger, callback)?;

        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(&key) {
            if let Err(e) = self.inner.remove(&old).await {
                tracing::warn!(job = %key, error = %e, "Failed to remove replaced job");
            }
        }
        let id = self.inner.add(job).await.map_err(backend)?;
        tracing::debug!(job = %key, id = %id, "Job scheduled");
        jobs.insert(key, id);
        Ok(())
    }

    async fn remove(&self, key: &JobKey) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(id) = jobs.remove(key) {
            self.inner.remove(&id).await.map_err(backend)?;
        }
        Ok(())
    }

    async fn job_keys(&self) -> Vec<JobKey> {
        self.jobs.lock().await.keys().cloned().collect()
    }
}
