//! Keeps the live scheduled-job set in line with the subscription table.
//!
//! Every (source, subscriber) pair owns one job keyed by [`JobKey`]; fixed
//! maintenance jobs have their own variants. [`SchedulerSync::reconcile`]
//! upserts every wanted job and removes every live job nobody wants anymore.

mod cron;
mod cron_backend;

pub use cron::{CronError, CronSchedule};
pub use cron_backend::CronScheduler;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Identity of a scheduled job.
///
/// Source and subscriber stay separate fields, so a `|` inside either one
/// cannot make two different pairs collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKey {
    Subscription { source: String, subscriber: String },
    MediaCleanup,
}

impl JobKey {
    pub fn subscription(source: impl Into<String>, subscriber: impl Into<String>) -> Self {
        JobKey::Subscription {
            source: source.into(),
            subscriber: subscriber.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Subscription { source, subscriber } => write!(f, "{}|{}", source, subscriber),
            JobKey::MediaCleanup => f.write_str("media_cleanup"),
        }
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Five-field cron expression, validated by the backend on upsert.
    Cron(String),
    Interval(Duration),
}

/// Work run on every trigger. Cheap to clone; each call yields a fresh future.
pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("Scheduler backend error: {0}")]
    Backend(String),
}

/// A job scheduler addressed by [`JobKey`].
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Installs the job for `key`, replacing any existing one with that key.
    async fn upsert(
        &self,
        key: JobKey,
        trigger: Trigger,
        callback: JobCallback,
    ) -> Result<(), SchedulerError>;

    /// Removes the job for `key`. Unknown keys are not an error.
    async fn remove(&self, key: &JobKey) -> Result<(), SchedulerError>;

    /// Keys of every live job.
    async fn job_keys(&self) -> Vec<JobKey>;
}

/// One job the configuration wants to exist.
pub struct JobPlan {
    pub key: JobKey,
    pub trigger: Trigger,
    pub callback: JobCallback,
}

impl fmt::Debug for JobPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPlan")
            .field("key", &self.key)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Reconciles a [`Scheduler`] against a desired job set.
pub struct SchedulerSync {
    scheduler: Arc<dyn Scheduler>,
    // Serializes passes so two concurrent reconciles cannot interleave upserts and removals
    pass: tokio::sync::Mutex<()>,
}

impl SchedulerSync {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            pass: tokio::sync::Mutex::new(()),
        }
    }

    /// Makes the live job set equal to `plans`.
    ///
    /// Each plan is upserted; afterwards every live job whose key is not among
    /// the plans is removed. A failing upsert or removal is logged and counted
    /// but never stops the pass. A plan whose upsert fails still counts as
    /// wanted, so an older job under that key is left running.
    pub async fn reconcile<I>(&self, plans: I) -> ReconcileReport
    where
        I: IntoIterator<Item = JobPlan>,
    {
        let _pass = self.pass.lock().await;
        let mut report = ReconcileReport::default();
        let mut wanted = HashSet::new();

        for plan in plans {
            wanted.insert(plan.key.clone());
            let key = plan.key.clone();
            match self.scheduler.upsert(plan.key, plan.trigger, plan.callback).await {
                Ok(()) => report.upserted += 1,
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "Failed to schedule job");
                    report.failed += 1;
                }
            }
        }

        for key in self.scheduler.job_keys().await {
            if wanted.contains(&key) {
                continue;
            }
            match self.scheduler.remove(&key).await {
                Ok(()) => {
                    tracing::info!(job = %key, "Removed stale job");
                    report.removed += 1;
                }
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "Failed to remove stale job");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            upserted = report.upserted,
            removed = report.removed,
            failed = report.failed,
            "Scheduler reconciled"
        );
        report
    }
}
