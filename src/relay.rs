//! The coordinating service.
//!
//! One [`Relay`] owns the subscription store, the feed cache, the media
//! cache and the delivery transport. Every (source, subscriber) pair gets a
//! scheduled job that runs [`Relay::poll`]: read the entries (cached per
//! source), select what the subscriber has not seen, deliver it, and only
//! then advance and persist the watermark.

use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::Instrument;

use crate::config::Config;
use crate::deliver::{send_with_rotation, Delivery, DeliveryError, MessagePart, Renderer};
use crate::feed::{
    parse_channel_info, parse_entries, select_new, FeedCache, FeedEntry, FeedFetcher, FetchError,
    Limit, ParseError, ParseOptions, SourceContext, Watermark,
};
use crate::media::MediaCache;
use crate::scheduler::{
    CronError, CronSchedule, JobCallback, JobKey, JobPlan, ReconcileReport, Scheduler, SchedulerSync,
    Trigger,
};
use crate::storage::{SourceInfo, Store, StoreError, SubscriberState};

/// Fallback period for media cleanup when its cron expression is invalid.
const CLEANUP_FALLBACK_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid cron expression: {0}")]
    Cron(#[from] CronError),

    #[error("Could not fetch feed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Could not read channel info: {0}")]
    Parse(#[from] ParseError),

    #[error("Feed has no entries: {0}")]
    NoEntries(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub selected: usize,
    pub delivered: usize,
}

pub struct Relay {
    store: Mutex<Store>,
    fetcher: Arc<dyn FeedFetcher>,
    feeds: FeedCache,
    media: Arc<MediaCache>,
    renderer: Renderer,
    delivery: Arc<dyn Delivery>,
    scheduler: SchedulerSync,
    parse_options: ParseOptions,
    limit: Limit,
    compose: bool,
    cleanup_cron: String,
    media_retention: Duration,
    // One poll per subscription at a time
    running: std::sync::Mutex<HashMap<JobKey, Arc<Mutex<()>>>>,
}

impl Relay {
    pub fn new(
        config: &Config,
        store: Store,
        fetcher: Arc<dyn FeedFetcher>,
        media: Arc<MediaCache>,
        delivery: Arc<dyn Delivery>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            feeds: FeedCache::new(Arc::clone(&fetcher), config.cache_ttl(), config.parse_options()),
            fetcher,
            renderer: Renderer::new(config.render_options(), Arc::clone(&media)),
            media,
            delivery,
            scheduler: SchedulerSync::new(scheduler),
            parse_options: config.parse_options(),
            limit: config.poll_limit(),
            compose: config.compose,
            cleanup_cron: config.media.cleanup_cron.clone(),
            media_retention: config.media_retention(),
            running: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Locks the subscription store.
    pub async fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().await
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Jobs the current store wants: one poll job per subscription plus media cleanup.
    pub async fn job_plans(self: &Arc<Self>) -> Vec<JobPlan> {
        let subscriptions = self.store.lock().await.subscriptions();
        let mut plans: Vec<JobPlan> = subscriptions
            .into_iter()
            .map(|sub| JobPlan {
                key: JobKey::subscription(&sub.source, &sub.subscriber),
                trigger: Trigger::Cron(sub.state.cron_expr),
                callback: self.poll_callback(sub.source, sub.subscriber),
            })
            .collect();
        plans.push(self.cleanup_plan());
        plans
    }

    /// Brings the scheduler in line with the store.
    ///
    /// Cached feeds and poll guards of subscriptions no longer in the store
    /// are dropped along the way.
    pub async fn reconcile(self: &Arc<Self>) -> ReconcileReport {
        let plans = self.job_plans().await;
        self.forget_unplanned(&plans);
        self.scheduler.reconcile(plans).await
    }

    fn forget_unplanned(&self, plans: &[JobPlan]) {
        let keys: HashSet<&JobKey> = plans.iter().map(|plan| &plan.key).collect();
        let sources: HashSet<&str> = keys
            .iter()
            .filter_map(|key| match key {
                JobKey::Subscription { source, .. } => Some(source.as_str()),
                JobKey::MediaCleanup => None,
            })
            .collect();
        self.feeds.retain(|source| sources.contains(source));
        self.running_table().retain(|key, _| keys.contains(key));
    }

    fn running_table(&self) -> std::sync::MutexGuard<'_, HashMap<JobKey, Arc<Mutex<()>>>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn poll_guard(&self, source: &str, subscriber: &str) -> Arc<Mutex<()>> {
        let mut running = self.running_table();
        Arc::clone(running.entry(JobKey::subscription(source, subscriber)).or_default())
    }

    /// Re-reads the store from disk and reconciles.
    pub async fn reload(self: &Arc<Self>) -> Result<ReconcileReport, RelayError> {
        self.store.lock().await.reload()?;
        tracing::info!("Subscription store reloaded");
        Ok(self.reconcile().await)
    }

    fn poll_callback(self: &Arc<Self>, source: String, subscriber: String) -> JobCallback {
        // Jobs live inside the scheduler the relay owns; a strong reference would be a cycle
        let relay: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            let relay = relay.clone();
            let source = source.clone();
            let subscriber = subscriber.clone();
            let span = tracing::info_span!("poll", job = %JobKey::subscription(&source, &subscriber));
            async move {
                let Some(relay) = relay.upgrade() else {
                    return;
                };
                if let Err(e) = relay.poll(&source, &subscriber).await {
                    tracing::error!(error = %e, "Poll cycle failed");
                }
            }
            .instrument(span)
            .boxed()
        })
    }

    fn cleanup_plan(self: &Arc<Self>) -> JobPlan {
        let trigger = match CronSchedule::parse(&self.cleanup_cron) {
            Ok(_) => Trigger::Cron(self.cleanup_cron.clone()),
            Err(e) => {
                tracing::error!(
                    cron = %self.cleanup_cron,
                    error = %e,
                    "Invalid media cleanup schedule, falling back to every 30 minutes"
                );
                Trigger::Interval(CLEANUP_FALLBACK_INTERVAL)
            }
        };

        let media = Arc::clone(&self.media);
        let retention = self.media_retention;
        JobPlan {
            key: JobKey::MediaCleanup,
            trigger,
            callback: Arc::new(move || {
                let media = Arc::clone(&media);
                async move {
                    let removed = media.cleanup(retention).await;
                    tracing::info!(removed, retention_secs = retention.as_secs(), "Media cache cleaned");
                }
                .boxed()
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Poll cycle
    // ------------------------------------------------------------------------

    /// Runs one delivery cycle for a subscription.
    ///
    /// A subscription removed since its job was scheduled is a no-op. The
    /// watermark moves only over entries whose delivery succeeded. Cycles of
    /// the same subscription never overlap: a trigger that fires while the
    /// previous cycle is still delivering waits for it, then starts from the
    /// watermark it left.
    pub async fn poll(&self, source: &str, subscriber: &str) -> Result<PollReport, RelayError> {
        let guard = self.poll_guard(source, subscriber);
        let _running = guard.lock().await;

        let (watermark, context) = {
            let store = self.store.lock().await;
            let Some(state) = store.subscriber(source, subscriber) else {
                tracing::debug!(source = %source, subscriber = %subscriber, "Subscription gone, skipping poll");
                return Ok(PollReport::default());
            };
            (state.watermark(), self.context(&store, source))
        };

        let entries = self.feeds.get_entries(&context).await;
        let fresh = select_new(&entries, watermark.last_update, &watermark.latest_link, self.limit);
        if fresh.is_empty() {
            tracing::info!(source = %source, subscriber = %subscriber, "No new entries");
            return Ok(PollReport::default());
        }
        tracing::info!(source = %source, subscriber = %subscriber, count = fresh.len(), "New entries selected");

        let delivered = self.deliver_entries(subscriber, &fresh).await;
        let report = PollReport {
            selected: fresh.len(),
            delivered: delivered.len(),
        };
        if delivered.is_empty() {
            return Ok(report);
        }

        let next = watermark.advance(delivered.iter().copied());
        let mut store = self.store.lock().await;
        match store.set_watermark(source, subscriber, next.clone()) {
            Ok(true) => {
                tracing::info!(
                    source = %source,
                    subscriber = %subscriber,
                    delivered = report.delivered,
                    last_update = next.last_update,
                    "Watermark advanced"
                );
                Ok(report)
            }
            Ok(false) => {
                tracing::warn!(
                    source = %source,
                    subscriber = %subscriber,
                    last_update = next.last_update,
                    "Stored watermark is newer, keeping it"
                );
                Ok(report)
            }
            Err(StoreError::UnknownSubscription { .. }) => {
                tracing::info!(source = %source, subscriber = %subscriber, "Subscription removed during delivery");
                Ok(report)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delivers `entries` (newest-first) and returns the delivered ones, newest-first.
    ///
    /// Per-item mode sends oldest-first and stops at the first failure, so
    /// the delivered entries are always the oldest of the batch. Composed mode
    /// sends everything as one grouped message and is all-or-nothing.
    async fn deliver_entries<'a>(&self, subscriber: &str, entries: &[&'a FeedEntry]) -> Vec<&'a FeedEntry> {
        if self.compose {
            let mut nodes = Vec::new();
            for entry in entries {
                nodes.extend(self.renderer.render(entry).await.into_nodes());
            }
            let count = nodes.len();
            let message = vec![MessagePart::Nodes { nodes }];
            return match send_with_rotation(self.delivery.as_ref(), &self.media, subscriber, message).await {
                Ok(()) => {
                    tracing::info!(subscriber = %subscriber, nodes = count, "Composed message delivered");
                    entries.to_vec()
                }
                Err(e) => {
                    tracing::error!(subscriber = %subscriber, error = %e, "Composed delivery failed");
                    Vec::new()
                }
            };
        }

        let total = entries.len();
        let mut sent = 0;
        for entry in entries.iter().rev() {
            if let Err(e) = self.deliver_one(subscriber, entry).await {
                tracing::error!(
                    subscriber = %subscriber,
                    link = %entry.link,
                    error = %e,
                    "Delivery failed, remaining entries wait for the next cycle"
                );
                break;
            }
            sent += 1;
            tracing::info!(subscriber = %subscriber, "Entry {}/{} delivered", sent, total);
        }
        entries[total - sent..].to_vec()
    }

    /// Sends one entry as its own message, then its video separately.
    ///
    /// Only the main message decides success; a failed video is logged.
    async fn deliver_one(&self, subscriber: &str, entry: &FeedEntry) -> Result<(), DeliveryError> {
        let rendered = self.renderer.render(entry).await;
        send_with_rotation(self.delivery.as_ref(), &self.media, subscriber, rendered.main).await?;
        if let Some(video) = rendered.video {
            if let Err(e) = self.delivery.send(subscriber, &[video]).await {
                tracing::warn!(subscriber = %subscriber, link = %entry.link, error = %e, "Video delivery failed");
            }
        }
        Ok(())
    }

    /// Fetches `source` and delivers its newest entry, leaving the watermark alone.
    ///
    /// Returns `false` when the feed has no entries.
    pub async fn deliver_latest(&self, source: &str, subscriber: &str) -> Result<bool, RelayError> {
        let context = {
            let store = self.store.lock().await;
            self.context(&store, source)
        };
        let entries = self.feeds.get_entries(&context).await;
        let Some(latest) = entries.first() else {
            return Ok(false);
        };

        if self.compose {
            let nodes = self.renderer.render(latest).await.into_nodes();
            let message = vec![MessagePart::Nodes { nodes }];
            send_with_rotation(self.delivery.as_ref(), &self.media, subscriber, message).await?;
        } else {
            self.deliver_one(subscriber, latest).await?;
        }
        Ok(true)
    }

    fn context(&self, store: &Store, source: &str) -> SourceContext {
        let context = SourceContext::new(source);
        match store.source(source) {
            Some(record) if !record.info.title.is_empty() => context.with_title(record.info.title.clone()),
            _ => context,
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Subscribes `subscriber` to `source` on `cron_expr` and reconciles.
    ///
    /// The watermark starts at the feed's newest entry, so only entries
    /// published afterwards are delivered. A new source needs a reachable
    /// feed with at least one entry; its channel info is stored with it.
    pub async fn subscribe(
        self: &Arc<Self>,
        source: &str,
        subscriber: &str,
        cron_expr: &str,
    ) -> Result<SourceInfo, RelayError> {
        let cron = CronSchedule::parse(cron_expr)?;
        let known = self.store.lock().await.source(source).is_some();

        let (newest, info) = if known {
            let context = {
                let store = self.store.lock().await;
                self.context(&store, source)
            };
            let entries = self.feeds.get_entries(&context).await;
            let newest = entries
                .first()
                .cloned()
                .ok_or_else(|| RelayError::NoEntries(source.to_string()))?;
            (newest, None)
        } else {
            let bytes = self.fetcher.fetch(source).await?;
            let info = parse_channel_info(&bytes)?;
            let context = SourceContext::new(source).with_title(info.title.clone());
            let newest = parse_entries(&bytes, &context, &self.parse_options)
                .into_iter()
                .next()
                .ok_or_else(|| RelayError::NoEntries(source.to_string()))?;
            (newest, Some(SourceInfo::from(info)))
        };

        let state = SubscriberState::new(cron.to_string(), Watermark::new(newest.published, newest.link));
        let info = {
            let mut store = self.store.lock().await;
            store.subscribe(source, subscriber, state, info)?;
            store
                .source(source)
                .map(|record| record.info.clone())
                .unwrap_or_default()
        };
        tracing::info!(source = %source, subscriber = %subscriber, cron = %cron, "Subscribed");

        self.reconcile().await;
        Ok(info)
    }

    /// Removes a subscription and reconciles.
    pub async fn unsubscribe(self: &Arc<Self>, source: &str, subscriber: &str) -> Result<(), RelayError> {
        self.store.lock().await.unsubscribe(source, subscriber)?;
        tracing::info!(source = %source, subscriber = %subscriber, "Unsubscribed");
        self.reconcile().await;
        Ok(())
    }
}
