//! Shared, TTL-bounded cache of parsed feed entries.
//!
//! Many subscriber jobs can reference the same source. The cache keeps at most
//! one fetch in flight per source: the first caller starts it, later callers
//! await the same shared future and receive its result, failures included.
//! Only successful results are stored, so the call after a failure fetches
//! again. Unrelated sources never contend.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::fetcher::FeedFetcher;
use super::parser::parse_feed;
use super::types::{FeedEntry, ParseOptions, SourceContext};

/// Outcome of one fetch-and-parse; `None` when it failed.
type FetchJob = Shared<BoxFuture<'static, Option<Arc<Vec<FeedEntry>>>>>;

struct CacheEntry {
    fetched_at: Instant,
    entries: Arc<Vec<FeedEntry>>,
}

/// Per-source cache of parsed entries in front of a [`FeedFetcher`].
pub struct FeedCache {
    fetcher: Arc<dyn FeedFetcher>,
    ttl: Duration,
    options: ParseOptions,
    entries: RwLock<HashMap<String, CacheEntry>>,
    // Lock order: in_flight before entries
    in_flight: Mutex<HashMap<String, FetchJob>>,
}

impl FeedCache {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, ttl: Duration, options: ParseOptions) -> Self {
        Self {
            fetcher,
            ttl,
            options,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entries of `source`, newest-first as published.
    ///
    /// A fresh cache hit never touches the network. A miss or stale hit joins
    /// the source's in-flight fetch, starting one if there is none, and the
    /// successful result replaces the cached entry. Fetch and parse failures
    /// yield an empty list for every caller of that fetch and leave the cache
    /// untouched, so the next call retries.
    pub async fn get_entries(&self, source: &SourceContext) -> Arc<Vec<FeedEntry>> {
        let job = {
            let mut in_flight = self.in_flight_table();
            // Checked under the table lock: a finished fetch stores its result
            // and leaves the table in one step
            if let Some(hit) = self.fresh(&source.url) {
                return hit;
            }
            match in_flight.get(&source.url) {
                Some(job) => {
                    tracing::debug!(source = %source.url, "Joining in-flight feed fetch");
                    job.clone()
                }
                None => {
                    let job = self.start_fetch(source);
                    in_flight.insert(source.url.clone(), job.clone());
                    job
                }
            }
        };

        let result = job.clone().await;
        self.finish(&source.url, &job, result.as_ref());
        result.unwrap_or_default()
    }

    /// Drops the cached entry for `source`, forcing the next call to fetch.
    pub fn invalidate(&self, source: &str) {
        if let Ok(mut map) = self.entries.write() {
            map.remove(source);
        }
    }

    /// Drops cached entries of every source `keep` rejects.
    pub fn retain<F>(&self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        match self.entries.write() {
            Ok(mut map) => map.retain(|source, _| keep(source)),
            Err(e) => tracing::error!(error = %e, "Feed cache lock poisoned"),
        }
    }

    /// Whether `source` currently has a cached result, fresh or stale.
    pub fn contains(&self, source: &str) -> bool {
        self.entries
            .read()
            .map(|map| map.contains_key(source))
            .unwrap_or(false)
    }

    fn start_fetch(&self, source: &SourceContext) -> FetchJob {
        let fetcher = Arc::clone(&self.fetcher);
        let options = self.options;
        let source = source.clone();
        async move {
            let bytes = match fetcher.fetch(&source.url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(source = %source.url, error = %e, "Feed fetch failed");
                    return None;
                }
            };

            match parse_feed(&bytes, &source, &options) {
                Ok(outcome) => {
                    if outcome.skipped > 0 {
                        tracing::warn!(
                            source = %source.url,
                            skipped = outcome.skipped,
                            "Malformed entries skipped"
                        );
                    }
                    Some(Arc::new(outcome.entries))
                }
                Err(e) => {
                    tracing::error!(source = %source.url, error = %e, "Feed document could not be parsed");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Retires `job` from the in-flight table, storing its result on success.
    ///
    /// Every caller of the job runs this; only the first one still finds the
    /// job in the table.
    fn finish(&self, source: &str, job: &FetchJob, result: Option<&Arc<Vec<FeedEntry>>>) {
        let mut in_flight = self.in_flight_table();
        if !in_flight.get(source).is_some_and(|current| current.ptr_eq(job)) {
            return;
        }
        in_flight.remove(source);
        if let Some(entries) = result {
            self.store(source, Arc::clone(entries));
        }
    }

    fn in_flight_table(&self) -> MutexGuard<'_, HashMap<String, FetchJob>> {
        // A poisoned table only means another thread panicked mid-insert; the map is still usable
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh(&self, source: &str) -> Option<Arc<Vec<FeedEntry>>> {
        let map = self.entries.read().ok()?;
        map.get(source)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.entries))
    }

    fn store(&self, source: &str, entries: Arc<Vec<FeedEntry>>) {
        match self.entries.write() {
            Ok(mut map) => {
                map.insert(
                    source.to_string(),
                    CacheEntry {
                        fetched_at: Instant::now(),
                        entries,
                    },
                );
            }
            Err(e) => tracing::error!(source = %source, error = %e, "Feed cache lock poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fetcher::FetchError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DOC: &str = "<rss><channel><title>T</title>\
        <item><title>One</title><link>https://s.example.com/1</link></item></channel></rss>";

    /// Serves `DOC`, failing the first `fail_first` calls.
    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl FeedFetcher for Scripted {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if n < self.fail_first {
                Err(FetchError::HttpStatus(502))
            } else {
                Ok(DOC.as_bytes().to_vec())
            }
        }
    }

    fn cache(fail_first: usize, ttl: Duration) -> (Arc<Scripted>, FeedCache) {
        let fetcher = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let cache = FeedCache::new(fetcher.clone(), ttl, ParseOptions::default());
        (fetcher, cache)
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_network() {
        let (fetcher, cache) = cache(0, Duration::from_secs(60));
        let ctx = SourceContext::new("https://s.example.com/rss");
        assert_eq!(cache.get_entries(&ctx).await.len(), 1);
        assert_eq!(cache.get_entries(&ctx).await.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_refetches() {
        let (fetcher, cache) = cache(0, Duration::ZERO);
        let ctx = SourceContext::new("https://s.example.com/rss");
        cache.get_entries(&ctx).await;
        cache.get_entries(&ctx).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let (fetcher, cache) = cache(1, Duration::from_secs(60));
        let ctx = SourceContext::new("https://s.example.com/rss");
        assert!(cache.get_entries(&ctx).await.is_empty());
        assert_eq!(cache.get_entries(&ctx).await.len(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let (fetcher, cache) = cache(0, Duration::from_secs(60));
        let cache = Arc::new(cache);
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .get_entries(&SourceContext::new("https://s.example.com/rss"))
                        .await
                        .len()
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let (fetcher, cache) = cache(1, Duration::from_secs(60));
        let cache = Arc::new(cache);
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .get_entries(&SourceContext::new("https://s.example.com/rss"))
                        .await
                        .len()
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 0);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // The failure was shared, not cached
        assert_eq!(
            cache
                .get_entries(&SourceContext::new("https://s.example.com/rss"))
                .await
                .len(),
            1
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retain_evicts_dropped_sources() {
        let (_fetcher, cache) = cache(0, Duration::from_secs(60));
        let kept = SourceContext::new("https://s.example.com/rss");
        let dropped = SourceContext::new("https://other.example.com/rss");
        cache.get_entries(&kept).await;
        cache.get_entries(&dropped).await;

        cache.retain(|source| source == kept.url);
        assert!(cache.contains(&kept.url));
        assert!(!cache.contains(&dropped.url));
    }

    #[tokio::test]
    async fn test_invalidate_forces_fetch() {
        let (fetcher, cache) = cache(0, Duration::from_secs(60));
        let ctx = SourceContext::new("https://s.example.com/rss");
        cache.get_entries(&ctx).await;
        cache.invalidate(&ctx.url);
        cache.get_entries(&ctx).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
