//! Incremental selection of entries a subscriber has not seen yet.
//!
//! Feeds are assumed newest-first. Selection stops at the first timestamped
//! entry at or below the watermark, so a feed that publishes out of order can
//! under-deliver: anything listed after an already-seen entry is never looked
//! at. Undated entries are deduplicated against the last delivered link only.

use super::types::FeedEntry;

/// Cap on entries selected per poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    #[default]
    Unbounded,
    AtMost(usize),
}

impl Limit {
    /// Maps the configuration convention (`-1` or any negative = unbounded).
    pub fn from_config(value: i64) -> Self {
        match usize::try_from(value) {
            Ok(n) => Limit::AtMost(n),
            Err(_) => Limit::Unbounded,
        }
    }

    fn reached(self, count: usize) -> bool {
        matches!(self, Limit::AtMost(n) if count >= n)
    }
}

/// Marks the most recent content delivered to a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    pub last_update: i64,
    pub latest_link: String,
}

impl Watermark {
    pub fn new(last_update: i64, latest_link: impl Into<String>) -> Self {
        Self {
            last_update,
            latest_link: latest_link.into(),
        }
    }

    /// Advances past `delivered` (newest-first).
    ///
    /// The timestamp never decreases and never uses wall-clock time. The link
    /// becomes the newest delivered entry's link. Nothing delivered means no change.
    pub fn advance<'a, I>(&self, delivered: I) -> Watermark
    where
        I: IntoIterator<Item = &'a FeedEntry>,
    {
        let mut next = self.clone();
        let mut newest_link = None;
        for entry in delivered {
            next.last_update = next.last_update.max(entry.published);
            if newest_link.is_none() {
                newest_link = Some(entry.link.clone());
            }
        }
        if let Some(link) = newest_link {
            next.latest_link = link;
        }
        next
    }
}

/// Selects entries newer than the watermark, preserving input order.
///
/// An entry is new when it has a positive timestamp greater than
/// `after_ts`, or no timestamp and a link different from `after_link`.
/// Nothing at or after the first already-seen timestamped entry is selected;
/// for fully dated feeds the result is a prefix of `entries`.
pub fn select_new<'a>(
    entries: &'a [FeedEntry],
    after_ts: i64,
    after_link: &str,
    limit: Limit,
) -> Vec<&'a FeedEntry> {
    let mut selected = Vec::new();
    for entry in entries {
        if limit.reached(selected.len()) {
            break;
        }
        if entry.has_timestamp() {
            if entry.published <= after_ts {
                break;
            }
        } else if entry.link == after_link {
            continue;
        }
        selected.push(entry);
    }
    selected
}
