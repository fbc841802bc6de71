use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::feed::{ChannelInfo, Watermark};

// ============================================================================
// Error Types
// ============================================================================

/// Persistence errors, reported to the command surface as text.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access store file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store file '{path}' is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Hub endpoint already exists: {0}")]
    DuplicateHub(String),

    #[error("Index {index} out of range (have {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("No subscription of {subscriber} to {url}")]
    UnknownSubscription { url: String, subscriber: String },
}

// ============================================================================
// Document Types
// ============================================================================

/// Per-subscriber schedule and watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberState {
    pub cron_expr: String,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub latest_link: String,
}

impl SubscriberState {
    pub fn new(cron_expr: impl Into<String>, watermark: Watermark) -> Self {
        Self {
            cron_expr: cron_expr.into(),
            last_update: watermark.last_update,
            latest_link: watermark.latest_link,
        }
    }

    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.last_update, self.latest_link.clone())
    }
}

/// Channel metadata captured when the first subscriber was added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl From<ChannelInfo> for SourceInfo {
    fn from(info: ChannelInfo) -> Self {
        Self {
            title: info.title,
            description: info.description,
        }
    }
}

/// Everything stored for one source URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(default)]
    pub subscribers: BTreeMap<String, SubscriberState>,
    #[serde(default)]
    pub info: SourceInfo,
}

/// The whole persisted document.
///
/// Source records sit at the top level keyed by URL, next to the
/// `rsshub_endpoints` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub rsshub_endpoints: Vec<String>,
    /// Opaque settings block some deployments keep in the same file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(flatten)]
    pub sources: BTreeMap<String, SourceRecord>,
}

/// One (source, subscriber) pair, as seen by the scheduler and the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub source: String,
    pub subscriber: String,
    pub state: SubscriberState,
}
