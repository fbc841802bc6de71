//! Configuration file parser for ~/.config/feedrelay/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning for each one
//! since they are usually typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::deliver::RenderOptions;
use crate::feed::{Limit, ParseOptions};
use crate::media::{MediaOptions, RetryPolicy};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Paths
// ============================================================================

/// `~/.config/feedrelay`, or `./.feedrelay` when `HOME` is unset.
pub fn config_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("feedrelay"),
        None => PathBuf::from(".feedrelay"),
    }
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Subscription store (JSON document).
    pub data_path: PathBuf,

    pub title_max_length: usize,
    pub description_max_length: usize,

    /// Entries delivered per poll. -1 = unbounded.
    pub max_items_per_poll: i64,

    /// How long a fetched feed is served from memory.
    pub cache_ttl_secs: u64,

    /// Deliver each poll as one grouped forwarded message.
    pub compose: bool,

    pub hide_url: bool,

    /// Timezone for rendered publish times, in hours east of UTC.
    pub utc_offset_hours: i32,

    pub media: MediaConfig,
    pub delivery: DeliveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: config_dir().join("subscriptions.json"),
            title_max_length: 30,
            description_max_length: 500,
            max_items_per_poll: -1,
            cache_ttl_secs: 60,
            compose: false,
            hide_url: false,
            utc_offset_hours: 8,
            media: MediaConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub read_images: bool,
    /// Tweak one corner pixel of every downloaded static image.
    pub adjust_images: bool,
    /// -1 = all.
    pub max_images_per_item: i64,
    pub download_video: bool,
    pub cache_dir: PathBuf,
    pub cleanup_cron: String,
    pub cleanup_retention_minutes: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            read_images: true,
            adjust_images: false,
            max_images_per_item: -1,
            download_video: false,
            cache_dir: std::env::temp_dir().join("feedrelay_media"),
            cleanup_cron: "0 * * * *".to_string(),
            cleanup_retention_minutes: 60,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 30,
        }
    }
}

/// SEC-015: `token` is a [`SecretString`], so Debug output shows `[REDACTED]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bridge endpoint receiving JSON messages. Unset = log only.
    pub webhook_url: Option<String>,
    pub token: Option<SecretString>,
}

const TOP_LEVEL_KEYS: [&str; 10] = [
    "data_path",
    "title_max_length",
    "description_max_length",
    "max_items_per_poll",
    "cache_ttl_secs",
    "compose",
    "hide_url",
    "utc_offset_hours",
    "media",
    "delivery",
];

const MEDIA_KEYS: [&str; 10] = [
    "read_images",
    "adjust_images",
    "max_images_per_item",
    "download_video",
    "cache_dir",
    "cleanup_cron",
    "cleanup_retention_minutes",
    "max_attempts",
    "retry_base_delay_ms",
    "request_timeout_secs",
];

const DELIVERY_KEYS: [&str; 2] = ["webhook_url", "token"];

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            data_path = %config.data_path.display(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            title_max_length: self.title_max_length,
            description_max_length: self.description_max_length,
        }
    }

    pub fn poll_limit(&self) -> Limit {
        Limit::from_config(self.max_items_per_poll)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            description_max_length: self.description_max_length,
            hide_url: self.hide_url,
            utc_offset_hours: self.utc_offset_hours,
            read_images: self.media.read_images,
            max_images_per_item: self.media.max_images_per_item,
            download_video: self.media.download_video,
        }
    }

    pub fn media_options(&self) -> MediaOptions {
        MediaOptions {
            dir: self.media.cache_dir.clone(),
            retry: RetryPolicy::new(
                self.media.max_attempts,
                Duration::from_millis(self.media.retry_base_delay_ms),
            ),
            request_timeout: Duration::from_secs(self.media.request_timeout_secs),
            adjust_images: self.media.adjust_images,
        }
    }

    /// How long cached media is kept before cleanup removes it.
    pub fn media_retention(&self) -> Duration {
        Duration::from_secs(self.media.cleanup_retention_minutes.saturating_mul(60))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let known: &[&str] = match key.as_str() {
            "media" => &MEDIA_KEYS,
            "delivery" => &DELIVERY_KEYS,
            _ => continue,
        };
        if let Some(table) = value.as_table() {
            for nested in table.keys() {
                if !known.contains(&nested.as_str()) {
                    tracing::warn!(key = %format!("{}.{}", key, nested), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
