use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::{SourceInfo, SourceRecord, StoreData, StoreError, SubscriberState, Subscription};
use crate::feed::Watermark;

/// Subscription table and hub endpoints, persisted as one JSON document.
///
/// Every mutation re-reads the file, applies its change and writes it back
/// before returning. Edits made by another process (the CLI next to a running
/// daemon) therefore survive this process's next write.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: StoreData,
}

impl Store {
    /// Loads the store, creating the file with defaults when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let store = Self {
                path,
                data: StoreData::default(),
            };
            store.save()?;
            tracing::info!(path = %store.path.display(), "Created subscription store");
            return Ok(store);
        }
        let data = read_document(&path)?;
        Ok(Self { path, data })
    }

    /// Re-reads the file, picking up edits made outside the process.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.data = read_document(&self.path)?;
        Ok(())
    }

    /// Picks up the file's current contents before a mutation.
    ///
    /// A file that has vanished keeps the in-memory copy, which the following
    /// save writes back.
    fn refresh(&mut self) -> Result<(), StoreError> {
        match read_document(&self.path) {
            Ok(data) => {
                self.data = data;
                Ok(())
            }
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Store file missing, rewriting from memory");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &StoreData {
        &self.data
    }

    /// Writes the document atomically (temp file, fsync, rename).
    pub fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.data).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;
        atomic_write(&self.path, &json)
    }

    // ------------------------------------------------------------------------
    // Hub endpoints
    // ------------------------------------------------------------------------

    pub fn hubs(&self) -> &[String] {
        &self.data.rsshub_endpoints
    }

    pub fn add_hub(&mut self, endpoint: &str) -> Result<(), StoreError> {
        self.refresh()?;
        if self.data.rsshub_endpoints.iter().any(|h| h == endpoint) {
            return Err(StoreError::DuplicateHub(endpoint.to_string()));
        }
        self.data.rsshub_endpoints.push(endpoint.to_string());
        self.save()
    }

    pub fn remove_hub(&mut self, index: usize) -> Result<String, StoreError> {
        self.refresh()?;
        let len = self.data.rsshub_endpoints.len();
        if index >= len {
            return Err(StoreError::IndexOutOfRange { index, len });
        }
        let removed = self.data.rsshub_endpoints.remove(index);
        self.save()?;
        Ok(removed)
    }

    pub fn hub(&self, index: usize) -> Result<&str, StoreError> {
        self.data
            .rsshub_endpoints
            .get(index)
            .map(String::as_str)
            .ok_or(StoreError::IndexOutOfRange {
                index,
                len: self.data.rsshub_endpoints.len(),
            })
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    pub fn source(&self, url: &str) -> Option<&SourceRecord> {
        self.data.sources.get(url)
    }

    /// Every (source, subscriber) pair, ordered by source then subscriber.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.data
            .sources
            .iter()
            .flat_map(|(source, record)| {
                record.subscribers.iter().map(move |(subscriber, state)| Subscription {
                    source: source.clone(),
                    subscriber: subscriber.clone(),
                    state: state.clone(),
                })
            })
            .collect()
    }

    /// Source URLs `subscriber` follows, in the order used for list indices.
    pub fn sources_of(&self, subscriber: &str) -> Vec<&str> {
        self.data
            .sources
            .iter()
            .filter(|(_, record)| record.subscribers.contains_key(subscriber))
            .map(|(url, _)| url.as_str())
            .collect()
    }

    pub fn subscriber(&self, source: &str, subscriber: &str) -> Option<&SubscriberState> {
        self.data.sources.get(source)?.subscribers.get(subscriber)
    }

    /// Adds or replaces `subscriber` on `source`.
    ///
    /// `info` is recorded only when the source is new; an existing source
    /// keeps the metadata captured by its first subscriber.
    pub fn subscribe(
        &mut self,
        source: &str,
        subscriber: &str,
        state: SubscriberState,
        info: Option<SourceInfo>,
    ) -> Result<(), StoreError> {
        self.refresh()?;
        let record = self
            .data
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceRecord {
                info: info.unwrap_or_default(),
                ..Default::default()
            });
        record.subscribers.insert(subscriber.to_string(), state);
        self.save()
    }

    /// Removes `subscriber` from `source`, dropping the source once nobody follows it.
    pub fn unsubscribe(&mut self, source: &str, subscriber: &str) -> Result<(), StoreError> {
        self.refresh()?;
        let unknown = || StoreError::UnknownSubscription {
            url: source.to_string(),
            subscriber: subscriber.to_string(),
        };
        let record = self.data.sources.get_mut(source).ok_or_else(unknown)?;
        record.subscribers.remove(subscriber).ok_or_else(unknown)?;
        if record.subscribers.is_empty() {
            self.data.sources.remove(source);
        }
        self.save()
    }

    /// Records a new watermark for one subscriber.
    ///
    /// The stored timestamp never moves backwards: a watermark older than the
    /// stored one is ignored and `Ok(false)` is returned.
    pub fn set_watermark(
        &mut self,
        source: &str,
        subscriber: &str,
        watermark: Watermark,
    ) -> Result<bool, StoreError> {
        self.refresh()?;
        let state = self
            .data
            .sources
            .get_mut(source)
            .and_then(|record| record.subscribers.get_mut(subscriber))
            .ok_or_else(|| StoreError::UnknownSubscription {
                url: source.to_string(),
                subscriber: subscriber.to_string(),
            })?;
        if watermark.last_update < state.last_update {
            tracing::debug!(
                source = %source,
                subscriber = %subscriber,
                stored = state.last_update,
                offered = watermark.last_update,
                "Ignoring older watermark"
            );
            return Ok(false);
        }
        state.last_update = watermark.last_update;
        state.latest_link = watermark.latest_link;
        self.save()?;
        Ok(true)
    }
}

fn read_document(path: &Path) -> Result<StoreData, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StoreData::default());
    }
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })
}

/// Replaces `dst` with `content` so readers see either the old or the new file.
fn atomic_write(dst: &Path, content: &[u8]) -> Result<(), StoreError> {
    // SEC-009: Randomized temp filename; create_new refuses a pre-planted file or symlink
    let temp_path = dst.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let io_err = |path: &Path, source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let result = (|| {
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| io_err(&temp_path, e))?;
        temp_file.write_all(content).map_err(|e| io_err(&temp_path, e))?;
        // Sync to disk to ensure data is persisted before rename
        temp_file.sync_all().map_err(|e| io_err(&temp_path, e))?;
        drop(temp_file);

        // On Windows, rename fails if destination exists, so remove it first
        #[cfg(windows)]
        if dst.exists() {
            std::fs::remove_file(dst).map_err(|e| io_err(dst, e))?;
        }

        std::fs::rename(&temp_path, dst).map_err(|e| io_err(dst, e))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}
