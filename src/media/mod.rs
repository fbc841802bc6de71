//! Content-addressed cache of downloaded images and videos.
//!
//! Files are named by the SHA-256 of their URL, so repeated references to the
//! same URL hit the disk instead of the network. Downloads stream into a
//! per-attempt `.part` file that is renamed into place only once complete;
//! a failed attempt removes its own partial file before the next one starts.

mod retry;
mod transform;

pub use retry::RetryPolicy;
pub use transform::{
    adjust_corner_pixel, is_animated_format, rotate_180, TransformError, TransformOutcome,
};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "webm", "mov", "m4v", "mkv"];

/// Videos get this many request timeouts per attempt.
const VIDEO_TIMEOUT_FACTOR: u32 = 10;

const PART_SUFFIX: &str = "part";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("Download timed out after {0:?}")]
    Timeout(Duration),

    #[error("Downloaded file is empty")]
    Empty,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn known_extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &IMAGE_EXTENSIONS,
            MediaKind::Video => &VIDEO_EXTENSIONS,
        }
    }

    fn default_extension(self) -> &'static str {
        match self {
            MediaKind::Image => "jpg",
            MediaKind::Video => "mp4",
        }
    }
}

/// Settings for a [`MediaCache`].
#[derive(Debug, Clone)]
pub struct MediaOptions {
    pub dir: PathBuf,
    pub retry: RetryPolicy,
    /// Per-attempt bound for image downloads.
    pub request_timeout: Duration,
    /// Apply the corner-pixel tweak to freshly downloaded static images.
    pub adjust_images: bool,
}

pub struct MediaCache {
    client: reqwest::Client,
    options: MediaOptions,
}

impl MediaCache {
    /// Creates the cache, making sure its directory exists.
    pub fn new(client: reqwest::Client, options: MediaOptions) -> Result<Self, MediaError> {
        std::fs::create_dir_all(&options.dir).map_err(|source| MediaError::Io {
            path: options.dir.clone(),
            source,
        })?;
        Ok(Self { client, options })
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    /// Local path a URL is cached under when the URL names its extension.
    ///
    /// URLs without a usable extension take it from the response
    /// `Content-Type`; for those this is the path used when the server sends
    /// none either.
    pub fn path_for(&self, url: &str, kind: MediaKind) -> PathBuf {
        self.path_with(url, url_extension(url, kind).unwrap_or(kind.default_extension()))
    }

    fn path_with(&self, url: &str, extension: &str) -> PathBuf {
        self.options.dir.join(format!("{}.{}", url_hash(url), extension))
    }

    /// Finds an existing copy of `url`, wherever its extension came from.
    async fn lookup(&self, url: &str, kind: MediaKind) -> Option<PathBuf> {
        let candidates = match url_extension(url, kind) {
            Some(extension) => vec![extension],
            None => kind.known_extensions().to_vec(),
        };
        for extension in candidates {
            let path = self.path_with(url, extension);
            if is_cached(&path).await {
                return Some(path);
            }
        }
        None
    }

    /// Returns a local copy of an image, downloading it on a cache miss.
    pub async fn fetch_image(&self, url: &str) -> Result<PathBuf, MediaError> {
        self.fetch(url, MediaKind::Image).await
    }

    /// Returns a local copy of a video, streaming it to disk on a cache miss.
    pub async fn fetch_video(&self, url: &str) -> Result<PathBuf, MediaError> {
        self.fetch(url, MediaKind::Video).await
    }

    async fn fetch(&self, url: &str, kind: MediaKind) -> Result<PathBuf, MediaError> {
        if let Some(path) = self.lookup(url, kind).await {
            tracing::debug!(url = %url, path = %path.display(), "Media cache hit");
            return Ok(path);
        }

        let timeout = match kind {
            MediaKind::Image => self.options.request_timeout,
            MediaKind::Video => self.options.request_timeout * VIDEO_TIMEOUT_FACTOR,
        };

        let dest = self
            .options
            .retry
            .run(url, move |_| self.download_attempt(url, kind, timeout))
            .await?;

        if kind == MediaKind::Image && self.options.adjust_images {
            self.adjust(&dest).await;
        }

        tracing::debug!(url = %url, path = %dest.display(), kind = ?kind, "Media downloaded");
        Ok(dest)
    }

    /// One download into a fresh `.part` file, renamed to its final path on success.
    async fn download_attempt(
        &self,
        url: &str,
        kind: MediaKind,
        timeout: Duration,
    ) -> Result<PathBuf, MediaError> {
        let part = self.path_with(url, &format!("{}.{}", uuid::Uuid::new_v4(), PART_SUFFIX));

        let result = match tokio::time::timeout(timeout, self.download_to(url, &part, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::Timeout(timeout)),
        };

        match result {
            Ok(content_type) => {
                let extension = url_extension(url, kind)
                    .or_else(|| content_type.as_deref().and_then(|ct| content_type_extension(ct, kind)))
                    .unwrap_or(kind.default_extension());
                let dest = self.path_with(url, extension);
                if let Err(source) = tokio::fs::rename(&part, &dest).await {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(MediaError::Io { path: dest, source });
                }
                Ok(dest)
            }
            Err(e) => {
                // Partial downloads must not survive into the next attempt
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %part.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                Err(e)
            }
        }
    }

    /// Streams the body into `part` and returns the response `Content-Type`.
    async fn download_to(
        &self,
        url: &str,
        part: &Path,
        timeout: Duration,
    ) -> Result<Option<String>, MediaError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        if !response.status().is_success() {
            return Err(MediaError::HttpStatus(response.status().as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let io_err = |source| MediaError::Io {
            path: part.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(part).await.map_err(io_err)?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;

        if written == 0 {
            return Err(MediaError::Empty);
        }
        Ok(content_type)
    }

    async fn adjust(&self, path: &Path) {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || adjust_corner_pixel(&owned)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "Image adjustment failed, keeping original")
            }
            Err(e) => tracing::error!(error = %e, "Image adjustment task panicked"),
        }
    }

    /// Rotates a cached image 180 degrees in place.
    ///
    /// Returns whether the file changed; animated images and failures leave
    /// it as is and return `false`.
    pub async fn rotate(&self, path: &Path) -> bool {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || rotate_180(&owned)).await {
            Ok(Ok(outcome)) => outcome.applied(),
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "Image rotation failed");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Image rotation task panicked");
                false
            }
        }
    }

    /// Deletes cached files last modified more than `max_age` ago.
    ///
    /// Best effort: files that vanish or cannot be inspected are skipped.
    /// Returns the number of files removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.options.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(dir = %self.options.dir.display(), error = %e, "Cannot read media cache directory");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Media cache directory listing interrupted");
                    break;
                }
            };
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let expired = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if expired && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed = removed, max_age_secs = max_age.as_secs(), "Cleaned up cached media");
        }
        removed
    }
}

async fn is_cached(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}

fn url_hash(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Extension named by the URL path, if it is one `kind` knows.
fn url_extension(url: &str, kind: MediaKind) -> Option<&'static str> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or("").to_string());
    let ext = Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)?;
    kind.known_extensions()
        .iter()
        .copied()
        .find(|known| *known == ext)
}

/// Extension for a response `Content-Type`, if it is one `kind` knows.
fn content_type_extension(content_type: &str, kind: MediaKind) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" | "image/x-ms-bmp" => "bmp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-m4v" => "m4v",
        "video/x-matroska" => "mkv",
        _ => return None,
    };
    kind.known_extensions().contains(&ext).then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> MediaCache {
        MediaCache::new(
            reqwest::Client::new(),
            MediaOptions {
                dir: dir.path().join("media"),
                retry: RetryPolicy::new(2, Duration::from_millis(1)),
                request_timeout: Duration::from_secs(5),
                adjust_images: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://x.io/a/b.PNG?w=100", MediaKind::Image), Some("png"));
        assert_eq!(url_extension("https://x.io/a/b", MediaKind::Image), None);
        assert_eq!(url_extension("https://x.io/v.webm", MediaKind::Video), Some("webm"));
        assert_eq!(url_extension("https://x.io/v.php", MediaKind::Video), None);
        assert_eq!(url_extension("https://x.io/clip.mp4", MediaKind::Image), None);
    }

    #[test]
    fn test_content_type_extension() {
        assert_eq!(content_type_extension("image/png", MediaKind::Image), Some("png"));
        assert_eq!(content_type_extension("Image/JPEG; charset=binary", MediaKind::Image), Some("jpg"));
        assert_eq!(content_type_extension("video/quicktime", MediaKind::Video), Some("mov"));
        assert_eq!(content_type_extension("video/mp4", MediaKind::Image), None);
        assert_eq!(content_type_extension("text/html", MediaKind::Image), None);
    }

    #[test]
    fn test_path_for_defaults_when_url_has_no_extension() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let path = cache.path_for("https://x.io/img?id=7", MediaKind::Image);
        assert_eq!(path.extension().unwrap(), "jpg");
    }

    #[test]
    fn test_path_depends_only_on_url() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let a = cache.path_for("https://x.io/a.png", MediaKind::Image);
        assert_eq!(a, cache.path_for("https://x.io/a.png", MediaKind::Image));
        assert_ne!(a, cache.path_for("https://x.io/b.png", MediaKind::Image));
        assert!(a.starts_with(cache.dir()));
        assert_eq!(a.file_name().unwrap().to_string_lossy().len(), 64 + ".png".len());
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits_network() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        // Unroutable URL: any network attempt would fail
        let url = "http://127.0.0.1:9/cached.jpg";
        let path = cache.path_for(url, MediaKind::Image);
        std::fs::write(&path, b"bytes").unwrap();
        assert_eq!(cache.fetch_image(url).await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_empty_cached_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let url = "http://127.0.0.1:9/empty.jpg";
        std::fs::write(cache.path_for(url, MediaKind::Image), b"").unwrap();
        assert!(cache.fetch_image(url).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let old = cache.dir().join("old.jpg");
        let fresh = cache.dir().join("fresh.jpg");
        std::fs::write(&old, b"o").unwrap();
        std::fs::write(&fresh, b"f").unwrap();
        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        assert_eq!(cache.cleanup(Duration::from_secs(3600)).await, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
