//! Integration tests for media downloads with retry against a mock host.

use feedrelay::media::{MediaCache, MediaError, MediaOptions, RetryPolicy};
use pretty_assertions::assert_eq;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn media(dir: &TempDir, attempts: u32) -> MediaCache {
    MediaCache::new(
        reqwest::Client::new(),
        MediaOptions {
            dir: dir.path().to_path_buf(),
            retry: RetryPolicy::new(attempts, Duration::from_millis(5)),
            request_timeout: Duration::from_secs(5),
            adjust_images: false,
        },
    )
    .unwrap()
}

fn file_names(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_fails_twice_then_succeeds_without_partial_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cat.png"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cat.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png-bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = media(&dir, 3);
    let url = format!("{}/cat.png", server.uri());

    let local = cache.fetch_image(&url).await.unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), b"png-bytes");
    assert_eq!(local, cache.path_for(&url, feedrelay::media::MediaKind::Image));
    assert_eq!(file_names(&dir).len(), 1);
    assert!(file_names(&dir)[0].ends_with(".png"));
}

#[tokio::test]
async fn test_second_fetch_is_a_cache_hit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = media(&dir, 3);
    let url = format!("{}/clip.mp4", server.uri());
    let first = cache.fetch_video(&url).await.unwrap();
    let second = cache.fetch_video(&url).await.unwrap();
    assert_eq!(first, second);
    assert!(first.to_string_lossy().ends_with(".mp4"));
}

#[tokio::test]
async fn test_extension_from_content_type_when_url_has_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/render"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"png-bytes".to_vec(), "image/png"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = media(&dir, 1);
    let url = format!("{}/render?id=42", server.uri());

    let first = cache.fetch_image(&url).await.unwrap();
    assert!(first.to_string_lossy().ends_with(".png"));
    // Found again under the extension the server chose
    assert_eq!(cache.fetch_image(&url).await.unwrap(), first);
    assert_eq!(file_names(&dir).len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_leave_nothing_behind() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = media(&dir, 2);
    let err = cache
        .fetch_image(&format!("{}/missing.jpg", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::HttpStatus(404)));
    assert!(file_names(&dir).is_empty());
}

#[tokio::test]
async fn test_empty_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cache = media(&dir, 1);
    let err = cache
        .fetch_image(&format!("{}/blank.gif", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::Empty));
    assert!(file_names(&dir).is_empty());
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_files() {
    let dir = TempDir::new().unwrap();
    let cache = media(&dir, 1);
    std::fs::write(dir.path().join("fresh.jpg"), b"x").unwrap();
    let stale = dir.path().join("stale.jpg");
    std::fs::write(&stale, b"x").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&stale)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(2 * 3600))
        .unwrap();

    assert_eq!(cache.cleanup(Duration::from_secs(3600)).await, 1);
    assert_eq!(file_names(&dir), vec!["fresh.jpg".to_string()]);
}
