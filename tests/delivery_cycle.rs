//! Full poll cycles: subscribe, the feed grows, the next poll delivers only
//! what is new and moves the watermark.

use async_trait::async_trait;
use feedrelay::deliver::{Delivery, DeliveryError, MessagePart};
use feedrelay::feed::HttpFetcher;
use feedrelay::media::{MediaCache, MediaOptions, RetryPolicy};
use feedrelay::scheduler::{JobCallback, JobKey, Scheduler, SchedulerError, Trigger};
use feedrelay::storage::Store;
use feedrelay::{Config, PollReport, Relay};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JAN_2: i64 = 1_704_153_600;
const JAN_3: i64 = JAN_2 + 86_400;

fn feed(items: &[String]) -> String {
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Photos</title><description>Daily</description>{}</channel></rss>"#,
        items.concat()
    )
}

fn item(title: &str, day: usize, extra_html: &str) -> String {
    let weekday = ["Mon", "Tue", "Wed"][day - 1];
    format!(
        "<item><title>{title}</title><link>https://photos.example/{title}</link>\
         <pubDate>{weekday}, {day:02} Jan 2024 00:00:00 GMT</pubDate>\
         <description><![CDATA[<p>{title} text</p>{extra_html}]]></description></item>"
    )
}

/// Replays scripted outcomes, then succeeds; records every attempt.
#[derive(Default)]
struct Scripted {
    outcomes: Mutex<VecDeque<Result<(), DeliveryError>>>,
    attempts: Mutex<Vec<Vec<MessagePart>>>,
}

#[async_trait]
impl Delivery for Scripted {
    async fn send(&self, _target: &str, parts: &[MessagePart]) -> Result<(), DeliveryError> {
        self.attempts.lock().unwrap().push(parts.to_vec());
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct NoJobs;

#[async_trait]
impl Scheduler for NoJobs {
    async fn upsert(&self, _key: JobKey, _trigger: Trigger, _callback: JobCallback) -> Result<(), SchedulerError> {
        Ok(())
    }
    async fn remove(&self, _key: &JobKey) -> Result<(), SchedulerError> {
        Ok(())
    }
    async fn job_keys(&self) -> Vec<JobKey> {
        Vec::new()
    }
}

fn png_bytes() -> Vec<u8> {
    let mut img = RgbaImage::from_pixel(2, 1, Rgba([255, 0, 0, 255]));
    img.put_pixel(1, 0, Rgba([0, 0, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn relay(dir: &TempDir, delivery: Arc<Scripted>) -> Arc<Relay> {
    let config = Config {
        cache_ttl_secs: 0,
        ..Default::default()
    };
    let client = reqwest::Client::new();
    let media = MediaCache::new(
        client.clone(),
        MediaOptions {
            dir: dir.path().join("media"),
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            request_timeout: Duration::from_secs(5),
            adjust_images: false,
        },
    )
    .unwrap();
    Relay::new(
        &config,
        Store::open(dir.path().join("subs.json")).unwrap(),
        Arc::new(HttpFetcher::new(client)),
        Arc::new(media),
        delivery,
        Arc::new(NoJobs),
    )
}

#[tokio::test]
async fn test_new_entry_with_image_survives_rate_limit() {
    let server = MockServer::start().await;
    let image_url = format!("{}/img/c.png", server.uri());
    let before = feed(&[item("b", 2, ""), item("a", 1, "")]);
    let after = feed(&[
        item("c", 3, &format!(r#"<img src="{}">"#, image_url)),
        item("b", 2, ""),
        item("a", 1, ""),
    ]);

    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(before))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(after))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/c.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(Scripted::default());
    delivery
        .outcomes
        .lock()
        .unwrap()
        .push_back(Err(DeliveryError::RateLimited("HTTP 429".into())));
    let relay = relay(&dir, delivery.clone());
    let source = format!("{}/rss", server.uri());

    relay.subscribe(&source, "u1", "*/5 * * * *").await.unwrap();
    assert_eq!(
        relay.store().await.subscriber(&source, "u1").unwrap().last_update,
        JAN_2
    );

    let report = relay.poll(&source, "u1").await.unwrap();
    assert_eq!(report, PollReport { selected: 1, delivered: 1 });

    let attempts = delivery.attempts.lock().unwrap();
    assert_eq!(attempts.len(), 2);
    let retried = &attempts[1];
    assert!(matches!(&retried[0], MessagePart::Text { text } if text.contains("📌 c") && text.contains("📷 Images (1):")));
    let image_path = match &retried[1] {
        MessagePart::Image { path } => path.clone(),
        other => panic!("expected image part, got {:?}", other),
    };
    assert_eq!(retried.last(), Some(&MessagePart::text("\n(images rotated)")));

    let rotated = image::open(&image_path).unwrap().to_rgba8();
    assert_eq!(*rotated.get_pixel(0, 0), Rgba([0, 0, 255, 255]));

    let state = relay.store().await.subscriber(&source, "u1").cloned().unwrap();
    assert_eq!(state.last_update, JAN_3);
    assert_eq!(state.latest_link, "https://photos.example/c");
}

#[tokio::test]
async fn test_persistent_failure_redelivers_next_cycle() {
    let server = MockServer::start().await;
    let entries = feed(&[item("b", 2, ""), item("a", 1, "")]);
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(entries))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(Scripted::default());
    delivery
        .outcomes
        .lock()
        .unwrap()
        .push_back(Err(DeliveryError::Failed("bridge offline".into())));
    let relay = relay(&dir, delivery.clone());
    let source = format!("{}/rss", server.uri());

    relay
        .store()
        .await
        .subscribe(
            &source,
            "u1",
            feedrelay::storage::SubscriberState::new("0 * * * *", feedrelay::feed::Watermark::new(0, "")),
            None,
        )
        .unwrap();

    // First cycle: the oldest entry fails, nothing is delivered
    let first = relay.poll(&source, "u1").await.unwrap();
    assert_eq!(first, PollReport { selected: 2, delivered: 0 });
    assert_eq!(relay.store().await.subscriber(&source, "u1").unwrap().last_update, 0);

    // Second cycle: the same two entries are selected again and go through
    let second = relay.poll(&source, "u1").await.unwrap();
    assert_eq!(second, PollReport { selected: 2, delivered: 2 });
    assert_eq!(relay.store().await.subscriber(&source, "u1").unwrap().last_update, JAN_2);
}
