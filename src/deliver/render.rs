//! Turns a [`FeedEntry`] into message parts.
//!
//! The text part is a fixed layout: channel header, title, a meta line
//! (author, categories, publish time), the body, then link, enclosure and
//! comments lines. Images follow as separate parts after being resolved
//! through the media cache; a video enclosure becomes its own part so it
//! can be sent on its own.

use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use std::sync::Arc;

use super::{MessagePart, VideoSource};
use crate::feed::FeedEntry;
use crate::media::MediaCache;

const SEPARATOR_WIDTH: usize = 30;
const MAX_CATEGORIES: usize = 3;

/// Rendering switches taken from the configuration.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub description_max_length: usize,
    pub hide_url: bool,
    /// Offset applied to publish times, in whole hours east of UTC.
    pub utc_offset_hours: i32,
    pub read_images: bool,
    /// `-1` (any negative) shows every image.
    pub max_images_per_item: i64,
    pub download_video: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            description_max_length: 500,
            hide_url: false,
            utc_offset_hours: 8,
            read_images: true,
            max_images_per_item: -1,
            download_video: false,
        }
    }
}

/// A rendered entry: the main message and an optional separate video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub main: Vec<MessagePart>,
    pub video: Option<MessagePart>,
}

impl Rendered {
    /// Forwarded nodes for grouped delivery: one for the main parts, one for the video.
    pub fn into_nodes(self) -> Vec<MessagePart> {
        let mut nodes = vec![MessagePart::node(self.main)];
        if let Some(video) = self.video {
            nodes.push(MessagePart::node(vec![video]));
        }
        nodes
    }
}

pub struct Renderer {
    options: RenderOptions,
    media: Arc<MediaCache>,
}

impl Renderer {
    pub fn new(options: RenderOptions, media: Arc<MediaCache>) -> Self {
        Self { options, media }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub async fn render(&self, entry: &FeedEntry) -> Rendered {
        let separator = "─".repeat(SEPARATOR_WIDTH);
        let mut lines = vec![
            format!("📰 {}", entry.channel_title),
            separator.clone(),
            format!("📌 {}", entry.title),
        ];

        let meta = self.meta_line(entry);
        if !meta.is_empty() {
            lines.push(meta);
        }
        lines.push(separator);

        let body = entry.display_content(self.options.description_max_length);
        let body = body.trim();
        if !body.is_empty() {
            lines.push(body.to_string());
        }

        if !self.options.hide_url && !entry.link.is_empty() {
            lines.push(String::new());
            lines.push(format!("🔗 {}", entry.link));
        }

        let mut video = None;
        if !entry.enclosure_url.is_empty() {
            lines.push(String::new());
            let kind = if entry.enclosure_type.contains("audio") {
                "🎵 Audio"
            } else if entry.enclosure_type.contains("video") {
                "🎬 Video"
            } else {
                "📄 File"
            };
            lines.push(format!("📎 Attachment: {} - {}", kind, entry.enclosure_url));

            if entry.enclosure_type.contains("video") && !entry.enclosure_type.contains("audio") {
                video = self.video_part(&entry.enclosure_url, &mut lines).await;
            }
        }

        if !entry.comments_url.is_empty() {
            lines.push(format!("💬 Comments: {}", entry.comments_url));
        }

        let show_images = self.options.read_images && !entry.image_urls.is_empty();
        if show_images {
            lines.push(String::new());
            lines.push(format!("📷 Images ({}):", entry.image_urls.len()));
        }

        let mut main = vec![MessagePart::text(lines.join("\n"))];
        if show_images {
            main.extend(self.image_parts(&entry.image_urls).await);
        }

        Rendered { main, video }
    }

    fn meta_line(&self, entry: &FeedEntry) -> String {
        let mut meta = Vec::new();
        if !entry.author.is_empty() {
            meta.push(format!("👤 {}", entry.author));
        }
        if !entry.categories.is_empty() {
            let shown: Vec<&str> = entry
                .categories
                .iter()
                .take(MAX_CATEGORIES)
                .map(String::as_str)
                .collect();
            meta.push(format!("🏷️ {}", shown.join(", ")));
        }
        if !entry.pub_date.is_empty() && entry.has_timestamp() {
            if let Some(when) = format_timestamp(entry.published, self.options.utc_offset_hours) {
                meta.push(format!("🕒 {}", when));
            }
        }
        meta.join(" | ")
    }

    async fn video_part(&self, url: &str, lines: &mut Vec<String>) -> Option<MessagePart> {
        if !self.options.download_video {
            return Some(MessagePart::Video {
                source: VideoSource::Remote(url.to_string()),
            });
        }
        match self.media.fetch_video(url).await {
            Ok(path) => Some(MessagePart::Video {
                source: VideoSource::Local(path),
            }),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Video download failed");
                lines.push("[❌] Video download failed".to_string());
                None
            }
        }
    }

    async fn image_parts(&self, urls: &[String]) -> Vec<MessagePart> {
        let shown = usize::try_from(self.options.max_images_per_item)
            .map_or(urls.len(), |cap| cap.min(urls.len()));

        let fetched = join_all(urls[..shown].iter().map(|url| self.media.fetch_image(url))).await;

        let mut parts: Vec<MessagePart> = fetched
            .into_iter()
            .zip(&urls[..shown])
            .enumerate()
            .map(|(idx, (result, url))| match result {
                Ok(path) => MessagePart::Image { path },
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Image unavailable");
                    MessagePart::text(format!("\n[❌] Image {} failed to load\n", idx + 1))
                }
            })
            .collect();

        let hidden = urls.len() - shown;
        if hidden > 0 {
            parts.push(MessagePart::text(format!("\n... {} more images not shown", hidden)));
        }
        parts
    }
}

/// `%Y-%m-%d %H:%M` at a fixed offset; out-of-range offsets fall back to UTC.
fn format_timestamp(epoch: i64, offset_hours: i32) -> Option<String> {
    let offset = offset_hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .or_else(|| FixedOffset::east_opt(0))?;
    let when = DateTime::from_timestamp(epoch, 0)?.with_timezone(&offset);
    Some(when.format("%Y-%m-%d %H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaOptions, RetryPolicy};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn renderer(dir: &TempDir, options: RenderOptions) -> Renderer {
        let media = MediaCache::new(
            reqwest::Client::new(),
            MediaOptions {
                dir: dir.path().to_path_buf(),
                retry: RetryPolicy::new(1, Duration::from_millis(1)),
                request_timeout: Duration::from_secs(5),
                adjust_images: false,
            },
        )
        .unwrap();
        Renderer::new(options, Arc::new(media))
    }

    fn entry() -> FeedEntry {
        FeedEntry {
            channel_title: "Example Blog".into(),
            title: "Release notes".into(),
            link: "https://example.com/p/1".into(),
            description: "  What changed this week.  ".into(),
            pub_date: "Wed, 02 Oct 2002 13:00:00 GMT".into(),
            published: 1_033_563_600,
            author: "ada".into(),
            categories: vec!["rust".into(), "release".into(), "news".into(), "extra".into()],
            ..Default::default()
        }
    }

    fn text_of(part: &MessagePart) -> &str {
        match part {
            MessagePart::Text { text } => text,
            other => panic!("expected text part, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_layout() {
        let dir = TempDir::new().unwrap();
        let mut e = entry();
        e.comments_url = "https://example.com/p/1#comments".into();
        let rendered = renderer(&dir, RenderOptions::default()).render(&e).await;

        let sep = "─".repeat(30);
        let expected = [
            "📰 Example Blog",
            sep.as_str(),
            "📌 Release notes",
            "👤 ada | 🏷️ rust, release, news | 🕒 2002-10-02 21:00",
            sep.as_str(),
            "What changed this week.",
            "",
            "🔗 https://example.com/p/1",
            "💬 Comments: https://example.com/p/1#comments",
        ]
        .join("\n");
        assert_eq!(rendered.main, vec![MessagePart::text(expected)]);
        assert_eq!(rendered.video, None);
    }

    #[tokio::test]
    async fn test_hide_url_and_empty_meta() {
        let dir = TempDir::new().unwrap();
        let e = FeedEntry {
            channel_title: "C".into(),
            title: "T".into(),
            link: "https://example.com/x".into(),
            ..Default::default()
        };
        let options = RenderOptions {
            hide_url: true,
            ..Default::default()
        };
        let rendered = renderer(&dir, options).render(&e).await;
        let sep = "─".repeat(30);
        assert_eq!(
            text_of(&rendered.main[0]),
            format!("📰 C\n{}\n📌 T\n{}", sep, sep)
        );
    }

    #[tokio::test]
    async fn test_enclosures() {
        let dir = TempDir::new().unwrap();
        let r = renderer(&dir, RenderOptions::default());

        let mut audio = entry();
        audio.enclosure_url = "https://cdn/ep1.mp3".into();
        audio.enclosure_type = "audio/mpeg".into();
        let rendered = r.render(&audio).await;
        assert!(text_of(&rendered.main[0]).contains("📎 Attachment: 🎵 Audio - https://cdn/ep1.mp3"));
        assert_eq!(rendered.video, None);

        let mut video = entry();
        video.enclosure_url = "https://cdn/clip.mp4".into();
        video.enclosure_type = "video/mp4".into();
        let rendered = r.render(&video).await;
        assert!(text_of(&rendered.main[0]).contains("🎬 Video - https://cdn/clip.mp4"));
        assert_eq!(
            rendered.video,
            Some(MessagePart::Video {
                source: VideoSource::Remote("https://cdn/clip.mp4".into())
            })
        );
    }

    #[tokio::test]
    async fn test_failed_video_download_is_noted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let options = RenderOptions {
            download_video: true,
            ..Default::default()
        };
        let mut e = entry();
        e.enclosure_url = format!("{}/clip.mp4", server.uri());
        e.enclosure_type = "video/mp4".into();

        let rendered = renderer(&dir, options).render(&e).await;
        assert!(text_of(&rendered.main[0]).ends_with("[❌] Video download failed"));
        assert_eq!(rendered.video, None);
    }

    #[tokio::test]
    async fn test_images_capped_with_placeholders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG fake".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let options = RenderOptions {
            max_images_per_item: 2,
            ..Default::default()
        };
        let mut e = entry();
        e.image_urls = vec![
            format!("{}/ok.png", server.uri()),
            format!("{}/gone.png", server.uri()),
            format!("{}/never.png", server.uri()),
        ];

        let rendered = renderer(&dir, options).render(&e).await;
        assert!(text_of(&rendered.main[0]).ends_with("\n\n📷 Images (3):"));
        assert_eq!(rendered.main.len(), 4);
        assert!(matches!(&rendered.main[1], MessagePart::Image { path } if path.exists()));
        assert_eq!(rendered.main[2], MessagePart::text("\n[❌] Image 2 failed to load\n"));
        assert_eq!(rendered.main[3], MessagePart::text("\n... 1 more images not shown"));
    }

    #[tokio::test]
    async fn test_images_skipped_when_disabled() {
        let dir = TempDir::new().unwrap();
        let options = RenderOptions {
            read_images: false,
            ..Default::default()
        };
        let mut e = entry();
        e.image_urls = vec!["https://cdn/a.png".into()];
        let rendered = renderer(&dir, options).render(&e).await;
        assert_eq!(rendered.main.len(), 1);
        assert!(!text_of(&rendered.main[0]).contains("📷"));
    }

    #[test]
    fn test_into_nodes() {
        let rendered = Rendered {
            main: vec![MessagePart::text("a")],
            video: Some(MessagePart::Video {
                source: VideoSource::Remote("v".into()),
            }),
        };
        let nodes = rendered.into_nodes();
        assert_eq!(nodes.len(), 2);
        assert!(matches!(&nodes[1], MessagePart::Node { parts, .. } if parts.len() == 1));
    }

    #[test]
    fn test_format_timestamp_offsets() {
        assert_eq!(format_timestamp(0, 0).as_deref(), Some("1970-01-01 00:00"));
        assert_eq!(format_timestamp(0, -5).as_deref(), Some("1969-12-31 19:00"));
        assert_eq!(format_timestamp(0, 99).as_deref(), Some("1970-01-01 00:00"));
    }
}
