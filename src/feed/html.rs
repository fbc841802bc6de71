//! HTML handling for entry bodies: plain-text reduction and media discovery.

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::LazyLock;

use crate::util::resolve_media;

static SPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static SPACE_AROUND_NEWLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" *\n *").unwrap());
static BLANK_LINE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());
static VIDEO: LazyLock<Selector> = LazyLock::new(|| Selector::parse("video, iframe").unwrap());
static AUDIO: LazyLock<Selector> = LazyLock::new(|| Selector::parse("audio").unwrap());
static SOURCE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("source").unwrap());

/// Elements whose subtree never contributes text.
const DROPPED_ELEMENTS: [&str; 3] = ["script", "style", "iframe"];

/// Substrings marking an image as a tracker or decoration rather than content.
const IMAGE_NOISE_TOKENS: [&str; 4] = ["tracking", "pixel", "emoji", "icon"];

/// Media references found in a fragment of entry HTML, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaUrls {
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub audios: Vec<String>,
}

/// Reduces HTML to readable plain text.
///
/// `script`/`style`/`iframe` subtrees are removed, `<br>` becomes a newline,
/// paragraphs are separated by a blank line, text runs are joined with single
/// spaces and blank-line runs collapse to one empty line.
///
/// ```
/// use feedrelay::feed::html_to_text;
///
/// let text = html_to_text("<p>First<br>line</p><script>x()</script><p>Second</p>");
/// assert_eq!(text, "First\nline\n\nSecond");
/// ```
pub fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(html);
    let mut raw = String::with_capacity(html.len());
    push_text(fragment.root_element(), &mut raw);

    let text = SPACE_RUNS.replace_all(&raw, " ");
    let text = SPACE_AROUND_NEWLINE.replace_all(&text, "\n");
    let text = BLANK_LINE_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}

fn push_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(el) => {
                let name = el.name();
                if DROPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    push_text(child_el, out);
                }
                if name == "p" {
                    out.push_str("\n\n");
                }
            }
            _ => {}
        }
    }
}

/// Collects image, video and audio URLs referenced by entry HTML.
///
/// `src` is preferred, falling back to lazy-load `data-src`; video and audio
/// elements may carry their URL on a nested `<source>`. Images whose URL
/// contains tracker-like tokens are skipped. Relative references are resolved
/// against `base`.
pub fn extract_media(html: &str, base: &str) -> MediaUrls {
    let mut media = MediaUrls::default();
    if html.trim().is_empty() {
        return media;
    }
    let fragment = Html::parse_fragment(html);

    for img in fragment.select(&IMG) {
        let Some(src) = media_src(img) else { continue };
        let lowered = src.to_lowercase();
        if IMAGE_NOISE_TOKENS.iter().any(|token| lowered.contains(token)) {
            continue;
        }
        if let Some(url) = resolve_media(src, base) {
            push_unique(&mut media.images, url);
        }
    }

    for video in fragment.select(&VIDEO) {
        if let Some(url) = media_src(video).and_then(|src| resolve_media(src, base)) {
            push_unique(&mut media.videos, url);
        }
    }

    for audio in fragment.select(&AUDIO) {
        if let Some(url) = media_src(audio).and_then(|src| resolve_media(src, base)) {
            push_unique(&mut media.audios, url);
        }
    }

    media
}

fn media_src<'a>(element: ElementRef<'a>) -> Option<&'a str> {
    let own = element.value();
    own.attr("src")
        .or_else(|| own.attr("data-src"))
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            element
                .select(&SOURCE)
                .find_map(|source| source.value().attr("src"))
        })
}

fn push_unique(list: &mut Vec<String>, url: String) {
    if !list.contains(&url) {
        list.push(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://blog.example.com/posts/1";

    #[test]
    fn test_html_to_text_drops_scripts_styles_iframes() {
        let html = r#"<div>Keep<script>alert(1)</script><style>p{}</style><iframe src="x">fallback</iframe> this</div>"#;
        assert_eq!(html_to_text(html), "Keep this");
    }

    #[test]
    fn test_html_to_text_paragraphs_and_breaks() {
        let html = "<p>One</p><p>Two<br/>Three</p>\n\n\n<p>Four</p>";
        assert_eq!(html_to_text(html), "One\n\nTwo\nThree\n\nFour");
    }

    #[test]
    fn test_html_to_text_collapses_whitespace_and_decodes_entities() {
        let html = "<span>a&nbsp;&nbsp;&amp;</span>   <b>b</b>";
        assert_eq!(html_to_text(html), "a & b");
    }

    #[test]
    fn test_html_to_text_plain_input() {
        assert_eq!(html_to_text("just words"), "just words");
        assert_eq!(html_to_text("   "), "");
    }

    #[test]
    fn test_extract_images_with_lazy_load_and_filters() {
        let html = r#"
            <img src="https://cdn.example.com/a.jpg">
            <img data-src="/img/b.png">
            <img src="https://t.example.com/tracking.gif">
            <img src="https://x.example.com/pixel.png">
            <img src="https://cdn.example.com/icons/star.svg">
            <img src="https://cdn.example.com/a.jpg">
        "#;
        let media = extract_media(html, BASE);
        assert_eq!(
            media.images,
            vec![
                "https://cdn.example.com/a.jpg".to_string(),
                "https://blog.example.com/img/b.png".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_video_iframe_and_audio_sources() {
        let html = r#"
            <video><source src="https://v.example.com/clip.mp4" type="video/mp4"></video>
            <iframe src="https://player.example.com/embed/9"></iframe>
            <audio src="https://a.example.com/ep.mp3"></audio>
        "#;
        let media = extract_media(html, BASE);
        assert_eq!(
            media.videos,
            vec![
                "https://v.example.com/clip.mp4".to_string(),
                "https://player.example.com/embed/9".to_string(),
            ]
        );
        assert_eq!(media.audios, vec!["https://a.example.com/ep.mp3".to_string()]);
    }

    #[test]
    fn test_extract_media_empty() {
        assert_eq!(extract_media("", BASE), MediaUrls::default());
        assert_eq!(extract_media("<p>no media</p>", BASE), MediaUrls::default());
    }
}
