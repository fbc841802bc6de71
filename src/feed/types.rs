use crate::util::ELLIPSIS;

/// One syndicated item, normalized across RSS and Atom.
///
/// Built once by the parser and never mutated afterwards; caches and filters
/// hand out shared references or clones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub channel_title: String,
    /// Entry title, already capped to the configured length.
    pub title: String,
    /// Absolute URL or empty. Relative feed links are rebased onto the source root.
    pub link: String,
    /// Plain-text description, boundary-aware truncated.
    pub description: String,
    /// Publish date exactly as it appeared in the feed.
    pub pub_date: String,
    /// Publish time in epoch seconds, `0` when the feed gave none.
    pub published: i64,
    pub image_urls: Vec<String>,
    pub author: String,
    pub categories: Vec<String>,
    /// Full plain-text body (from `content:encoded` / Atom `content`).
    pub content: String,
    pub summary: String,
    pub enclosure_url: String,
    pub enclosure_type: String,
    pub comments_url: String,
    pub guid: String,
}

impl FeedEntry {
    /// Text to show for this entry: full content, else description, else summary,
    /// hard-cut to `max_chars` with an ellipsis.
    pub fn display_content(&self, max_chars: usize) -> String {
        let body = [&self.content, &self.description, &self.summary]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("");
        match body.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}{}", &body[..idx], ELLIPSIS),
            None => body.to_string(),
        }
    }

    pub fn has_timestamp(&self) -> bool {
        self.published > 0
    }
}

/// Channel-level metadata shown when subscribing and listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub title: String,
    pub description: String,
}

/// Where a document came from, used for link rebasing and channel naming.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub url: String,
    /// Stored channel title; overrides the title found in the document.
    pub channel_title: Option<String>,
}

impl SourceContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel_title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.channel_title = Some(title.into());
        self
    }
}

/// Length limits applied while normalizing entries.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub title_max_length: usize,
    pub description_max_length: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            title_max_length: 30,
            description_max_length: 500,
        }
    }
}
