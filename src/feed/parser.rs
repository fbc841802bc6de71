use sha2::{Digest, Sha256};
use thiserror::Error;

use super::date::parse_date;
use super::html::{extract_media, html_to_text};
use super::types::{ChannelInfo, FeedEntry, ParseOptions, SourceContext};
use super::xml::{parse_document, XmlElement, XmlError};
use crate::util::{absolutize, smart_truncate, truncate_chars, UrlError};

const UNKNOWN_CHANNEL: &str = "Unknown channel";
const NO_DESCRIPTION: &str = "No description";
const UNTITLED: &str = "Untitled";
/// Assumed type when an embedded player URL is promoted to the enclosure.
const PROMOTED_VIDEO_TYPE: &str = "video/mp4";

/// Document-level failure: the whole document yields no entries.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("Root element <{0}> is not an RSS or Atom feed")]
    NotAFeed(String),
}

/// Entry-level failure: only the offending entry is dropped.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("Link cannot be made absolute: {0}")]
    Link(#[from] UrlError),

    #[error("Entry has no title, link or content")]
    Empty,
}

/// Entries parsed from one document plus the count of entries skipped as malformed.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub entries: Vec<FeedEntry>,
    pub skipped: usize,
}

/// Feed dialect, resolved once per document from its root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Rss,
    Atom,
}

impl Flavor {
    fn detect(root: &XmlElement) -> Result<Self, ParseError> {
        let atom_namespace = root
            .namespace
            .as_deref()
            .is_some_and(|ns| ns.to_ascii_lowercase().contains("atom"));
        if root.is("feed") || atom_namespace {
            Ok(Flavor::Atom)
        } else if root.is("rss") || root.is("rdf") {
            Ok(Flavor::Rss)
        } else {
            Err(ParseError::NotAFeed(root.name.clone()))
        }
    }

    fn fields(self) -> &'static FieldTable {
        match self {
            Flavor::Rss => &RSS_FIELDS,
            Flavor::Atom => &ATOM_FIELDS,
        }
    }
}

/// Where a field value lives relative to the entry element.
enum Field {
    /// Text of the first non-empty element at this child path.
    Text(&'static [&'static str]),
    /// Attribute of the first element at this child path carrying it.
    Attr(&'static [&'static str], &'static str),
    /// Attribute of the first `link` child with this `rel` (no `rel` means "alternate").
    LinkRel(&'static str, &'static str),
}

impl Field {
    fn first(&self, entry: &XmlElement) -> Option<String> {
        self.all(entry).into_iter().next()
    }

    fn all(&self, entry: &XmlElement) -> Vec<String> {
        let values: Vec<String> = match self {
            Field::Text(path) => candidates(entry, path)
                .map(|el| el.text().to_string())
                .collect(),
            Field::Attr(path, attr) => candidates(entry, path)
                .filter_map(|el| el.attr(attr).map(|v| v.trim().to_string()))
                .collect(),
            Field::LinkRel(rel, attr) => entry
                .children_named("link")
                .filter(|link| link.attr("rel").unwrap_or("alternate").eq_ignore_ascii_case(rel))
                .filter_map(|link| link.attr(attr).map(|v| v.trim().to_string()))
                .collect(),
        };
        values.into_iter().filter(|v| !v.is_empty()).collect()
    }
}

/// Elements at `path` below `entry`: all siblings named by the last segment.
fn candidates<'a>(
    entry: &'a XmlElement,
    path: &'static [&'static str],
) -> impl Iterator<Item = &'a XmlElement> + 'a {
    let (last, parents): (&'static str, &'static [&'static str]) = match path.split_last() {
        Some((last, parents)) => (*last, parents),
        None => ("", &[]),
    };
    entry
        .path(parents)
        .into_iter()
        .flat_map(move |parent| parent.children_named(last))
}

fn first_of(fields: &[Field], entry: &XmlElement) -> Option<String> {
    fields.iter().find_map(|f| f.first(entry))
}

/// Per-dialect extraction rules; each list is a fallback chain.
struct FieldTable {
    entry: &'static str,
    title: &'static [Field],
    link: &'static [Field],
    content: &'static [Field],
    description: &'static [Field],
    summary: &'static [Field],
    author: &'static [Field],
    category: Field,
    enclosure_url: &'static [Field],
    enclosure_type: &'static [Field],
    comments: &'static [Field],
    guid: &'static [Field],
    date: &'static [Field],
    channel_title: &'static [Field],
    channel_description: &'static [Field],
}

const RSS_FIELDS: FieldTable = FieldTable {
    entry: "item",
    title: &[Field::Text(&["title"])],
    link: &[Field::Text(&["link"]), Field::Attr(&["link"], "href")],
    content: &[Field::Text(&["encoded"])],
    description: &[Field::Text(&["description"])],
    summary: &[],
    author: &[Field::Text(&["author"]), Field::Text(&["creator"])],
    category: Field::Text(&["category"]),
    enclosure_url: &[Field::Attr(&["enclosure"], "url")],
    enclosure_type: &[Field::Attr(&["enclosure"], "type")],
    comments: &[Field::Text(&["comments"])],
    guid: &[Field::Text(&["guid"])],
    date: &[Field::Text(&["pubDate"]), Field::Text(&["date"])],
    channel_title: &[Field::Text(&["channel", "title"]), Field::Text(&["title"])],
    channel_description: &[
        Field::Text(&["channel", "description"]),
        Field::Text(&["description"]),
    ],
};

const ATOM_FIELDS: FieldTable = FieldTable {
    entry: "entry",
    title: &[Field::Text(&["title"])],
    link: &[Field::LinkRel("alternate", "href"), Field::Attr(&["link"], "href")],
    content: &[Field::Text(&["content"])],
    description: &[],
    summary: &[Field::Text(&["summary"])],
    author: &[Field::Text(&["author", "name"]), Field::Text(&["creator"])],
    category: Field::Attr(&["category"], "term"),
    enclosure_url: &[Field::LinkRel("enclosure", "href"), Field::Attr(&["enclosure"], "url")],
    enclosure_type: &[Field::LinkRel("enclosure", "type"), Field::Attr(&["enclosure"], "type")],
    comments: &[Field::Text(&["comments"])],
    guid: &[Field::Text(&["id"])],
    date: &[
        Field::Text(&["updated"]),
        Field::Text(&["published"]),
        Field::Text(&["modified"]),
        Field::Text(&["issued"]),
    ],
    channel_title: &[Field::Text(&["title"])],
    channel_description: &[Field::Text(&["subtitle"]), Field::Text(&["tagline"])],
};

/// Parses a feed document, skipping malformed entries.
///
/// Returns an error only when the document itself is unusable (invalid XML,
/// not a feed). Entries that fail normalization are logged and counted in
/// [`ParseOutcome::skipped`].
pub fn parse_feed(
    bytes: &[u8],
    ctx: &SourceContext,
    opts: &ParseOptions,
) -> Result<ParseOutcome, ParseError> {
    let root = parse_document(bytes)?;
    let flavor = Flavor::detect(&root)?;
    let fields = flavor.fields();

    let channel_title = ctx
        .channel_title
        .clone()
        .or_else(|| first_of(fields.channel_title, &root))
        .unwrap_or_else(|| UNKNOWN_CHANNEL.to_string());

    let mut outcome = ParseOutcome::default();
    for node in root.descendants_named(fields.entry) {
        match parse_entry(node, fields, &channel_title, ctx, opts) {
            Ok(entry) => outcome.entries.push(entry),
            Err(e) => {
                tracing::warn!(source = %ctx.url, error = %e, "Skipping malformed feed entry");
                outcome.skipped += 1;
            }
        }
    }

    tracing::debug!(
        source = %ctx.url,
        flavor = ?flavor,
        entries = outcome.entries.len(),
        skipped = outcome.skipped,
        "Parsed feed document"
    );
    Ok(outcome)
}

/// Infallible form of [`parse_feed`]: an unusable document yields no entries.
pub fn parse_entries(bytes: &[u8], ctx: &SourceContext, opts: &ParseOptions) -> Vec<FeedEntry> {
    match parse_feed(bytes, ctx, opts) {
        Ok(outcome) => outcome.entries,
        Err(e) => {
            tracing::error!(source = %ctx.url, error = %e, "Feed document could not be parsed");
            Vec::new()
        }
    }
}

/// Reads the channel title and description from a feed document.
pub fn parse_channel_info(bytes: &[u8]) -> Result<ChannelInfo, ParseError> {
    let root = parse_document(bytes)?;
    let fields = Flavor::detect(&root)?.fields();
    Ok(ChannelInfo {
        title: first_of(fields.channel_title, &root).unwrap_or_else(|| UNKNOWN_CHANNEL.to_string()),
        description: first_of(fields.channel_description, &root)
            .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
    })
}

fn parse_entry(
    node: &XmlElement,
    fields: &FieldTable,
    channel_title: &str,
    ctx: &SourceContext,
    opts: &ParseOptions,
) -> Result<FeedEntry, EntryError> {
    let raw_title = first_of(fields.title, node);
    let link = absolutize(&first_of(fields.link, node).unwrap_or_default(), &ctx.url)?;

    let content_html = first_of(fields.content, node).unwrap_or_default();
    let summary_html = first_of(fields.summary, node).unwrap_or_default();
    let description_html = first_of(fields.description, node)
        .or_else(|| [&content_html, &summary_html].into_iter().find(|s| !s.is_empty()).cloned())
        .unwrap_or_default();

    if raw_title.is_none() && link.is_empty() && description_html.is_empty() {
        return Err(EntryError::Empty);
    }

    let body_html = if content_html.is_empty() {
        &description_html
    } else {
        &content_html
    };
    let media_base = if link.is_empty() { ctx.url.as_str() } else { link.as_str() };
    let media = extract_media(body_html, media_base);

    let (enclosure_url, enclosure_type) = match first_of(fields.enclosure_url, node) {
        Some(url) => (url, first_of(fields.enclosure_type, node).unwrap_or_default()),
        None => match media.videos.first() {
            Some(video) => (video.clone(), PROMOTED_VIDEO_TYPE.to_string()),
            None => (String::new(), String::new()),
        },
    };

    let description = html_to_text(&description_html);
    let description = smart_truncate(&description, opts.description_max_length).into_owned();

    let pub_date = first_of(fields.date, node).unwrap_or_default();
    let published = if pub_date.is_empty() { 0 } else { parse_date(&pub_date) };

    let title = raw_title.unwrap_or_else(|| UNTITLED.to_string());
    let guid = first_of(fields.guid, node)
        .unwrap_or_else(|| generate_guid(&link, &title, published));

    Ok(FeedEntry {
        channel_title: channel_title.to_string(),
        title: truncate_chars(&title, opts.title_max_length).into_owned(),
        link,
        description,
        pub_date,
        published,
        image_urls: media.images,
        author: first_of(fields.author, node).unwrap_or_default(),
        categories: fields.category.all(node),
        content: html_to_text(&content_html),
        summary: html_to_text(&summary_html),
        enclosure_url,
        enclosure_type,
        comments_url: first_of(fields.comments, node).unwrap_or_default(),
        guid,
    })
}

/// Stable identifier for entries that carry no GUID of their own.
fn generate_guid(link: &str, title: &str, published: i64) -> String {
    let input = format!("{}|{}|{}", link, title, published);
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
