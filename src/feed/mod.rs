//! Feed ingestion: fetching, parsing and incremental selection.
//!
//! - [`parse_feed`] normalizes RSS 2.0, RSS 1.0 (RDF) and Atom documents
//!   into [`FeedEntry`] records
//! - [`FeedCache`] sits in front of a [`FeedFetcher`] and guarantees at most
//!   one network fetch per source per TTL window
//! - [`select_new`] picks the entries a subscriber has not seen yet, and
//!   [`Watermark::advance`] records what was delivered
//!
//! # Example
//!
//! ```ignore
//! use feedrelay::feed::{select_new, FeedCache, HttpFetcher, Limit, SourceContext};
//!
//! let cache = FeedCache::new(Arc::new(HttpFetcher::new(client)), ttl, options);
//! let entries = cache.get_entries(&SourceContext::new(url)).await;
//! let fresh = select_new(&entries, wm.last_update, &wm.latest_link, Limit::Unbounded);
//! ```

mod cache;
mod date;
mod fetcher;
mod filter;
mod html;
mod parser;
mod types;
mod xml;

pub use cache::FeedCache;
pub use date::{parse_date, parse_date_at};
pub use fetcher::{build_client, read_limited_bytes, FeedFetcher, FetchError, HttpFetcher, MAX_FEED_SIZE};
pub use filter::{select_new, Limit, Watermark};
pub use html::{extract_media, html_to_text, MediaUrls};
pub use parser::{parse_channel_info, parse_entries, parse_feed, EntryError, Flavor, ParseError, ParseOutcome};
pub use types::{ChannelInfo, FeedEntry, ParseOptions, SourceContext};
pub use xml::XmlError;
