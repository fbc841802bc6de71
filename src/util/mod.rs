//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **Text processing**: character-aware truncation with boundary detection
//! - **URLs**: rebasing relative feed links and normalizing user input
//!
//! # Examples
//!
//! ```
//! use feedrelay::util::{absolutize, smart_truncate, truncate_chars};
//!
//! let link = absolutize("/p/1", "https://example.com/feed").unwrap();
//! assert_eq!(link, "https://example.com/p/1");
//!
//! let title = truncate_chars("A very long headline", 6);
//! assert_eq!(title, "A very...");
//! ```

mod text;
mod links;

pub use links::{absolutize, is_url_or_ip, normalize_feed_url, resolve_media, root_url, UrlError};
pub use text::{smart_truncate, truncate_chars, ELLIPSIS};
