//! Persistent subscription table.
//!
//! A single JSON document maps each source URL to its subscribers and
//! channel metadata, next to the list of configured hub endpoints.

mod store;
mod types;

pub use store::Store;
pub use types::{SourceInfo, SourceRecord, StoreData, StoreError, SubscriberState, Subscription};
