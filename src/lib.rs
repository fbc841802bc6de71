//! Scheduled RSS/Atom relay.
//!
//! Feeds are polled per subscriber on cron schedules. New entries are
//! selected against a stored watermark, rendered into message parts with
//! their media resolved to local files, and handed to a delivery transport.

pub mod commands;
pub mod config;
pub mod deliver;
pub mod feed;
pub mod media;
pub mod relay;
pub mod scheduler;
pub mod storage;
pub mod util;

pub use config::Config;
pub use relay::{PollReport, Relay, RelayError};
