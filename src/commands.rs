//! Subscription management commands with plain-text replies.
//!
//! Indices shown by `hub list` and `list` are the ones `hub remove`,
//! `add`, `remove` and `get` accept. Subscription indices are per subscriber,
//! in store order.

use std::sync::Arc;
use thiserror::Error;

use crate::relay::{Relay, RelayError};
use crate::storage::StoreError;
use crate::util::{is_url_or_ip, normalize_feed_url};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HubAdd { url: String },
    HubList,
    HubRemove { index: usize },
    /// Subscribe to `hub + route`.
    Add { hub: usize, route: String, cron: String },
    AddUrl { url: String, cron: String },
    List,
    Remove { index: usize },
    /// Deliver the newest entry of a subscription right now.
    Get { index: usize },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Please enter a valid URL or IPv4 address")]
    InvalidHubUrl,

    #[error("This hub endpoint already exists")]
    DuplicateHub,

    #[error("Hub index {index} out of range, use `hub list` to see configured endpoints")]
    HubIndex { index: usize },

    #[error("Route must start with /")]
    RouteWithoutSlash,

    #[error("Index {index} out of range, use `list` to see your subscriptions")]
    SubscriptionIndex { index: usize },

    #[error("Cannot read this feed, check that the URL is correct: {0}")]
    Unreachable(String),

    #[error("The feed has no entries, check that the URL is correct")]
    EmptyFeed,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        CommandError::Relay(RelayError::Store(e))
    }
}

/// Runs `command` on behalf of `subscriber`, rendering failures as text.
pub async fn reply(relay: &Arc<Relay>, subscriber: &str, command: Command) -> String {
    match execute(relay, subscriber, command).await {
        Ok(text) => text,
        Err(e) => {
            tracing::info!(subscriber = %subscriber, error = %e, "Command failed");
            e.to_string()
        }
    }
}

pub async fn execute(relay: &Arc<Relay>, subscriber: &str, command: Command) -> Result<String, CommandError> {
    match command {
        Command::HubAdd { url } => {
            let url = url.strip_suffix('/').unwrap_or(&url);
            if !is_url_or_ip(url) {
                return Err(CommandError::InvalidHubUrl);
            }
            match relay.store().await.add_hub(url) {
                Ok(()) => Ok("Hub endpoint added".to_string()),
                Err(StoreError::DuplicateHub(_)) => Err(CommandError::DuplicateHub),
                Err(e) => Err(e.into()),
            }
        }

        Command::HubList => {
            let store = relay.store().await;
            let lines: Vec<String> = store
                .hubs()
                .iter()
                .enumerate()
                .map(|(i, hub)| format!("{}: {}", i, hub))
                .collect();
            Ok(format!("Configured hub endpoints:\n{}", lines.join("\n")))
        }

        Command::HubRemove { index } => match relay.store().await.remove_hub(index) {
            Ok(removed) => Ok(format!("Removed hub endpoint {}", removed)),
            Err(StoreError::IndexOutOfRange { .. }) => Err(CommandError::HubIndex { index }),
            Err(e) => Err(e.into()),
        },

        Command::Add { hub, route, cron } => {
            let endpoint = relay
                .store()
                .await
                .hub(hub)
                .map(str::to_string)
                .map_err(|_| CommandError::HubIndex { index: hub })?;
            if !route.starts_with('/') {
                return Err(CommandError::RouteWithoutSlash);
            }
            subscribe(relay, &format!("{}{}", endpoint, route), subscriber, &cron).await
        }

        Command::AddUrl { url, cron } => {
            subscribe(relay, &normalize_feed_url(&url), subscriber, &cron).await
        }

        Command::List => {
            let store = relay.store().await;
            let mut text = String::from("Subscribed channels:\n");
            for (i, source) in store.sources_of(subscriber).into_iter().enumerate() {
                let info = store.source(source).map(|r| r.info.clone()).unwrap_or_default();
                text.push_str(&format!("{}. {} - {}\n", i, info.title, info.description));
            }
            Ok(text)
        }

        Command::Remove { index } => {
            let source = subscription_at(relay, subscriber, index).await?;
            relay.unsubscribe(&source, subscriber).await?;
            Ok(format!("Unsubscribed from {}", source))
        }

        Command::Get { index } => {
            let source = subscription_at(relay, subscriber, index).await?;
            if relay.deliver_latest(&source, subscriber).await? {
                Ok("Latest entry delivered".to_string())
            } else {
                Ok("No content available".to_string())
            }
        }
    }
}

async fn subscribe(
    relay: &Arc<Relay>,
    source: &str,
    subscriber: &str,
    cron: &str,
) -> Result<String, CommandError> {
    match relay.subscribe(source, subscriber, cron).await {
        Ok(info) => Ok(format!(
            "Added. Channel:\nTitle: {}\nDescription: {}",
            info.title, info.description
        )),
        Err(RelayError::Fetch(e)) => Err(CommandError::Unreachable(e.to_string())),
        Err(RelayError::Parse(e)) => Err(CommandError::Unreachable(e.to_string())),
        Err(RelayError::NoEntries(_)) => Err(CommandError::EmptyFeed),
        Err(e) => Err(e.into()),
    }
}

async fn subscription_at(relay: &Relay, subscriber: &str, index: usize) -> Result<String, CommandError> {
    relay
        .store()
        .await
        .sources_of(subscriber)
        .get(index)
        .map(|s| s.to_string())
        .ok_or(CommandError::SubscriptionIndex { index })
}
