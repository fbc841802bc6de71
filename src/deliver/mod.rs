//! Outbound messages and the transports that carry them.
//!
//! A rendered entry is a list of [`MessagePart`]s. A [`Delivery`] sends one
//! list to one subscriber and reports rate limiting separately from other
//! failures, because only rate limiting has a mitigation: rotating the
//! attached images and trying once more ([`send_with_rotation`]).

mod render;
mod webhook;

pub use render::{RenderOptions, Rendered, Renderer};
pub use webhook::{LogDelivery, WebhookDelivery};

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::media::MediaCache;

/// Display name attached to forwarded nodes.
pub const NODE_NAME: &str = "feedrelay";

/// Pause between a rate-limited send and its retry.
const ROTATION_RETRY_DELAY: Duration = Duration::from_secs(1);

const ROTATION_NOTICE: &str = "\n(images rotated)";

/// Where a video lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSource {
    Local(PathBuf),
    Remote(String),
}

/// One renderable piece of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    /// Image already cached on local disk.
    Image { path: PathBuf },
    Video { source: VideoSource },
    /// A forwarded-message node wrapping its own parts.
    Node { name: String, parts: Vec<MessagePart> },
    /// Several nodes sent as one grouped message.
    Nodes { nodes: Vec<MessagePart> },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn node(parts: Vec<MessagePart>) -> Self {
        MessagePart::Node {
            name: NODE_NAME.to_string(),
            parts,
        }
    }

    /// Local image paths in this part, including those nested inside nodes.
    fn image_paths(&self) -> Vec<&PathBuf> {
        match self {
            MessagePart::Image { path } => vec![path],
            MessagePart::Node { parts, .. } => parts.iter().flat_map(Self::image_paths).collect(),
            MessagePart::Nodes { nodes } => nodes.iter().flat_map(Self::image_paths).collect(),
            MessagePart::Text { .. } | MessagePart::Video { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The destination throttled or risk-controlled the message.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Sends messages to subscribers.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, target: &str, parts: &[MessagePart]) -> Result<(), DeliveryError>;
}

/// Sends `parts`, retrying once with rotated images when rate limited.
///
/// On [`DeliveryError::RateLimited`] every local image (nodes included) is
/// rotated 180 degrees in the media cache. If at least one image changed,
/// the message is resent once after a short pause with a notice appended.
/// Any other failure, or a second failure, is returned as is.
pub async fn send_with_rotation(
    delivery: &dyn Delivery,
    media: &MediaCache,
    target: &str,
    mut parts: Vec<MessagePart>,
) -> Result<(), DeliveryError> {
    let reason = match delivery.send(target, &parts).await {
        Ok(()) => return Ok(()),
        Err(DeliveryError::RateLimited(reason)) => reason,
        Err(e) => return Err(e),
    };
    tracing::warn!(subscriber = %target, reason = %reason, "Send rate limited, rotating images");

    let mut rotated = 0;
    for path in parts.iter().flat_map(MessagePart::image_paths) {
        if media.rotate(path).await {
            rotated += 1;
        }
    }
    if rotated == 0 {
        return Err(DeliveryError::RateLimited(reason));
    }

    tokio::time::sleep(ROTATION_RETRY_DELAY).await;
    parts.push(MessagePart::text(ROTATION_NOTICE));
    tracing::info!(subscriber = %target, rotated, "Retrying send with rotated images");
    delivery.send(target, &parts).await
}
