use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{Delivery, DeliveryError, MessagePart};

#[derive(Serialize)]
struct Payload<'a> {
    target: &'a str,
    parts: &'a [MessagePart],
}

/// Posts each message as JSON to a bridge that forwards it to the chat platform.
///
/// `429 Too Many Requests` is reported as [`DeliveryError::RateLimited`];
/// every other non-2xx status and transport error is a plain failure.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl WebhookDelivery {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn send(&self, target: &str, parts: &[MessagePart]) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&Payload { target, parts })
            .map_err(|e| DeliveryError::Failed(format!("Cannot encode message: {}", e)))?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                tracing::debug!(subscriber = %target, parts = parts.len(), "Message delivered");
                Ok(())
            }
            StatusCode::TOO_MANY_REQUESTS => Err(DeliveryError::RateLimited(format!(
                "HTTP {}",
                StatusCode::TOO_MANY_REQUESTS.as_u16()
            ))),
            status => Err(DeliveryError::Failed(format!("HTTP {}", status.as_u16()))),
        }
    }
}

/// Writes messages to the log instead of sending them. Used when no webhook
/// is configured.
#[derive(Debug, Default)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn send(&self, target: &str, parts: &[MessagePart]) -> Result<(), DeliveryError> {
        for part in parts {
            match part {
                MessagePart::Text { text } => tracing::info!(subscriber = %target, "{}", text),
                other => tracing::info!(subscriber = %target, part = ?other, "Message part"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_payload_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("Authorization", "Bearer s3cret"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(serde_json::json!({
                "target": "qq:group:1",
                "parts": [{"type": "text", "text": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let delivery = WebhookDelivery::new(
            reqwest::Client::new(),
            format!("{}/send", server.uri()),
            Some(SecretString::from("s3cret")),
        );
        delivery
            .send("qq:group:1", &[MessagePart::text("hello")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let limited = WebhookDelivery::new(client.clone(), format!("{}/limited", server.uri()), None);
        let broken = WebhookDelivery::new(client, format!("{}/broken", server.uri()), None);

        assert!(matches!(
            limited.send("u", &[]).await,
            Err(DeliveryError::RateLimited(_))
        ));
        assert!(matches!(
            broken.send("u", &[]).await,
            Err(DeliveryError::Failed(msg)) if msg.contains("502")
        ));
    }

    #[tokio::test]
    async fn test_log_delivery_always_succeeds() {
        let parts = [MessagePart::text("a"), MessagePart::Image { path: "/x.png".into() }];
        assert!(LogDelivery.send("u", &parts).await.is_ok());
    }
}
