// src/broadcast/telegram.rs
//! Telegram Bot API messenger (`sendMessage`, plain text).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Messenger;
use crate::error::DeliveryError;

#[derive(Clone)]
pub struct TelegramMessenger {
    client: Client,
    base: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Option<ApiErrorParams>,
}

#[derive(Deserialize)]
struct ApiErrorParams {
    #[serde(default)]
    retry_after: Option<u64>,
}

impl TelegramMessenger {
    pub fn new(token: &str) -> anyhow::Result<Self> {
        Self::with_base_url("https://api.telegram.org", token)
    }

    pub fn with_base_url(api_root: &str, token: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", api_root.trim_end_matches('/'), token),
        })
    }
}

/// Map a non-2xx reply to a delivery error class.
fn classify_failure(status: StatusCode, body: &ApiError) -> DeliveryError {
    let desc = body.description.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let secs = body
            .parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .unwrap_or(1);
        return DeliveryError::RetryAfter(Duration::from_secs(secs));
    }
    let gone = status == StatusCode::FORBIDDEN
        || desc.contains("chat not found")
        || desc.contains("user is deactivated")
        || desc.contains("bot was blocked");
    if gone {
        DeliveryError::Permanent(format!("{} {}", status.as_u16(), body.description))
    } else {
        DeliveryError::Transient(format!("{} {}", status.as_u16(), body.description))
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, destination: &str, text: &str) -> Result<(), DeliveryError> {
        let payload = SendMessage {
            chat_id: destination,
            text,
            disable_web_page_preview: true,
        };
        let rsp = self
            .client
            .post(format!("{}/sendMessage", self.base))
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {e}")))?;

        let status = rsp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: ApiError = rsp.json().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}
