// src/notifier.rs
use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Pipeline health: API outages, exhausted retries, evictions
    Service,
    /// Value correctness: amount mismatches, missing logs, orphaned operations
    Anomaly,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: Channel, message: &str) -> Result<()>;
}

/// Fire-and-forget: delivery failures are logged and swallowed.
pub async fn alert(notifier: &dyn Notifier, channel: Channel, message: impl AsRef<str>) {
    let message = message.as_ref();
    warn!("[{:?}] {}", channel, message);
    if let Err(e) = notifier.notify(channel, message).await {
        error!("Failed to deliver {:?} notification: {:#}", channel, e);
    }
}

/// Used when no bot is configured
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: Channel, message: &str) -> Result<()> {
        info!("Telegram not configured, would send to {:?}: {}", channel, message);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub service_chat_id: String,
    pub anomaly_chat_id: String,
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Client,
    api_base: String,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("service_chat_id", &self.config.service_chat_id)
            .field("anomaly_chat_id", &self.config.anomaly_chat_id)
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            config,
            client,
            api_base,
        })
    }

    fn chat_id(&self, channel: Channel) -> &str {
        match channel {
            Channel::Service => &self.config.service_chat_id,
            Channel::Anomaly => &self.config.anomaly_chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, channel: Channel, message: &str) -> Result<()> {
        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": self.chat_id(channel),
                    "text": message,
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!(
                    "Telegram send attempt {}/{} failed: {}",
                    attempt + 1,
                    MAX_RETRIES,
                    resp.status()
                ),
                Err(e) => warn!(
                    "Telegram send attempt {}/{} failed: {:?}",
                    attempt + 1,
                    MAX_RETRIES,
                    e
                ),
            }

            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1))).await;
            }
        }

        Err(eyre!("Telegram message not delivered after {} attempts", MAX_RETRIES))
    }
}
