// src/config.rs
use crate::cell::TonAddress;
use crate::correlator::CorrelationMode;
use crate::notifier::TelegramConfig;
use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct Config {
    pub tonapi_url: String,
    pub tonapi_key: Option<String>,
    pub master_address: TonAddress,
    pub db_path: String,
    pub port: u16,
    pub epoch_floor: u64,
    pub page_size: usize,
    pub walk_interval: Duration,
    pub project_interval: Duration,
    pub correlate_interval: Duration,
    pub settle_delay: Duration,
    pub orphan_after: Duration,
    pub evict_after: Duration,
    pub fetch_failure_threshold: u32,
    pub correlation_mode: CorrelationMode,
    pub telegram: Option<TelegramConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("tonapi_url", &self.tonapi_url)
            .field("tonapi_key", &self.tonapi_key.as_ref().map(|_| "<set>"))
            .field("master_address", &self.master_address.to_string())
            .field("db_path", &self.db_path)
            .field("port", &self.port)
            .field("epoch_floor", &self.epoch_floor)
            .field("page_size", &self.page_size)
            .field("walk_interval", &self.walk_interval)
            .field("project_interval", &self.project_interval)
            .field("correlate_interval", &self.correlate_interval)
            .field("settle_delay", &self.settle_delay)
            .field("orphan_after", &self.orphan_after)
            .field("evict_after", &self.evict_after)
            .field("fetch_failure_threshold", &self.fetch_failure_threshold)
            .field("correlation_mode", &self.correlation_mode)
            .field("telegram", &self.telegram.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Reads `.env` and the process environment.
pub fn load() -> Result<Config> {
    dotenv().ok();
    let cfg = from_lookup(|key| std::env::var(key).ok())?;
    info!("Loaded config: {:?}", cfg);
    Ok(cfg)
}

fn parsed_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_millis(parsed_or(lookup, key, default))
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_secs(parsed_or(lookup, key, default))
}

pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let master_address = non_empty("MASTER_ADDRESS")
        .ok_or_else(|| eyre!("MASTER_ADDRESS is not set"))?
        .parse::<TonAddress>()
        .wrap_err("MASTER_ADDRESS")?;

    let correlation_mode = match non_empty("CORRELATION_MODE") {
        Some(raw) => raw.parse()?,
        None => CorrelationMode::Confirmed,
    };

    let telegram = match (
        non_empty("TELEGRAM_BOT_TOKEN"),
        non_empty("SERVICE_CHAT_ID"),
        non_empty("ANOMALY_CHAT_ID"),
    ) {
        (Some(bot_token), Some(service_chat_id), Some(anomaly_chat_id)) => Some(TelegramConfig {
            bot_token,
            service_chat_id,
            anomaly_chat_id,
        }),
        (None, None, None) => None,
        _ => {
            warn!("Telegram needs TELEGRAM_BOT_TOKEN, SERVICE_CHAT_ID and ANOMALY_CHAT_ID; notifications go to the log");
            None
        }
    };

    Ok(Config {
        tonapi_url: non_empty("TONAPI_URL").unwrap_or_else(|| "https://tonapi.io".to_string()),
        tonapi_key: non_empty("TONAPI_KEY"),
        master_address,
        db_path: non_empty("DATABASE_URL").unwrap_or_else(|| "lending.db".to_string()),
        port: parsed_or(&lookup, "PORT", 8080),
        epoch_floor: parsed_or(&lookup, "EPOCH_FLOOR", 1_716_051_631),
        page_size: parsed_or(&lookup, "PAGE_SIZE", MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        walk_interval: millis(&lookup, "WALK_INTERVAL_MS", 2_000),
        project_interval: millis(&lookup, "PROJECT_INTERVAL_MS", 1_000),
        correlate_interval: millis(&lookup, "CORRELATE_INTERVAL_MS", 5_000),
        settle_delay: millis(&lookup, "SETTLE_DELAY_MS", 5_000),
        orphan_after: secs(&lookup, "ORPHAN_AFTER_SECS", 180),
        evict_after: secs(&lookup, "EVICT_AFTER_SECS", 6 * 60 * 60),
        fetch_failure_threshold: parsed_or(&lookup, "FETCH_FAILURE_THRESHOLD", 3u32).max(1),
        correlation_mode,
        telegram,
    })
}
