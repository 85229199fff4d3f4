use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telegram_bot_token: String,
    pub bot_username: Option<String>,
    pub admin_user_id: Option<i64>,
    pub allowed_user_ids: Vec<i64>,
    pub gateway: GatewayConfig,
    pub pipeline: PipelineConfig,
    pub directories: DirectoryConfig,
    pub logging: LoggingConfig,
    pub timezone: String,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Zone used for user-facing timestamps. An unknown `BOT_TIMEZONE` falls back to Seoul.
    pub fn display_timezone(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Asia::Seoul)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

/// Pacing of batch processing and analysis polling.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub item_delay: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            item_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub logs_dir: String,
    pub data_dir: String,
    pub db_filename: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_cron_specs: Vec<String>,
    pub cleanup_cron_specs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
