use std::{env, str::FromStr, time::Duration};

use super::env::{
    AppConfig, ConfigError, DirectoryConfig, GatewayConfig, LoggingConfig, PipelineConfig,
    SchedulerConfig,
};

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api/v1/link-analysis";

pub fn load_config() -> Result<AppConfig, ConfigError> {
    AppConfig::from_env()
}

impl AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;

        let bot_username = non_empty("BOT_USERNAME");
        let admin_user_id = parse_var::<i64>("ADMIN_USER_ID")?;
        let allowed_user_ids = env::var("ALLOWED_USER_IDS")
            .map(|value| parse_id_list(&value))
            .unwrap_or_default();

        let gateway = GatewayConfig {
            base_url: non_empty("ANALYSIS_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            api_token: non_empty("ANALYSIS_API_TOKEN"),
            request_timeout: millis("ANALYSIS_REQUEST_TIMEOUT", 30_000)?,
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            item_delay: millis("BATCH_ITEM_DELAY", defaults.item_delay.as_millis() as u64)?,
            poll_interval: millis("POLL_INTERVAL", defaults.poll_interval.as_millis() as u64)?,
            max_poll_attempts: parse_var::<u32>("MAX_POLL_ATTEMPTS")?
                .unwrap_or(defaults.max_poll_attempts),
        };

        let directories = DirectoryConfig {
            logs_dir: env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            db_filename: env::var("DB_FILENAME").unwrap_or_else(|_| "share_queue.db".to_string()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        let timezone = env::var("BOT_TIMEZONE").unwrap_or_else(|_| "Asia/Seoul".to_string());

        let scheduler = SchedulerConfig {
            batch_cron_specs: env::var("BATCH_CRONS")
                .map(|value| split_specs(&value))
                .unwrap_or_else(|_| vec!["0 */10 * * * *".to_string()]),
            cleanup_cron_specs: env::var("CLEANUP_CRONS")
                .map(|value| split_specs(&value))
                .unwrap_or_else(|_| vec!["0 0 4 * * *".to_string()]),
        };

        Ok(Self {
            telegram_bot_token,
            bot_username,
            admin_user_id,
            allowed_user_ids,
            gateway,
            pipeline,
            directories,
            logging,
            timezone,
            scheduler,
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match non_empty(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

fn millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_var::<u64>(key)?.unwrap_or(default)))
}

fn parse_id_list(value: &str) -> Vec<i64> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

fn split_specs(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
