//! Configuration module
//!
//! Process-wide settings for the worker binary, loaded from the environment
//! (and an optional `.env` file). Component configs in the worker crate are
//! derived from this struct.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::models::OutputFormat;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub log_format: LogFormat,
    // Worker runtime
    pub worker_poll_interval_ms: u64,
    pub worker_receive_batch: usize,
    pub worker_max_concurrent_batches: usize,
    pub worker_queue_lease_secs: u64,
    // Batch accumulation
    pub batch_thumbnail_size: usize,
    pub batch_cache_size: usize,
    pub batch_queue_capacity: usize,
    pub batch_flush_interval_ms: u64,
    pub batch_unhealthy_lag: usize,
    pub batch_unhealthy_error_rate: f64,
    // Batch processing
    pub memory_budget_bytes: u64,
    pub max_plain_file_bytes: u64,
    pub max_archive_entry_bytes: u64,
    pub visibility_retry_attempts: u32,
    pub visibility_retry_delay_ms: u64,
    pub failure_alert_every: i64,
    // Stale job recovery
    pub recovery_interval_secs: u64,
    pub stale_job_timeout_secs: u64,
    pub stale_job_fail_multiplier: f64,
    // Default artifact settings, used when no settings row exists
    pub default_output_format: OutputFormat,
    pub default_thumbnail_quality: u8,
    pub default_cache_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_max_connections: 10,
            log_format: LogFormat::Text,
            worker_poll_interval_ms: 500,
            worker_receive_batch: 200,
            worker_max_concurrent_batches: 4,
            worker_queue_lease_secs: 300,
            batch_thumbnail_size: DEFAULT_THUMBNAIL_BATCH_SIZE,
            batch_cache_size: DEFAULT_CACHE_BATCH_SIZE,
            batch_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            batch_unhealthy_lag: 8,
            batch_unhealthy_error_rate: 0.25,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            max_plain_file_bytes: MAX_PLAIN_FILE_BYTES,
            max_archive_entry_bytes: MAX_ARCHIVE_ENTRY_BYTES,
            visibility_retry_attempts: VISIBILITY_RETRY_ATTEMPTS,
            visibility_retry_delay_ms: VISIBILITY_RETRY_DELAY.as_millis() as u64,
            failure_alert_every: FAILURE_ALERT_EVERY,
            recovery_interval_secs: DEFAULT_RECOVERY_INTERVAL.as_secs(),
            stale_job_timeout_secs: DEFAULT_STALE_JOB_TIMEOUT.as_secs(),
            stale_job_fail_multiplier: STALE_JOB_FAIL_MULTIPLIER,
            default_output_format: OutputFormat::Jpeg,
            default_thumbnail_quality: DEFAULT_THUMBNAIL_QUALITY,
            default_cache_quality: DEFAULT_CACHE_QUALITY,
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => raw.parse::<LogFormat>()?,
            Err(_) => defaults.log_format,
        };

        let default_output_format = match env::var("DEFAULT_OUTPUT_FORMAT") {
            Ok(raw) => raw.parse::<OutputFormat>()?,
            Err(_) => defaults.default_output_format,
        };

        let config = Config {
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            log_format,
            worker_poll_interval_ms: env_or(
                "WORKER_POLL_INTERVAL_MS",
                defaults.worker_poll_interval_ms,
            ),
            worker_receive_batch: env_or("WORKER_RECEIVE_BATCH", defaults.worker_receive_batch),
            worker_max_concurrent_batches: env_or(
                "WORKER_MAX_CONCURRENT_BATCHES",
                defaults.worker_max_concurrent_batches,
            ),
            worker_queue_lease_secs: env_or(
                "WORKER_QUEUE_LEASE_SECS",
                defaults.worker_queue_lease_secs,
            ),
            batch_thumbnail_size: env_or("BATCH_THUMBNAIL_SIZE", defaults.batch_thumbnail_size),
            batch_cache_size: env_or("BATCH_CACHE_SIZE", defaults.batch_cache_size),
            batch_queue_capacity: env_or("BATCH_QUEUE_CAPACITY", defaults.batch_queue_capacity),
            batch_flush_interval_ms: env_or(
                "BATCH_FLUSH_INTERVAL_MS",
                defaults.batch_flush_interval_ms,
            ),
            batch_unhealthy_lag: env_or("BATCH_UNHEALTHY_LAG", defaults.batch_unhealthy_lag),
            batch_unhealthy_error_rate: env_or(
                "BATCH_UNHEALTHY_ERROR_RATE",
                defaults.batch_unhealthy_error_rate,
            ),
            memory_budget_bytes: env_or("MEMORY_BUDGET_BYTES", defaults.memory_budget_bytes),
            max_plain_file_bytes: env_or("MAX_PLAIN_FILE_BYTES", defaults.max_plain_file_bytes),
            max_archive_entry_bytes: env_or(
                "MAX_ARCHIVE_ENTRY_BYTES",
                defaults.max_archive_entry_bytes,
            ),
            visibility_retry_attempts: env_or(
                "VISIBILITY_RETRY_ATTEMPTS",
                defaults.visibility_retry_attempts,
            ),
            visibility_retry_delay_ms: env_or(
                "VISIBILITY_RETRY_DELAY_MS",
                defaults.visibility_retry_delay_ms,
            ),
            failure_alert_every: env_or("FAILURE_ALERT_EVERY", defaults.failure_alert_every),
            recovery_interval_secs: env_or(
                "RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval_secs,
            ),
            stale_job_timeout_secs: env_or(
                "STALE_JOB_TIMEOUT_SECS",
                defaults.stale_job_timeout_secs,
            ),
            stale_job_fail_multiplier: env_or(
                "STALE_JOB_FAIL_MULTIPLIER",
                defaults.stale_job_fail_multiplier,
            ),
            default_output_format,
            default_thumbnail_quality: env_or(
                "DEFAULT_THUMBNAIL_QUALITY",
                defaults.default_thumbnail_quality,
            ),
            default_cache_quality: env_or("DEFAULT_CACHE_QUALITY", defaults.default_cache_quality),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.is_empty()
            && !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.batch_thumbnail_size == 0 || self.batch_cache_size == 0 {
            return Err(anyhow::anyhow!("Batch sizes must be greater than zero"));
        }

        if self.batch_thumbnail_size > self.batch_queue_capacity
            || self.batch_cache_size > self.batch_queue_capacity
        {
            return Err(anyhow::anyhow!(
                "BATCH_QUEUE_CAPACITY ({}) must be at least as large as the batch sizes",
                self.batch_queue_capacity
            ));
        }

        if self.worker_max_concurrent_batches == 0 {
            return Err(anyhow::anyhow!(
                "WORKER_MAX_CONCURRENT_BATCHES must be greater than zero"
            ));
        }

        if self.visibility_retry_attempts == 0 {
            return Err(anyhow::anyhow!(
                "VISIBILITY_RETRY_ATTEMPTS must be at least 1"
            ));
        }

        if self.failure_alert_every <= 0 {
            return Err(anyhow::anyhow!("FAILURE_ALERT_EVERY must be positive"));
        }

        if self.stale_job_fail_multiplier <= 1.0 {
            return Err(anyhow::anyhow!(
                "STALE_JOB_FAIL_MULTIPLIER must be greater than 1.0"
            ));
        }

        if !(0.0..=1.0).contains(&self.batch_unhealthy_error_rate) {
            return Err(anyhow::anyhow!(
                "BATCH_UNHEALTHY_ERROR_RATE must be between 0 and 1"
            ));
        }

        for (name, quality) in [
            ("DEFAULT_THUMBNAIL_QUALITY", self.default_thumbnail_quality),
            ("DEFAULT_CACHE_QUALITY", self.default_cache_quality),
        ] {
            if quality == 0 || quality > 100 {
                return Err(anyhow::anyhow!("{} must be between 1 and 100", name));
            }
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn visibility_retry_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_retry_delay_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_job_timeout_secs)
    }
}
