use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::info;

use crate::utils::cron_helper;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long shutdown waits for in-flight extractions
    #[serde(default = "default_shutdown_grace", with = "duration")]
    pub shutdown_grace: Duration,
}

/// Which [`QueueStore`](crate::store::QueueStore) implementation to run against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local state, lost on restart. Development only.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Hash holding persisted trigger definitions
    #[serde(default = "default_trigger_key")]
    pub trigger_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
    /// Failed attempts tolerated before a task is recorded as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_depth")]
    pub default_depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_base_url")]
    pub base_url: String,
    #[serde(default = "default_extraction_timeout", with = "duration")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Lifetime of completed and failed records
    #[serde(default = "default_retention_max_age", with = "duration")]
    pub max_age: Duration,
    #[serde(default = "default_sweep_schedule")]
    pub sweep_schedule: String,
}

fn parse_default_duration(value: &str) -> Duration {
    humantime::parse_duration(value).unwrap_or_default()
}

// Web defaults
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_shutdown_grace() -> Duration {
    parse_default_duration(DEFAULT_SHUTDOWN_GRACE)
}

// Store defaults
fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

fn default_trigger_key() -> String {
    DEFAULT_TRIGGER_KEY.to_string()
}

// Queue defaults
fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_poll_interval() -> Duration {
    parse_default_duration(DEFAULT_POLL_INTERVAL)
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_depth() -> u32 {
    DEFAULT_DEPTH
}

// Extraction defaults
fn default_extraction_base_url() -> String {
    DEFAULT_EXTRACTION_BASE_URL.to_string()
}

fn default_extraction_timeout() -> Duration {
    parse_default_duration(DEFAULT_EXTRACTION_TIMEOUT)
}

// Retention defaults
fn default_retention_max_age() -> Duration {
    parse_default_duration(DEFAULT_RETENTION_MAX_AGE)
}

fn default_sweep_schedule() -> String {
    DEFAULT_SWEEP_SCHEDULE.to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            trigger_key: default_trigger_key(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_concurrent: default_max_concurrent(),
            poll_interval: default_poll_interval(),
            max_retries: default_max_retries(),
            default_depth: default_depth(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            base_url: default_extraction_base_url(),
            timeout: default_extraction_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: default_retention_max_age(),
            sweep_schedule: default_sweep_schedule(),
        }
    }
}

impl Config {
    /// Load `config_file`, writing it with defaults first if it does not exist,
    /// then apply `SPIDERBOT_*` environment overrides
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !Path::new(config_file).exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            std::fs::write(config_file, contents)
                .with_context(|| format!("Failed to write default config to {config_file}"))?;
            info!("Created default config file: {}", config_file);
        }

        let config: Config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {config_file}"))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.name.trim().is_empty() {
            anyhow::bail!("queue.name must not be empty");
        }
        if self.queue.max_concurrent == 0 {
            anyhow::bail!("queue.max_concurrent must be at least 1");
        }
        if self.queue.poll_interval.is_zero() {
            anyhow::bail!("queue.poll_interval must be greater than zero");
        }
        if self.store.trigger_key.trim().is_empty() {
            anyhow::bail!("store.trigger_key must not be empty");
        }
        cron_helper::parse_schedule(&self.retention.sweep_schedule)
            .map_err(|e| anyhow::anyhow!("retention.sweep_schedule: {e}"))?;
        Ok(())
    }

    /// Endpoint the consumer posts tasks to
    pub fn extract_url(&self) -> String {
        format!("{}/extract", self.extraction.base_url.trim_end_matches('/'))
    }
}
