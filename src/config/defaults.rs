/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3005;

// Store defaults
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_TRIGGER_KEY: &str = "scheduler:tasks";

// Queue defaults
pub const DEFAULT_QUEUE_NAME: &str = "crawler";
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_POLL_INTERVAL: &str = "1s";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_DEPTH: u32 = 2;

// Extraction worker defaults
pub const DEFAULT_EXTRACTION_BASE_URL: &str = "http://data-extraction:3001";
pub const DEFAULT_EXTRACTION_TIMEOUT: &str = "60s";

// Retention defaults
pub const DEFAULT_RETENTION_MAX_AGE: &str = "7d";
pub const DEFAULT_SWEEP_SCHEDULE: &str = "0 0 * * *";

// Shutdown
pub const DEFAULT_SHUTDOWN_GRACE: &str = "30s";

// Environment variable prefix for overrides, e.g. SPIDERBOT_QUEUE__MAX_CONCURRENT
pub const ENV_PREFIX: &str = "SPIDERBOT_";
