use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, path::PathBuf, time::Duration};
use validator::Validate;

pub const DEFAULT_MAX_RETRY_COUNT: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub storage_dir: PathBuf,
    pub sync: SyncSettings,
    pub telemetry: TelemetrySettings,
    pub health: HealthSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SyncSettings {
    #[validate(range(min = 1, max = 100))]
    pub max_retry_count: u32,
    #[validate(range(min = 100, max = 60000))]
    pub online_save_timeout_ms: u64,
    #[validate(range(min = 100, max = 120000))]
    pub sync_timeout_ms: u64,
    #[validate(range(min = 1, max = 3600))]
    pub sync_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            online_save_timeout_ms: 5_000,
            sync_timeout_ms: 10_000,
            sync_interval_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn online_save_timeout(&self) -> Duration {
        Duration::from_millis(self.online_save_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TelemetrySettings {
    pub enabled: bool,
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: usize,
    #[validate(range(min = 100, max = 600000))]
    pub flush_interval_ms: u64,
    #[validate(range(min = 50, max = 10000))]
    pub unload_deadline_ms: u64,
    pub pointer_throttle_ms: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 20,
            flush_interval_ms: 10_000,
            unload_deadline_ms: 1_000,
            pointer_throttle_ms: 1_000,
        }
    }
}

impl TelemetrySettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn unload_deadline(&self) -> Duration {
        Duration::from_millis(self.unload_deadline_ms)
    }

    pub fn pointer_throttle(&self) -> Duration {
        Duration::from_millis(self.pointer_throttle_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HealthSettings {
    pub enabled: bool,
    #[validate(range(min = 1, max = 3600))]
    pub interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 15,
        }
    }
}

impl Config {
    /// Config with default tunables, used by embedders and tests that do not
    /// go through the file/env layers.
    pub fn new(api_base_url: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            auth_token: None,
            storage_dir: storage_dir.into(),
            sync: SyncSettings::default(),
            telemetry: TelemetrySettings::default(),
            health: HealthSettings::default(),
        }
    }

    pub fn load() -> Result<Self> {
        // Local .env is optional; real deployments configure via APP__* variables
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()
            .context("Failed to build attempt-sync configuration")?;

        let api_base_url = settings
            .get_string("api.base_url")
            .or_else(|_| env::var("API_BASE_URL"))
            .unwrap_or_else(|_| "http://localhost:8081/api/v1".to_string());

        let auth_token = settings
            .get_string("api.auth_token")
            .or_else(|_| env::var("AUTH_TOKEN"))
            .ok()
            .filter(|token| !token.is_empty());

        let storage_dir = settings
            .get_string("storage.dir")
            .or_else(|_| env::var("STORAGE_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("attempt-sync"));

        let sync_defaults = SyncSettings::default();
        let sync = SyncSettings {
            max_retry_count: u32::try_from(setting_u64(
                &settings,
                "sync.max_retry_count",
                "MAX_RETRY_COUNT",
                u64::from(sync_defaults.max_retry_count),
            ))
            .context("sync.max_retry_count is out of range")?,
            online_save_timeout_ms: setting_u64(
                &settings,
                "sync.online_save_timeout_ms",
                "ONLINE_SAVE_TIMEOUT_MS",
                sync_defaults.online_save_timeout_ms,
            ),
            sync_timeout_ms: setting_u64(
                &settings,
                "sync.sync_timeout_ms",
                "SYNC_TIMEOUT_MS",
                sync_defaults.sync_timeout_ms,
            ),
            sync_interval_secs: setting_u64(
                &settings,
                "sync.sync_interval_secs",
                "SYNC_INTERVAL_SECS",
                sync_defaults.sync_interval_secs,
            ),
        };
        sync.validate().context("Invalid sync settings")?;

        let telemetry_defaults = TelemetrySettings::default();
        let telemetry = TelemetrySettings {
            enabled: settings
                .get_bool("telemetry.enabled")
                .unwrap_or(telemetry_defaults.enabled),
            batch_size: usize::try_from(setting_u64(
                &settings,
                "telemetry.batch_size",
                "TELEMETRY_BATCH_SIZE",
                telemetry_defaults.batch_size as u64,
            ))
            .context("telemetry.batch_size is out of range")?,
            flush_interval_ms: setting_u64(
                &settings,
                "telemetry.flush_interval_ms",
                "TELEMETRY_FLUSH_INTERVAL_MS",
                telemetry_defaults.flush_interval_ms,
            ),
            unload_deadline_ms: setting_u64(
                &settings,
                "telemetry.unload_deadline_ms",
                "TELEMETRY_UNLOAD_DEADLINE_MS",
                telemetry_defaults.unload_deadline_ms,
            ),
            pointer_throttle_ms: setting_u64(
                &settings,
                "telemetry.pointer_throttle_ms",
                "TELEMETRY_POINTER_THROTTLE_MS",
                telemetry_defaults.pointer_throttle_ms,
            ),
        };
        telemetry
            .validate()
            .context("Invalid telemetry settings")?;

        let health_defaults = HealthSettings::default();
        let health = HealthSettings {
            enabled: settings
                .get_bool("health.enabled")
                .unwrap_or(health_defaults.enabled),
            interval_secs: setting_u64(
                &settings,
                "health.interval_secs",
                "HEALTH_INTERVAL_SECS",
                health_defaults.interval_secs,
            ),
        };
        health.validate().context("Invalid health probe settings")?;

        Ok(Config {
            api_base_url,
            auth_token,
            storage_dir,
            sync,
            telemetry,
            health,
        })
    }
}

fn setting_u64(settings: &config::Config, key: &str, env_key: &str, default: u64) -> u64 {
    settings
        .get_int(key)
        .ok()
        .and_then(|value| u64::try_from(value).ok())
        .or_else(|| env::var(env_key).ok().and_then(|value| value.parse().ok()))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn load_uses_defaults() {
        env::remove_var("APP__TELEMETRY__BATCH_SIZE");
        env::remove_var("TELEMETRY_BATCH_SIZE");
        env::remove_var("MAX_RETRY_COUNT");
        let config = Config::load().unwrap();
        assert_eq!(config.telemetry.batch_size, 20);
        assert_eq!(config.sync.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(config.sync.online_save_timeout(), Duration::from_secs(5));
        assert_eq!(config.sync.sync_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync.sync_interval(), Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn load_reads_app_prefixed_env() {
        env::set_var("APP__TELEMETRY__BATCH_SIZE", "50");
        let config = Config::load().unwrap();
        assert_eq!(config.telemetry.batch_size, 50);
        env::remove_var("APP__TELEMETRY__BATCH_SIZE");
    }

    #[test]
    #[serial]
    fn load_rejects_out_of_range_batch_size() {
        env::set_var("TELEMETRY_BATCH_SIZE", "0");
        let result = Config::load();
        env::remove_var("TELEMETRY_BATCH_SIZE");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn load_rejects_retry_count_that_overflows_u32() {
        // 2^32 + 5 would wrap to 5 if narrowed blindly
        env::set_var("MAX_RETRY_COUNT", "4294967301");
        let result = Config::load();
        env::remove_var("MAX_RETRY_COUNT");
        assert!(result.is_err());
    }
}
