// Configuration management with layered configuration (defaults, file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings for the hub, dispatcher, scheduler and metrics feed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub feed: FeedConfig,
    pub observability: ObservabilityConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Connection hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub write_timeout_ms: u64,
    /// Outbound frames buffered per session
    pub outbound_buffer: usize,
    pub ping_interval_seconds: u64,
    pub ping_timeout_seconds: u64,
}

impl HubConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    /// Idle time after which a session is considered dead
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds + self.ping_timeout_seconds)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 500,
            outbound_buffer: 64,
            ping_interval_seconds: 20,
            ping_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub max_concurrent_executions: usize,
    /// IANA timezone cron patterns are evaluated in
    pub timezone: String,
    pub execution_history: usize,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_concurrent_executions: 64,
            timezone: "UTC".to_string(),
            execution_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub message_history: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            message_history: 10_000,
        }
    }
}

/// Live dashboard feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub publish_interval_ms: u64,
    pub rate_window_seconds: u64,
    pub subscriber_buffer: usize,
    /// IANA timezone that defines the "today" boundary
    pub timezone: String,
}

impl FeedConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 1000,
            rate_window_seconds: 10,
            subscriber_buffer: 16,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Optional JSON seed of providers, endpoints and plans
    pub path: Option<PathBuf>,
}

impl Settings {
    /// Read `$COURIER_CONFIG_DIR` (default `config/`), then `COURIER__*` env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let dir = std::env::var("COURIER_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from_path(dir)
    }

    /// `default.toml` and an uncommitted `local.toml`, both optional
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let dir = config_dir.as_ref();
        let file = |name: &str| File::from(dir.join(name)).required(false);

        Config::builder()
            .add_source(file("default.toml"))
            .add_source(file("local.toml"))
            .add_source(
                Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Reject settings the runtime cannot operate with
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.hub.write_timeout_ms == 0 {
            return Err("Hub write_timeout_ms must be greater than 0".to_string());
        }
        if self.hub.outbound_buffer == 0 {
            return Err("Hub outbound_buffer must be greater than 0".to_string());
        }
        if self.hub.ping_interval_seconds == 0 {
            return Err("Hub ping_interval_seconds must be greater than 0".to_string());
        }

        if self.scheduler.tick_interval_ms == 0 {
            return Err("Scheduler tick_interval_ms must be greater than 0".to_string());
        }
        if self.scheduler.max_concurrent_executions == 0 {
            return Err("Scheduler max_concurrent_executions must be greater than 0".to_string());
        }
        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!(
                "Scheduler timezone '{}' is not a valid IANA timezone",
                self.scheduler.timezone
            ));
        }

        if self.dispatch.message_history == 0 {
            return Err("Dispatch message_history must be greater than 0".to_string());
        }

        if self.feed.publish_interval_ms == 0 {
            return Err("Feed publish_interval_ms must be greater than 0".to_string());
        }
        if self.feed.rate_window_seconds == 0 {
            return Err("Feed rate_window_seconds must be greater than 0".to_string());
        }
        if self.feed.subscriber_buffer == 0 {
            return Err("Feed subscriber_buffer must be greater than 0".to_string());
        }
        if self.feed.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!(
                "Feed timezone '{}' is not a valid IANA timezone",
                self.feed.timezone
            ));
        }

        Ok(())
    }
}
