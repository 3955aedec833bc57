use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use taskhub_broker::MemoryBrokerConfig;
use taskhub_persistence::PoolSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerSettings,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Without a URL the hub keeps everything in memory
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// When false every enqueue answers 503
    pub enabled: bool,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
    /// `text` or `json`
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: None,
            max_connections: 20,
            min_connections: 5,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
            run_migrations: true,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            enabled: true,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl HubConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: HubConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn pool_settings(&self) -> Option<PoolSettings> {
        let db = &self.database;
        db.url.as_ref().filter(|u| !u.is_empty()).map(|url| PoolSettings {
            url: url.clone(),
            max_connections: db.max_connections,
            min_connections: db.min_connections,
            acquire_timeout: Duration::from_secs(db.acquire_timeout_secs),
            idle_timeout: Duration::from_secs(db.idle_timeout_secs),
            max_lifetime: Duration::from_secs(db.max_lifetime_secs),
        })
    }

    pub fn memory_broker_config(&self) -> MemoryBrokerConfig {
        MemoryBrokerConfig {
            retry_base_delay: Duration::from_millis(self.broker.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.broker.retry_max_delay_ms),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}
