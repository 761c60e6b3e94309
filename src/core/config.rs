use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "outpost.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Agent,
    Server,
}

impl Role {
    pub fn default_retention_days(self) -> u32 {
        match self {
            Role::Agent => 30,
            Role::Server => 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutpostConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_batch_size")]
    pub outbox_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub inbox_batch_size: usize,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

/// Unset `days` falls back to the role default.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetentionConfig {
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// No base URL means the agent runs offline and only queues records.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_agent_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "outpost-agent".to_string())
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    50
}
fn default_ttl_secs() -> u64 {
    3_600
}
fn default_step_timeout_secs() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    3_600
}
fn default_flush_interval() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    60
}
fn default_drain_interval() -> u64 {
    15
}
fn default_heartbeat_interval() -> u64 {
    300
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            role: Role::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            outbox_batch_size: default_batch_size(),
            inbox_batch_size: default_batch_size(),
            default_ttl_secs: default_ttl_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            flush_interval_secs: default_flush_interval(),
            poll_interval_secs: default_poll_interval(),
            drain_interval_secs: default_drain_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl OutpostConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: OutpostConfig = toml::from_str(&content)?;
        config.validate()?;

        info!(
            "Loaded config: agent={}, role={:?}, retention={}d, server={}",
            config.agent.agent_id,
            config.agent.role,
            config.retention_days(),
            config.server.base_url.as_deref().unwrap_or("<offline>")
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.agent_id.trim().is_empty() {
            bail!("[agent] agent_id must not be empty");
        }
        if self.limits.outbox_batch_size == 0 || self.limits.inbox_batch_size == 0 {
            bail!("[limits] batch sizes must be at least 1");
        }
        if self.limits.default_ttl_secs == 0 {
            bail!("[limits] default_ttl_secs must be at least 1");
        }
        if self.limits.step_timeout_secs == 0 {
            bail!("[limits] step_timeout_secs must be at least 1");
        }
        if self.server.request_timeout_secs == 0 {
            bail!("[server] request_timeout_secs must be at least 1");
        }
        if self.retention.days == Some(0) {
            bail!("[retention] days must be at least 1");
        }
        let s = &self.schedule;
        if [
            s.sweep_interval_secs,
            s.flush_interval_secs,
            s.poll_interval_secs,
            s.drain_interval_secs,
            s.heartbeat_interval_secs,
        ]
        .contains(&0)
        {
            bail!("[schedule] intervals must be at least 1 second");
        }
        Ok(())
    }

    pub fn retention_days(&self) -> u32 {
        self.retention
            .days
            .unwrap_or_else(|| self.agent.role.default_retention_days())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days()))
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        i64::try_from(self.limits.default_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.step_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_agent_role() {
        let config = OutpostConfig::default();
        assert_eq!(config.agent.role, Role::Agent);
        assert_eq!(config.retention_days(), 30);
        assert_eq!(config.limits.outbox_batch_size, 50);
        assert_eq!(config.default_ttl(), chrono::Duration::seconds(3600));
        assert_eq!(config.step_timeout(), Duration::from_secs(300));
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert!(config.server.base_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn server_role_keeps_records_longer() {
        let config: OutpostConfig = toml::from_str("[agent]\nagent_id = \"hq\"\nrole = \"server\"\n").unwrap();
        assert_eq!(config.retention_days(), 90);
    }

    #[test]
    fn explicit_retention_wins() {
        let config: OutpostConfig = toml::from_str("[retention]\ndays = 7\n").unwrap();
        assert_eq!(config.retention(), chrono::Duration::days(7));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config: OutpostConfig =
            toml::from_str("[limits]\noutbox_batch_size = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: OutpostConfig = toml::from_str("[limits]\ndefault_ttl_secs = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: OutpostConfig =
            toml::from_str("[schedule]\ndrain_interval_secs = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = OutpostConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.limits.inbox_batch_size, 50);
    }

    #[tokio::test]
    async fn load_reads_all_sections() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"
[agent]
agent_id = "edge-17"

[store]
busy_timeout_ms = 1500

[limits]
outbox_batch_size = 10
default_ttl_secs = 600

[schedule]
flush_interval_secs = 5

[server]
base_url = "https://mgmt.example.com"

[logging]
level = "debug"
"#;
        std::fs::write(dir.path().join(CONFIG_FILE), content).unwrap();

        let config = OutpostConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.agent.agent_id, "edge-17");
        assert_eq!(config.busy_timeout(), Duration::from_millis(1500));
        assert_eq!(config.limits.outbox_batch_size, 10);
        assert_eq!(config.limits.inbox_batch_size, 50);
        assert_eq!(config.default_ttl(), chrono::Duration::minutes(10));
        assert_eq!(config.schedule.flush_interval_secs, 5);
        assert_eq!(config.schedule.sweep_interval_secs, 3600);
        assert_eq!(
            config.server.base_url.as_deref(),
            Some("https://mgmt.example.com")
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[tokio::test]
    async fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[retention]\ndays = 0\n").unwrap();
        assert!(OutpostConfig::load(dir.path()).await.is_err());
    }
}
