use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::credentials::NetworkFamily;
use crate::session::protocol::{DEFAULT_SERVER, SECURE_PORT};
use crate::session::{FailurePolicy, SessionSettings};
use crate::transport::DeliveryMode;

const CONFIG_DIR: &str = "telemetry-agent";
const CONFIG_FILE: &str = "agent.toml";
pub const CONFIG_PATH_ENV: &str = "TELEMETRY_AGENT_CONFIG";
pub const API_KEY_ENV: &str = "TELEMETRY_AGENT_API_KEY";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub agent: RunConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: String,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            keepalive_secs: 60,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub client_id: String,
    pub api_key: String,
    /// 8883 enables TLS, any other port is plaintext
    pub port: u16,
    pub network: NetworkFamily,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_id: "urn:lo:nsid:agent:telemetry".to_string(),
            api_key: String::new(),
            port: SECURE_PORT,
            network: NetworkFamily::Default,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub mode: DeliveryMode,
    pub message_rate_secs: u64,
    pub debug: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Threaded,
            message_rate_secs: 5,
            debug: true,
        }
    }
}

impl AgentConfig {
    /// Loads the config file, falling back to defaults when it does not
    /// exist, then applies the API key override from the environment.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            warn!("No config at {}, using defaults", path.display());
            Self::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            debug!("Using API key from {}", API_KEY_ENV);
            config.device.api_key = key;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.api_key.trim().is_empty() {
            return Err(eyre!(
                "No API key configured, set device.api_key or {}",
                API_KEY_ENV
            ));
        }
        if self.broker.server.trim().is_empty() {
            return Err(eyre!("broker.server must not be empty"));
        }
        if self.agent.message_rate_secs == 0 {
            return Err(eyre!("agent.message_rate_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn session_settings(&self, failure_policy: FailurePolicy) -> SessionSettings {
        SessionSettings {
            server: self.broker.server.clone(),
            keepalive: Duration::from_secs(self.broker.keepalive_secs),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            failure_policy,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.broker.reconnect_delay_secs)
    }

    pub fn message_rate(&self) -> Duration {
        Duration::from_secs(self.agent.message_rate_secs)
    }
}

fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    let mut path = dirs::config_dir().ok_or_else(|| eyre!("No config directory available"))?;
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    Ok(path)
}
