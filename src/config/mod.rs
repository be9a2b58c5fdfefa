//! Configuration module

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub peer: PeerConfig,
}

/// Bind address for the peer-facing surface
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Base path every device agent URL starts with
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Staleness window between GetSettings polls of the current device
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PeerConfig {
    /// Receive surface of the paired instance; unset means unpaired
    pub context_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            refresh_secs: default_refresh(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8084
}

fn default_base_url() -> String {
    "https://agent.electricimp.com/".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_refresh() -> u64 {
    120
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("IMPCOMPANION").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize().unwrap_or_default();
        Ok(config)
    }
}
