//! Application configuration stored as TOML under the user's home directory.
//!
//! ```toml
//! [device]
//! device_id = "MRI-07"
//! request_line = "auxiliary"      # optional
//! convergence_timeout_ms = 15000
//!
//! [[brokers]]
//! label = "local"
//! url = "ws://localhost:8083/mqtt"
//!
//! [session]
//! reconnect_period_ms = 0         # 0 disables transport reconnects
//! connect_timeout_ms = 10000
//! keep_alive_secs = 30
//! min_command_interval_ms = 350
//!
//! [probe]
//! timeout_ms = 4500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::{DeviceLine, ProbeCandidate, SessionOptions, DEFAULT_PROBE_TIMEOUT};

const CONFIG_DIR: &str = ".config/remoteline";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default = "default_brokers")]
    pub brokers: Vec<ProbeCandidate>,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub probe: ProbeSection,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceSection {
    pub device_id: String,
    /// Line to request once connected; omitted means observe only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_line: Option<DeviceLine>,
    pub convergence_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub reconnect_period_ms: u64,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub min_command_interval_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProbeSection {
    pub timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceSection::default(),
            brokers: default_brokers(),
            session: SessionSection::default(),
            probe: ProbeSection::default(),
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_id: "MRI-01".to_string(),
            request_line: None,
            convergence_timeout_ms: 15_000,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionOptions::default();
        Self {
            client_id: None,
            reconnect_period_ms: 0,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            keep_alive_secs: defaults.keep_alive.as_secs(),
            min_command_interval_ms: defaults.min_command_interval.as_millis() as u64,
        }
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
        }
    }
}

fn default_brokers() -> Vec<ProbeCandidate> {
    vec![
        ProbeCandidate::new("local", "ws://localhost:8083/mqtt"),
        ProbeCandidate::new("emqx-public", "wss://broker.emqx.io:8084/mqtt"),
    ]
}

impl AppConfig {
    /// `~/.config/remoteline/config.toml`, falling back to the working directory.
    pub fn config_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the config file, writing the defaults first if none exists yet.
    pub async fn load_or_init() -> Result<Self> {
        let path = Self::config_path();
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            info!("No config found, writing defaults to {}", path.display());
            let config = Self::default();
            config.save_to(&path).await?;
            return Ok(config);
        }
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        let session = &self.session;
        SessionOptions {
            client_id: session.client_id.clone(),
            reconnect_period: (session.reconnect_period_ms > 0)
                .then(|| Duration::from_millis(session.reconnect_period_ms)),
            connect_timeout: Duration::from_millis(session.connect_timeout_ms),
            keep_alive: Duration::from_secs(session.keep_alive_secs),
            min_command_interval: Duration::from_millis(session.min_command_interval_ms),
            ..SessionOptions::default()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.device.convergence_timeout_ms)
    }
}
