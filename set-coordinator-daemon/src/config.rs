use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use set_coordinator_protocol::{
    GroupId, PeerAddress, PeerConfig, Rank, ServiceConfig, COORDINATED_SET_UUID,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const CONFIG_FILE: &str = "daemon.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub paths: PathConfig,
}

/// State machine and discovery timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// How long a connection attempt may stay in Connecting
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long Disconnecting may last before it is forced (0 = wait forever)
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,

    /// Minimum spacing of repeated device-available notifications
    #[serde(default)]
    pub reannounce_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            disconnect_timeout_ms: default_disconnect_timeout(),
            reannounce_interval_ms: 0,
        }
    }
}

impl TimeoutConfig {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            disconnect_timeout: (self.disconnect_timeout_ms > 0)
                .then(|| Duration::from_millis(self.disconnect_timeout_ms)),
        }
    }

    pub fn reannounce_interval(&self) -> Duration {
        Duration::from_millis(self.reannounce_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy registry file; defaults to `policies.json` in the data directory
    #[serde(default)]
    pub registry_file: Option<PathBuf>,

    /// Capability UUID a device must advertise before we connect to it
    #[serde(default = "default_required_uuid")]
    pub required_uuid: Uuid,

    /// Devices refused while their stored policy is still unknown
    #[serde(default)]
    pub forbidden_devices: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            registry_file: None,
            required_uuid: default_required_uuid(),
            forbidden_devices: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Parse the forbidden device list
    pub fn forbidden_addresses(&self) -> Result<HashSet<PeerAddress>> {
        self.forbidden_devices
            .iter()
            .map(|address| {
                address
                    .parse::<PeerAddress>()
                    .with_context(|| format!("Invalid forbidden device '{}'", address))
            })
            .collect()
    }
}

/// Simulated radio stack used by `run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Delay before the simulated stack answers a command
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,

    /// How long to keep running after the scenario before shutting down
    #[serde(default = "default_run_for")]
    pub run_for_secs: u64,

    #[serde(default = "default_devices")]
    pub devices: Vec<SimulatedDeviceConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            response_delay_ms: default_response_delay(),
            run_for_secs: default_run_for(),
            devices: default_devices(),
        }
    }
}

impl SimulationConfig {
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDeviceConfig {
    pub address: String,
    pub group_id: GroupId,
    pub group_size: usize,
    pub rank: Rank,

    /// Whether the device answers connect requests; a silent device
    /// exercises the connect timeout
    #[serde(default = "default_true")]
    pub responds: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("set-coordinator")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("set-coordinator")
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_disconnect_timeout() -> u64 {
    30_000
}

fn default_required_uuid() -> Uuid {
    COORDINATED_SET_UUID
}

fn default_response_delay() -> u64 {
    200
}

fn default_run_for() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_devices() -> Vec<SimulatedDeviceConfig> {
    vec![
        SimulatedDeviceConfig {
            address: "5C:F3:70:00:10:01".to_string(),
            group_id: 1,
            group_size: 2,
            rank: 2,
            responds: true,
        },
        SimulatedDeviceConfig {
            address: "5C:F3:70:00:10:02".to_string(),
            group_id: 1,
            group_size: 2,
            rank: 1,
            responds: true,
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            policy: PolicyConfig::default(),
            simulation: SimulationConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let path = PathConfig::default().config_dir.join(CONFIG_FILE);
        Self::load_from(&path)
    }

    /// Load configuration from `path`, writing defaults there if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!("Created default configuration at {}", path.display());
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the policy registry path
    pub fn policy_registry_path(&self) -> PathBuf {
        self.policy
            .registry_file
            .clone()
            .unwrap_or_else(|| self.paths.data_dir.join("policies.json"))
    }

    /// Build the coordinator service configuration
    pub fn service_config(&self) -> Result<ServiceConfig> {
        Ok(ServiceConfig {
            peer: self.timeouts.peer_config(),
            required_uuid: self.policy.required_uuid,
            min_reannounce_interval: self.timeouts.reannounce_interval(),
            forbidden_overrides: self.policy.forbidden_addresses()?,
        })
    }
}
