use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use display_agent::{AgentConfig, HostAllocator};

// Tunables layer: defaults -> config.toml -> PORTHOLE_* env vars
// (double underscore nests into sections: PORTHOLE_SERVER__PORT=8090).

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub agent: AgentFileConfig,
}

/// Serving knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared token viewers must present as `?token=`. Unset disables the
    /// check; an upstream authentication layer is expected in that case.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
        }
    }
}

/// Display-agent knobs (lives under `[agent]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentFileConfig {
    #[serde(default = "default_agent_bin")]
    pub bin: PathBuf,
    /// Socket marker directory scanned for taken display numbers.
    #[serde(default)]
    pub marker_dir: Option<PathBuf>,
    /// Where agent state files live; defaults to `<data_dir>/state`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_poll_loops")]
    pub poll_loops: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub verbose_relay: bool,
}

impl Default for AgentFileConfig {
    fn default() -> Self {
        Self {
            bin: default_agent_bin(),
            marker_dir: None,
            state_dir: None,
            poll_loops: default_poll_loops(),
            poll_interval_ms: default_poll_interval_ms(),
            verbose_relay: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_agent_bin() -> PathBuf {
    PathBuf::from("nxagent")
}

fn default_poll_loops() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Build a figment that layers defaults, `<data_dir>/config.toml`, and
/// `PORTHOLE_*` environment variables.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PORTHOLE_").split("__"))
}

impl AgentFileConfig {
    /// Resolve into the runtime config handed to the session.
    pub fn to_agent_config(&self, dirs: &PortholeDirs) -> AgentConfig {
        let allocator = HostAllocator {
            marker_dir: self
                .marker_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join(".X11-unix")),
        };
        AgentConfig {
            agent_bin: self.bin.clone(),
            state_dir: self
                .state_dir
                .clone()
                .unwrap_or_else(|| dirs.data_dir.join("state")),
            poll_loops: self.poll_loops,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            allocator: Arc::new(allocator),
            verbose_relay: self.verbose_relay,
        }
    }
}

/// Directory layout (not tunable via figment; derived from --data-dir).
#[derive(Clone, Debug)]
pub struct PortholeDirs {
    pub data_dir: PathBuf,
}

impl PortholeDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = custom_dir
            .or_else(|| dirs::home_dir().map(|home| home.join(".porthole")))
            .context("could not determine a data directory")?;

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {:?}", data_dir))?;
        std::fs::create_dir_all(data_dir.join("state"))
            .with_context(|| format!("failed to create state directory: {:?}", data_dir))?;

        info!("data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
