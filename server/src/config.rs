//! Scenario configuration: loads a node layout and simulation-wide
//! settings from YAML with environment-variable overrides, matching
//! the teacher's `ServerConfig` split of defaulted, validated settings
//! (SPEC_FULL.md §8).

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use vaocean_core::SimulationConfig;

fn default_bind_ip() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_protocol() -> ProtocolKind {
    ProtocolKind::Uasp2
}

fn default_obufsize() -> usize {
    1_920_000
}

fn default_txref() -> f64 {
    185.0
}

fn default_rxref() -> f64 {
    -190.0
}

fn default_sound_speed() -> f64 {
    1500.0
}

/// Which concrete streaming-protocol framing a node's daemon uses (spec
/// §4.5: UASP over UDP+UDP, UASP2 over TCP+UDP).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Uasp,
    Uasp2,
}

/// One node's scenario-file layout (spec §3 "Node").
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    /// Nominal position, meters, z negative downward.
    pub position: [f64; 3],
    /// Hydrophone offsets relative to `position`.
    pub relpos: Vec<[f64; 3]>,
    /// Transmit-capable channel count. Defaults to `relpos.len()` (every
    /// hydrophone transmit-capable) when omitted.
    #[serde(default)]
    pub ochannels: Option<usize>,
    #[serde(default)]
    pub igain: f64,
    #[serde(default)]
    pub ogain: f64,
    #[serde(default = "default_obufsize")]
    pub obufsize: usize,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolKind,
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Control-plane port. UASP additionally binds `port + 1` for its
    /// data socket; UASP2's data socket binds an ephemeral local port.
    pub port: u16,
}

/// Top-level scenario configuration loaded from YAML with environment
/// overrides (spec §3 "Simulation").
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub frequency: f64,
    #[serde(default)]
    pub irate: Option<f64>,
    #[serde(default)]
    pub orate: Option<f64>,
    #[serde(default)]
    pub iblksize: usize,
    #[serde(default = "default_txref")]
    pub txref: f64,
    #[serde(default = "default_rxref")]
    pub rxref: f64,
    #[serde(default = "default_obufsize")]
    pub obufsize: usize,
    #[serde(default)]
    pub mobility: bool,
    /// Speed of sound, m/s, fed to the bundled `FreeSpacePropagation`
    /// example model. Override: `VAOCEAN_SOUND_SPEED`.
    #[serde(default = "default_sound_speed")]
    pub sound_speed: f64,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

impl Default for ServerConfig {
    /// A runnable two-node demo scenario, 1000m apart, both on UASP2.
    fn default() -> Self {
        Self {
            frequency: 24000.0,
            irate: None,
            orate: None,
            iblksize: 0,
            txref: default_txref(),
            rxref: default_rxref(),
            obufsize: default_obufsize(),
            mobility: false,
            sound_speed: default_sound_speed(),
            nodes: vec![
                NodeSpec {
                    position: [0.0, 0.0, -1.0],
                    relpos: vec![[0.0, 0.0, 0.0]],
                    ochannels: None,
                    igain: 0.0,
                    ogain: 0.0,
                    obufsize: default_obufsize(),
                    protocol: ProtocolKind::Uasp2,
                    bind_ip: default_bind_ip(),
                    port: 19809,
                },
                NodeSpec {
                    position: [1000.0, 0.0, -1.0],
                    relpos: vec![[0.0, 0.0, 0.0]],
                    ochannels: None,
                    igain: 0.0,
                    ogain: 0.0,
                    obufsize: default_obufsize(),
                    protocol: ProtocolKind::Uasp2,
                    bind_ip: default_bind_ip(),
                    port: 19810,
                },
            ],
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides. Falls back to the built-in demo scenario when no path
    /// is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str::<Self>(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment-variable overrides (SPEC_FULL.md §8).
    /// `VAOCEAN_LOG_LEVEL` is read directly by `main.rs` via clap's `env`
    /// attribute rather than here.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("VAOCEAN_BIND_IP") {
            match val.parse::<IpAddr>() {
                Ok(ip) => {
                    for node in &mut self.nodes {
                        node.bind_ip = ip;
                    }
                }
                Err(e) => log::warn!("[Config] ignoring invalid VAOCEAN_BIND_IP={val}: {e}"),
            }
        }

        if let Ok(val) = std::env::var("VAOCEAN_SOUND_SPEED") {
            match val.parse::<f64>() {
                Ok(speed) if speed > 0.0 => self.sound_speed = speed,
                _ => log::warn!("[Config] ignoring invalid VAOCEAN_SOUND_SPEED={val}"),
            }
        }
    }

    /// Converts to `vaocean_core`'s simulation-wide configuration type.
    pub fn to_simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            frequency: self.frequency,
            irate: self.irate,
            orate: self.orate,
            iblksize: self.iblksize,
            txref: self.txref,
            rxref: self.rxref,
            obufsize: self.obufsize,
            mobility: self.mobility,
        }
    }
}
