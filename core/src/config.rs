//! Simulation-wide configuration (spec §3 "Simulation"; SPEC_FULL.md §8,
//! mirroring the teacher's `StreamingConfig`/`state::Config` split of
//! defaulted, validated settings from a `serde`-deserializable struct).

use serde::{Deserialize, Serialize};

use crate::error::{VaoError, VaoResult};

fn default_txref() -> f64 {
    185.0
}

fn default_rxref() -> f64 {
    -190.0
}

fn default_obufsize() -> usize {
    1_920_000
}

/// Simulation-wide parameters shared by every node (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Nominal carrier frequency (Hz), used to derive `irate`/`orate`
    /// defaults when they are left unset.
    pub frequency: f64,
    /// ADC sample rate (samples/s). Defaults to `4 × frequency`.
    #[serde(default)]
    pub irate: Option<f64>,
    /// DAC sample rate (samples/s). Defaults to `8 × frequency`.
    #[serde(default)]
    pub orate: Option<f64>,
    /// Scheduler block size; `0` selects the auto heuristic (spec §4.2).
    #[serde(default)]
    pub iblksize: usize,
    /// Transmit reference level, dB re µPa@1m.
    #[serde(default = "default_txref")]
    pub txref: f64,
    /// Receive reference level, dB re 1/µPa.
    #[serde(default = "default_rxref")]
    pub rxref: f64,
    /// Default max DAC buffer size for nodes that don't override it.
    #[serde(default = "default_obufsize")]
    pub obufsize: usize,
    /// Whether nodes may move during the run. `false` enables channel
    /// memoization (spec §9).
    #[serde(default)]
    pub mobility: bool,
}

impl SimulationConfig {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            irate: None,
            orate: None,
            iblksize: 0,
            txref: default_txref(),
            rxref: default_rxref(),
            obufsize: default_obufsize(),
            mobility: false,
        }
    }

    pub fn irate(&self) -> f64 {
        self.irate.unwrap_or(4.0 * self.frequency)
    }

    pub fn orate(&self) -> f64 {
        self.orate.unwrap_or(8.0 * self.frequency)
    }

    /// Enforces `orate mod irate == 0` (spec §3, §8 invariant 6).
    pub fn validate(&self) -> VaoResult<()> {
        let irate = self.irate();
        let orate = self.orate();
        if irate <= 0.0 {
            return Err(VaoError::Configuration(format!(
                "irate must be positive, got {irate}"
            )));
        }
        if orate <= 0.0 {
            return Err(VaoError::Configuration(format!(
                "orate must be positive, got {orate}"
            )));
        }
        let ratio = orate / irate;
        if (ratio - ratio.round()).abs() > 1e-9 {
            return Err(VaoError::Configuration(format!(
                "orate ({orate}) must be an integer multiple of irate ({irate})"
            )));
        }
        Ok(())
    }
}
