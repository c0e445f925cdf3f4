//! Simulated modem: position, hydrophone offsets, gains, and the
//! per-hydrophone tapes a single node owns (spec §4.3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::params::ParamValue;
use crate::propagation::Position;
use crate::protocol::ProtocolDaemon;
use crate::tape::SignalTape;

/// Static configuration supplied to [`crate::simulation::Simulation::add_node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Nominal node position in meters, `z` negative downward.
    pub position: Position,
    /// Hydrophone offsets relative to `position`. The first `ochannels`
    /// entries are transmit-capable; entries beyond that are receive-only.
    pub relpos: Vec<Position>,
    /// Number of transmit-capable channels (`<= relpos.len()`).
    pub ochannels: usize,
    /// ADC input gain, dB.
    pub igain: f64,
    /// DAC output gain, dB.
    pub ogain: f64,
    /// Maximum DAC buffer samples (`obufsize` parameter, spec §6).
    pub obufsize: usize,
}

/// A simulated modem node.
pub struct Node {
    pub config: RwLock<NodeConfig>,
    pub mute: AtomicBool,
    /// Next ADC block sequence number.
    pub seqno: AtomicU64,
    /// One tape per hydrophone; `tapes.len() == relpos.len()`.
    pub tapes: Vec<Arc<SignalTape>>,
    pub daemon: Arc<dyn ProtocolDaemon>,
}

impl Node {
    pub fn new(config: NodeConfig, daemon: Arc<dyn ProtocolDaemon>) -> Self {
        let tapes = (0..config.relpos.len())
            .map(|_| Arc::new(SignalTape::new()))
            .collect();
        Self {
            config: RwLock::new(config),
            mute: AtomicBool::new(false),
            seqno: AtomicU64::new(0),
            tapes,
            daemon,
        }
    }

    pub fn hydrophone_count(&self) -> usize {
        self.tapes.len()
    }

    pub fn ochannels(&self) -> usize {
        self.config.read().ochannels
    }

    pub fn position(&self) -> Position {
        self.config.read().position
    }

    pub fn relpos(&self) -> Vec<Position> {
        self.config.read().relpos.clone()
    }

    /// Absolute position of transmit-capable hydrophone `ch`.
    pub fn tx_position(&self, ch: usize) -> Position {
        let cfg = self.config.read();
        let p = cfg.position;
        let r = cfg.relpos[ch];
        [p[0] + r[0], p[1] + r[1], p[2] + r[2]]
    }

    /// Absolute positions of every hydrophone (receive-capable or not).
    pub fn all_rx_positions(&self) -> Vec<Position> {
        let cfg = self.config.read();
        cfg.relpos
            .iter()
            .map(|r| [cfg.position[0] + r[0], cfg.position[1] + r[1], cfg.position[2] + r[2]])
            .collect()
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    /// ADC input gain, dB.
    pub fn igain(&self) -> f64 {
        self.config.read().igain
    }

    /// DAC output gain, dB.
    pub fn ogain(&self) -> f64 {
        self.config.read().ogain
    }

    pub fn obufsize(&self) -> usize {
        self.config.read().obufsize
    }

    /// Returns a known parameter's current value, or `None` for an
    /// unrecognized key (spec §6 parameter table; §4.3 get/set contract).
    pub fn get_param(&self, key: &str, irate: f64, orate: f64, sim_time_secs: f64) -> Option<ParamValue> {
        let cfg = self.config.read();
        match key {
            "time" => Some(ParamValue::Int(sim_time_secs.round() as i64)),
            "iseqno" => Some(ParamValue::Int(self.seqno.load(Ordering::Relaxed) as i64)),
            "iblksize" => None, // resolved by the caller, which knows the simulation's iblksize
            "irate" => Some(ParamValue::Float(irate)),
            "irates" => Some(ParamValue::ListFloat(vec![irate])),
            "ichannels" => Some(ParamValue::Int(cfg.relpos.len() as i64)),
            "igain" => Some(ParamValue::Float(cfg.igain)),
            "orate" => Some(ParamValue::Float(orate)),
            "orates" => Some(ParamValue::ListFloat(vec![orate])),
            "ochannels" => Some(ParamValue::Int(cfg.ochannels as i64)),
            "ogain" => Some(ParamValue::Float(cfg.ogain)),
            "omute" => Some(ParamValue::Bool(self.is_muted())),
            "obufsize" => Some(ParamValue::Int(cfg.obufsize as i64)),
            _ => None,
        }
    }

    /// Applies a parameter `set`. Unknown keys are silently ignored.
    /// Setting `iseqno` to any value resets the sequence counter to 0
    /// (treated as reset intent per spec §4.3).
    pub fn set_param(&self, key: &str, value: &ParamValue) {
        match key {
            "iseqno" => self.seqno.store(0, Ordering::Relaxed),
            "igain" => {
                if let Some(v) = value.as_f64() {
                    self.config.write().igain = v;
                }
            }
            "ogain" => {
                if let Some(v) = value.as_f64() {
                    self.config.write().ogain = v;
                }
            }
            "omute" => {
                if let Some(v) = value.as_bool() {
                    self.mute.store(v, Ordering::Relaxed);
                }
            }
            "obufsize" => {
                if let Some(v) = value.as_i64() {
                    if v >= 0 {
                        self.config.write().obufsize = v as usize;
                    }
                }
            }
            _ => {}
        }
    }

    /// Resets `iseqno` to 0 (the `ireset` control action).
    pub fn reset_seqno(&self) {
        self.seqno.store(0, Ordering::Relaxed);
    }

    /// Returns the sequence number for the next frame and increments it.
    pub fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }
}
