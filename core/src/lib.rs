//! vaocean-core - real-time underwater-acoustic modem simulator core.
//!
//! This crate imitates the ADC/DAC endpoints of one or more acoustic
//! modems: it streams synthesized received samples to clients at a fixed
//! wall-clock rate, and accepts transmitted samples from clients,
//! convolving them through a caller-supplied propagation model so every
//! other simulated node hears them with correct propagation delay, gain,
//! and reverberation.
//!
//! # Architecture
//!
//! - [`tape`]: per-hydrophone signal tape, the time-indexed additive
//!   accumulator for future receptions.
//! - [`clock`]: the scheduler thread that paces simulated sample time
//!   against wall clock, plus the timer list for scheduled callbacks.
//! - [`node`]: the simulated modem (position, gains, tapes, daemon).
//! - [`noise`]: stationary ambient noise generation.
//! - [`propagation`]: the external propagation model facade plus channel
//!   memoization for static scenes.
//! - [`transmit`]: the pipeline that turns one DAC burst into delayed,
//!   scaled tape contributions on every other node.
//! - [`protocol`]: the per-node streaming control daemon (UASP, UASP2).
//! - [`simulation`]: the orchestrator that wires everything above
//!   together and owns the run/close lifecycle.
//! - [`params`]: the dynamic get/set parameter bag shared by nodes and
//!   protocol daemons.
//! - [`config`]: simulation-wide configuration and validation.
//! - [`error`]: centralized error types.

#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod node;
pub mod noise;
pub mod params;
pub mod propagation;
pub mod protocol;
pub mod simulation;
pub mod tape;
pub mod transmit;

pub use clock::{auto_iblksize, Scheduler, SimClock, TimerList};
pub use config::SimulationConfig;
pub use error::{VaoError, VaoResult};
pub use node::{Node, NodeConfig};
pub use noise::{NoiseSource, RedGaussianNoise, SilentNoise};
pub use params::ParamValue;
pub use propagation::{Channel, Position, PropagationAdapter, PropagationModel, SampleMatrix};
pub use protocol::{decode_frame, encode_frame, ClientLink, FrameHeader, ProtocolDaemon};
pub use protocol::uasp::UaspDaemon;
pub use protocol::uasp2::Uasp2Daemon;
pub use simulation::Simulation;
pub use tape::{Reception, SignalTape};
