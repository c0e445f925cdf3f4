//! A minimal example propagation model: constant-speed-of-sound delay
//! plus 1/r spherical spreading loss.
//!
//! The underwater propagation model is an opaque external collaborator
//! from the core library's point of view (spec §1, §6); this is a
//! reference implementation so the workspace runs end to end without
//! pulling in a dedicated acoustics crate. It is deliberately simple and
//! makes no claim to physical accuracy -- no absorption, no multipath, no
//! surface/bottom reflections.

use std::sync::Arc;

use async_trait::async_trait;
use vaocean_core::{Channel, Position, PropagationModel, SampleMatrix, VaoError};

pub struct FreeSpacePropagation {
    /// Speed of sound in the medium, m/s (roughly 1500 for seawater).
    sound_speed: f64,
}

impl FreeSpacePropagation {
    pub fn new(sound_speed: f64) -> Self {
        Self { sound_speed }
    }
}

#[async_trait]
impl PropagationModel for FreeSpacePropagation {
    async fn channel(
        &self,
        tx_positions: &[Position],
        rx_positions: &[Position],
        _fs: f64,
    ) -> Result<Arc<dyn Channel>, VaoError> {
        if self.sound_speed <= 0.0 {
            return Err(VaoError::Propagation("sound speed must be positive".into()));
        }
        Ok(Arc::new(FreeSpaceChannel {
            tx: tx_positions.to_vec(),
            rx: rx_positions.to_vec(),
            sound_speed: self.sound_speed,
        }))
    }
}

struct FreeSpaceChannel {
    tx: Vec<Position>,
    rx: Vec<Position>,
    sound_speed: f64,
}

fn distance(a: Position, b: Position) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[async_trait]
impl Channel for FreeSpaceChannel {
    async fn apply(&self, x: &SampleMatrix, fs: f64) -> Result<SampleMatrix, VaoError> {
        let mut per_rx: Vec<Vec<f32>> = Vec::with_capacity(self.rx.len());
        let mut max_len = 0usize;

        for rx_pos in &self.rx {
            let mut acc: Vec<f32> = Vec::new();
            for (c, tx_pos) in self.tx.iter().enumerate() {
                if c >= x.n_channels() {
                    break;
                }
                // Clamp to 1m so a coincident tx/rx pair doesn't divide
                // by zero or amplify below unity gain.
                let dist = distance(*tx_pos, *rx_pos).max(1.0);
                let delay_samples = (dist / self.sound_speed * fs).round() as usize;
                let gain = (1.0 / dist) as f32;
                let src = x.column(c);
                let needed = delay_samples + src.len();
                if acc.len() < needed {
                    acc.resize(needed, 0.0);
                }
                for (i, s) in src.iter().enumerate() {
                    acc[delay_samples + i] += s * gain;
                }
            }
            max_len = max_len.max(acc.len());
            per_rx.push(acc);
        }

        for acc in &mut per_rx {
            acc.resize(max_len, 0.0);
        }
        Ok(SampleMatrix::from_columns(per_rx))
    }
}
