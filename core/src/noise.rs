//! Stationary ambient noise generation (spec §4.6).
//!
//! The scheduler scales `NoiseSource::sample` output by
//! `10^(rxref/20)` before adding it to each ADC block; noise is never
//! written to a [`SignalTape`](crate::tape::SignalTape), so it does not
//! count against the bounded-memory invariant tested by scenario S5.

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Contract for a stationary random-sample generator.
///
/// Any alternative noise model may be plugged in as long as it supports
/// this call shape; the core treats it as opaque.
pub trait NoiseSource: Send + Sync {
    /// Produces `n` samples at rate `fs` (Hz).
    fn sample(&self, n: usize, fs: f64) -> Vec<f32>;
}

/// Red (Brownian) Gaussian noise: white noise integrated through a
/// leaky one-pole filter, giving the characteristic -6 dB/octave roll-off
/// of "red" noise without requiring an FFT-based colored-noise crate.
///
/// The leak coefficient is derived from the sample rate so the spectral
/// shape stays consistent regardless of `fs`; state persists across calls
/// so consecutive blocks splice without a discontinuity.
pub struct RedGaussianNoise {
    state: Mutex<RedNoiseState>,
}

struct RedNoiseState {
    rng: rand::rngs::StdRng,
    integrator: f32,
}

impl Default for RedGaussianNoise {
    fn default() -> Self {
        Self::new()
    }
}

impl RedGaussianNoise {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RedNoiseState {
                rng: rand::rngs::StdRng::from_entropy(),
                integrator: 0.0,
            }),
        }
    }

    /// Deterministic variant for tests: fixed seed, reproducible output.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(RedNoiseState {
                rng: rand::rngs::StdRng::seed_from_u64(seed),
                integrator: 0.0,
            }),
        }
    }
}

impl NoiseSource for RedGaussianNoise {
    fn sample(&self, n: usize, fs: f64) -> Vec<f32> {
        // Leak coefficient chosen so the 1-pole integrator's corner stays
        // well below the Nyquist rate at any reasonable ADC rate.
        let leak = (1.0 - 50.0 / fs.max(1.0)) as f32;
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let white: f32 = StandardNormal.sample(&mut state.rng);
            state.integrator = state.integrator * leak + white * (1.0 - leak);
            out.push(state.integrator);
        }
        out
    }
}

/// Silent noise source used in tests that need deterministic, zero-floor
/// ADC blocks (e.g. checking tape-purge bounds per scenario S5).
pub struct SilentNoise;

impl NoiseSource for SilentNoise {
    fn sample(&self, n: usize, _fs: f64) -> Vec<f32> {
        vec![0.0; n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_noise_is_all_zero() {
        let noise = SilentNoise;
        assert_eq!(noise.sample(10, 96000.0), vec![0.0; 10]);
    }

    #[test]
    fn red_noise_produces_requested_length() {
        let noise = RedGaussianNoise::with_seed(42);
        assert_eq!(noise.sample(256, 96000.0).len(), 256);
    }

    #[test]
    fn red_noise_is_deterministic_for_a_fixed_seed() {
        let a = RedGaussianNoise::with_seed(7).sample(32, 96000.0);
        let b = RedGaussianNoise::with_seed(7).sample(32, 96000.0);
        assert_eq!(a, b);
    }

    #[test]
    fn red_noise_stays_in_reasonable_amplitude_range() {
        let noise = RedGaussianNoise::with_seed(1);
        let samples = noise.sample(4096, 96000.0);
        assert!(samples.iter().all(|s| s.abs() < 10.0));
    }
}
