//! Centralized error types for the VirtualAcousticOcean core library.
//!
//! Per the error-handling design, only configuration errors ever reach a
//! caller: bad commands, bad data packets, peer-gone socket writes, slow
//! transmit computation, and propagation-model failures are all logged
//! and recovered from locally at their call sites. [`VaoError`] is
//! reserved for the handful of operations allowed to abort: adding a node
//! after the simulation has started, starting the simulation with an
//! invalid rate configuration, and daemon socket binding.

use thiserror::Error;

/// Application-wide error type for the simulator core.
#[derive(Debug, Error)]
pub enum VaoError {
    /// `add_node` called while running, `orate` not an integer multiple
    /// of `irate`, or some other invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A daemon failed to bind its requested socket(s).
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Miscellaneous I/O failure during setup (not a steady-state socket
    /// write, which is swallowed per the error-handling design).
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The propagation model rejected a request outright (e.g. invalid
    /// geometry) rather than failing mid-computation.
    #[error("propagation model error: {0}")]
    Propagation(String),
}

/// Convenient `Result` alias for fallible core operations.
pub type VaoResult<T> = Result<T, VaoError>;

impl From<std::io::Error> for VaoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_displays_message() {
        let err = VaoError::Configuration("orate must be a multiple of irate".into());
        assert_eq!(
            err.to_string(),
            "configuration error: orate must be a multiple of irate"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::other("boom");
        let err: VaoError = io_err.into();
        assert!(matches!(err, VaoError::Io(_)));
    }
}
