//! Per-node streaming-protocol control daemon: common contract shared by
//! the two concrete framings, UASP (UDP+UDP) and UASP2 (TCP+UDP) (spec
//! §4.5).
//!
//! The control plane (line-delimited JSON request/response/notification)
//! is framing-independent and lives in [`control`]; each framing module
//! only supplies the transport (socket setup, read loop, destination
//! tracking) around the shared [`control::handle_line`] dispatcher.

mod control;
pub mod uasp;
pub mod uasp2;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::VaoResult;
use crate::params::ParamValue;
use crate::propagation::SampleMatrix;

pub use control::{ControlRequest, DacBuffer};

/// Application identity advertised by `version` (spec scenario S1).
pub const APP_NAME: &str = "VirtualAcousticOcean";
/// Protocol version advertised by `version`.
pub const PROTOCOL_VERSION: &str = "0.2.0";

/// 16-byte big-endian data-frame header shared by both framings (spec
/// §4.5, "Data plane framing").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_us: u64,
    pub seqno: u32,
    pub nsamples: u16,
    pub nchannels: u16,
}

impl FrameHeader {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..8].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[8..12].copy_from_slice(&self.seqno.to_be_bytes());
        buf[12..14].copy_from_slice(&self.nsamples.to_be_bytes());
        buf[14..16].copy_from_slice(&self.nchannels.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Self {
            timestamp_us: u64::from_be_bytes(buf[0..8].try_into().ok()?),
            seqno: u32::from_be_bytes(buf[8..12].try_into().ok()?),
            nsamples: u16::from_be_bytes(buf[12..14].try_into().ok()?),
            nchannels: u16::from_be_bytes(buf[14..16].try_into().ok()?),
        })
    }
}

/// Encodes a header followed by `nsamples * nchannels` big-endian f32
/// samples, channel-interleaved: `[c0,t0, c1,t0, ..., cC-1,t0, c0,t1, ...]`.
///
/// `SampleMatrix` already stores its data in this exact order, so this
/// walks the backing buffer once rather than re-deriving each channel's
/// column per sample -- this runs once per ADC frame on the streaming
/// hot path (~375 frames/s at the spec's default rates).
pub fn encode_frame(header: &FrameHeader, block: &SampleMatrix) -> Vec<u8> {
    let samples = block.interleaved();
    let mut out = Vec::with_capacity(FrameHeader::LEN + samples.len() * 4);
    out.extend_from_slice(&header.encode());
    for sample in samples {
        out.extend_from_slice(&sample.to_be_bytes());
    }
    out
}

/// Decodes a header-prefixed frame into its header and flat
/// channel-interleaved sample vector. Used to parse incoming DAC data
/// (`odata`); per spec §4.5 "for incoming DAC data the header is ignored
/// (but consumed)", so `nsamples`/`nchannels` are decoded for callers
/// that want them but are NOT used to bound how many samples are read —
/// every complete 4-byte float in the payload is taken, and any trailing
/// partial float (a malformed/truncated packet) is dropped.
pub fn decode_frame(buf: &[u8]) -> Option<(FrameHeader, Vec<f32>)> {
    let header = FrameHeader::decode(buf)?;
    let payload = &buf[FrameHeader::LEN..];
    let samples = payload
        .chunks_exact(4)
        .map(|c| f32::from_be_bytes(c.try_into().unwrap()))
        .collect();
    Some((header, samples))
}

/// Opaque two-way link between a daemon and the node/simulation it is
/// bound to (spec §9, "Opaque client indirection"). The concrete
/// implementor is injected by [`crate::simulation::Simulation`] when it
/// binds each node's daemon.
#[async_trait]
pub trait ClientLink: Send + Sync {
    /// Returns a known parameter's value, or `None` if unrecognized.
    fn get(&self, key: &str) -> Option<ParamValue>;
    /// Applies a parameter `set`; unknown keys are silently ignored.
    fn set(&self, key: &str, value: ParamValue);
    /// Current simulated sample index, for resolving `ostart`'s
    /// optional µs `time` (and "0 ⇒ immediate") to a sample index.
    fn now_sample(&self) -> i64;
    /// The simulation's ADC rate, needed for the same µs-to-sample
    /// conversion.
    fn irate(&self) -> f64;
    /// The node's transmit-capable channel count, needed to reshape the
    /// flat DAC buffer into a `(N/ochannels, ochannels)` matrix (spec §9,
    /// "DAC channel reshape ambiguity").
    fn ochannels(&self) -> usize;
    /// Initiates a transmission of `x` and returns the resolved start
    /// sample (spec §4.4 step 6).
    async fn transmit(&self, t_request_sample: i64, x: SampleMatrix, id: Option<JsonValue>) -> i64;
}

/// Common contract every concrete framing (UASP, UASP2) implements.
#[async_trait]
pub trait ProtocolDaemon: Send + Sync {
    /// Binds sockets/listeners and spins up handler tasks. Idempotent
    /// with respect to the daemon's own lifecycle; called once by
    /// `Simulation::run` per node.
    async fn run(&self, link: Arc<dyn ClientLink>) -> VaoResult<()>;

    /// Sends one ADC data frame to the client (daemon -> client).
    async fn stream(&self, t_us: u64, seqno: u32, block: &SampleMatrix);

    /// Sends an asynchronous notification (daemon -> client).
    async fn event(&self, t_us: u64, event_name: &str, id: Option<JsonValue>);

    /// Releases sockets and stops handler tasks.
    fn close(&self);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// No-op daemon for tests that need a `Node` but never exercise the
    /// wire protocol.
    pub struct NoopDaemon;

    #[async_trait]
    impl ProtocolDaemon for NoopDaemon {
        async fn run(&self, _link: Arc<dyn ClientLink>) -> VaoResult<()> {
            Ok(())
        }
        async fn stream(&self, _t_us: u64, _seqno: u32, _block: &SampleMatrix) {}
        async fn event(&self, _t_us: u64, _event_name: &str, _id: Option<JsonValue>) {}
        fn close(&self) {}
    }

    /// Minimal [`ClientLink`] for tests that construct a daemon without a
    /// full `Simulation`.
    pub struct NoopLink;

    #[async_trait]
    impl ClientLink for NoopLink {
        fn get(&self, _key: &str) -> Option<ParamValue> {
            None
        }
        fn set(&self, _key: &str, _value: ParamValue) {}
        fn now_sample(&self) -> i64 {
            0
        }
        fn irate(&self) -> f64 {
            96000.0
        }
        fn ochannels(&self) -> usize {
            1
        }
        async fn transmit(&self, t_request_sample: i64, _x: SampleMatrix, _id: Option<JsonValue>) -> i64 {
            t_request_sample
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips_through_bytes() {
        let header = FrameHeader {
            timestamp_us: 123_456_789,
            seqno: 42,
            nsamples: 256,
            nchannels: 2,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), FrameHeader::LEN);
        let decoded = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn encode_frame_interleaves_channels_per_sample() {
        let header = FrameHeader {
            timestamp_us: 0,
            seqno: 0,
            nsamples: 2,
            nchannels: 2,
        };
        let block = SampleMatrix::from_columns(vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        let bytes = encode_frame(&header, &block);
        assert_eq!(bytes.len(), FrameHeader::LEN + 2 * 2 * 4);
        let payload = &bytes[FrameHeader::LEN..];
        let s0c0 = f32::from_be_bytes(payload[0..4].try_into().unwrap());
        let s0c1 = f32::from_be_bytes(payload[4..8].try_into().unwrap());
        let s1c0 = f32::from_be_bytes(payload[8..12].try_into().unwrap());
        let s1c1 = f32::from_be_bytes(payload[12..16].try_into().unwrap());
        assert_eq!([s0c0, s0c1, s1c0, s1c1], [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn decode_frame_recovers_samples_ignoring_header_semantics() {
        let header = FrameHeader {
            timestamp_us: 999,
            seqno: 7,
            nsamples: 1,
            nchannels: 2,
        };
        let block = SampleMatrix::from_columns(vec![vec![0.5], vec![-0.5]]);
        let bytes = encode_frame(&header, &block);
        let (decoded_header, samples) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn decode_frame_ignores_declared_header_counts_for_incoming_data() {
        // Spec §4.5: "for incoming DAC data the header is ignored (but
        // consumed)" -- a client may put whatever it wants in
        // nsamples/nchannels; decode_frame must not use those fields to
        // bound how many floats it extracts.
        let header = FrameHeader {
            timestamp_us: 0,
            seqno: 0,
            nsamples: 10,
            nchannels: 2,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&1.0f32.to_be_bytes());
        bytes.extend_from_slice(&2.0f32.to_be_bytes());
        let (_, samples) = decode_frame(&bytes).unwrap();
        assert_eq!(samples, vec![1.0, 2.0]);
    }

    #[test]
    fn decode_frame_drops_trailing_partial_float() {
        let header = FrameHeader {
            timestamp_us: 0,
            seqno: 0,
            nsamples: 0,
            nchannels: 0,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&1.0f32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]); // a partial, malformed trailing float
        let (_, samples) = decode_frame(&bytes).unwrap();
        assert_eq!(samples, vec![1.0]);
    }

    #[test]
    fn decode_frame_rejects_buffer_shorter_than_header() {
        assert!(decode_frame(&[0u8; 4]).is_none());
    }
}
