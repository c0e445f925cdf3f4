//! Framing-independent control-plane dispatch: line-delimited JSON
//! requests in, JSON responses/acks out (spec §4.5, §6 parameter table).
//!
//! Both [`super::uasp`] and [`super::uasp2`] parse a line into a
//! [`ControlRequest`] and hand it to [`handle`] along with whatever
//! framing-specific context (destination tracking, odata support) they
//! carry; the two daemons differ only in transport, not in command
//! semantics.

use std::net::SocketAddr;

use log::warn;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::ClientLink;
use crate::params::ParamValue;

/// One parsed control-plane request (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlRequest {
    Version {
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Ireset {
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Istart {
        port: u16,
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Istop {
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Oclear {
        #[serde(default)]
        id: Option<JsonValue>,
    },
    /// UASP2 only: base64-encoded header-framed DAC data inlined in the
    /// control stream. UASP instead receives DAC data as raw binary
    /// frames on its own socket; see [`super::uasp`].
    Odata {
        data: String,
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Ostart {
        #[serde(default)]
        time: Option<u64>,
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Ostop {
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Get {
        param: String,
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Set {
        param: String,
        value: ParamValue,
        #[serde(default)]
        id: Option<JsonValue>,
    },
    Quit {
        #[serde(default)]
        id: Option<JsonValue>,
    },
}

impl ControlRequest {
    fn id(&self) -> Option<JsonValue> {
        match self {
            Self::Version { id }
            | Self::Ireset { id }
            | Self::Istart { id, .. }
            | Self::Istop { id }
            | Self::Oclear { id }
            | Self::Odata { id, .. }
            | Self::Ostart { id, .. }
            | Self::Ostop { id }
            | Self::Get { id, .. }
            | Self::Set { id, .. }
            | Self::Quit { id } => id.clone(),
        }
    }
}

/// Accumulates DAC samples pushed in by `odata` between `oclear`/`ostart`
/// calls (spec §4.5); shared between the control handler and the
/// framing-specific binary-socket receiver in UASP.
pub struct DacBuffer {
    samples: Mutex<Vec<f32>>,
    obufsize: usize,
}

impl DacBuffer {
    pub fn new(obufsize: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            obufsize,
        }
    }

    /// Appends samples, dropping and logging a warning if the buffer
    /// would exceed `obufsize` (spec §8 Open Question: drop-and-warn).
    pub fn append(&self, new_samples: &[f32]) {
        let mut buf = self.samples.lock();
        if buf.len() + new_samples.len() > self.obufsize {
            warn!(
                "[Uasp] DAC buffer overflow: dropping incoming data ({} + {} > obufsize {})",
                buf.len(),
                new_samples.len(),
                self.obufsize
            );
            return;
        }
        buf.extend_from_slice(new_samples);
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Removes and returns everything currently buffered.
    pub fn take(&self) -> Vec<f32> {
        std::mem::take(&mut *self.samples.lock())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destination tracking for the ADC push channel, set by `istart` and
/// cleared by `istop`. UASP resolves this to a UDP peer address; UASP2
/// only needs the boolean streaming flag since data rides the same TCP
/// connection.
pub trait StreamDestination: Send + Sync {
    fn start(&self, addr: SocketAddr);
    fn stop(&self);
}

/// Dispatches one parsed request, returning the JSON response line to
/// write back, or `None` when the action has no response (spec §7:
/// unknown `get` params and malformed/unrecognized actions get no
/// reply).
///
/// `sender` is the UDP/TCP peer `istart` should bind the data push to;
/// `supports_odata` gates the UASP2-only inline DAC-data action.
pub async fn handle(
    req: ControlRequest,
    sender: SocketAddr,
    link: &dyn ClientLink,
    dac: &DacBuffer,
    dest: &dyn StreamDestination,
    supports_odata: bool,
) -> Option<JsonValue> {
    let id = req.id();
    let name = action_name(&req);
    let ack = |extra: JsonValue| {
        let mut obj = json!({ "action": name });
        if let (Some(id), JsonValue::Object(map)) = (&id, &mut obj) {
            map.insert("id".to_string(), id.clone());
        }
        if let (JsonValue::Object(map), JsonValue::Object(extra_map)) = (&mut obj, extra) {
            for (k, v) in extra_map {
                map.insert(k, v);
            }
        }
        obj
    };

    match req {
        ControlRequest::Version { .. } => Some(ack(json!({
            "name": super::APP_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": super::PROTOCOL_VERSION,
        }))),
        ControlRequest::Ireset { .. } => {
            link.set("iseqno", ParamValue::Int(0));
            Some(ack(json!({})))
        }
        ControlRequest::Istart { port, .. } => {
            dest.start(SocketAddr::new(sender.ip(), port));
            Some(ack(json!({})))
        }
        ControlRequest::Istop { .. } => {
            dest.stop();
            Some(ack(json!({})))
        }
        ControlRequest::Oclear { .. } => {
            dac.clear();
            Some(ack(json!({})))
        }
        ControlRequest::Odata { data, .. } => {
            if !supports_odata {
                warn!("[Uasp] odata action received on a framing that does not support it");
                return None;
            }
            match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &data) {
                Ok(bytes) => match super::decode_frame(&bytes) {
                    Some((_, samples)) => {
                        dac.append(&samples);
                        Some(ack(json!({})))
                    }
                    None => {
                        warn!("[Uasp2] malformed odata frame, ignoring");
                        None
                    }
                },
                Err(e) => {
                    warn!("[Uasp2] odata base64 decode failed: {e}");
                    None
                }
            }
        }
        ControlRequest::Ostart { time, .. } => {
            let flat = dac.take();
            let ochannels = link.ochannels().max(1);
            let usable = (flat.len() / ochannels) * ochannels;
            if usable < flat.len() {
                warn!(
                    "[Uasp] ostart: dropping {} trailing sample(s) not a multiple of ochannels={ochannels}",
                    flat.len() - usable
                );
            }
            if usable == 0 {
                return Some(ack(json!({})));
            }
            // Reshape the flat channel-interleaved buffer
            // [c0t0,c1t0,...,c(ochannels-1)t0, c0t1,...] into one column
            // per channel (spec §9, "DAC channel reshape ambiguity").
            let n_samples = usable / ochannels;
            let mut columns = vec![Vec::with_capacity(n_samples); ochannels];
            for t in 0..n_samples {
                for c in 0..ochannels {
                    columns[c].push(flat[t * ochannels + c]);
                }
            }
            let block = crate::propagation::SampleMatrix::from_columns(columns);

            let t_request = match time {
                Some(0) | None => link.now_sample(),
                Some(us) => ((us as f64) * link.irate() / 1_000_000.0).round() as i64,
            };
            let t_start = link.transmit(t_request, block, id.clone()).await;
            Some(ack(json!({ "t_start": t_start })))
        }
        ControlRequest::Ostop { .. } => Some(ack(json!({}))),
        ControlRequest::Get { param, .. } => link.get(&param).map(|value| ack(json!({ "param": param, "value": value }))),
        ControlRequest::Set { param, value, .. } => {
            link.set(&param, value);
            Some(ack(json!({})))
        }
        ControlRequest::Quit { .. } => Some(ack(json!({}))),
    }
}

fn action_name(req: &ControlRequest) -> &'static str {
    match req {
        ControlRequest::Version { .. } => "version",
        ControlRequest::Ireset { .. } => "ireset",
        ControlRequest::Istart { .. } => "istart",
        ControlRequest::Istop { .. } => "istop",
        ControlRequest::Oclear { .. } => "oclear",
        ControlRequest::Odata { .. } => "odata",
        ControlRequest::Ostart { .. } => "ostart",
        ControlRequest::Ostop { .. } => "ostop",
        ControlRequest::Get { .. } => "get",
        ControlRequest::Set { .. } => "set",
        ControlRequest::Quit { .. } => "quit",
    }
}
