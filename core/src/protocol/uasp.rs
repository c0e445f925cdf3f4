//! UASP framing: UDP command socket (line-delimited JSON) plus a
//! separate UDP data socket carrying raw header-framed binary frames in
//! both directions (spec §4.5).
//!
//! `odata` has no JSON form here; a client pushes DAC data as raw
//! datagrams on the data socket instead, so [`control::handle`] is
//! always called with `supports_odata = false` for this framing.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::control::{self, DacBuffer, StreamDestination};
use super::{ClientLink, FrameHeader};
use crate::error::{VaoError, VaoResult};
use crate::propagation::SampleMatrix;

const MAX_DATAGRAM: usize = 65_507;

struct Destination(Mutex<Option<SocketAddr>>);

impl StreamDestination for Destination {
    fn start(&self, addr: SocketAddr) {
        *self.0.lock() = Some(addr);
    }
    fn stop(&self) {
        *self.0.lock() = None;
    }
}

/// UASP daemon for one node: `control_bind` serves the JSON command
/// channel, `data_bind` serves raw binary DAC-in / ADC-out frames.
pub struct UaspDaemon {
    control_bind: SocketAddr,
    data_bind: SocketAddr,
    obufsize: usize,
    control_sock: tokio::sync::OnceCell<Arc<UdpSocket>>,
    data_sock: tokio::sync::OnceCell<Arc<UdpSocket>>,
    dac: DacBuffer,
    destination: Destination,
    last_control_peer: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl UaspDaemon {
    pub fn new(control_bind: SocketAddr, data_bind: SocketAddr, obufsize: usize) -> Self {
        Self {
            control_bind,
            data_bind,
            obufsize,
            control_sock: tokio::sync::OnceCell::new(),
            data_sock: tokio::sync::OnceCell::new(),
            dac: DacBuffer::new(obufsize),
            destination: Destination(Mutex::new(None)),
            last_control_peer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn control_loop(&self, link: Arc<dyn ClientLink>, sock: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                recvd = sock.recv_from(&mut buf) => {
                    let (n, peer) = match recvd {
                        Ok(v) => v,
                        Err(e) => { warn!("[Uasp] control recv error: {e}"); continue; }
                    };
                    *self.last_control_peer.lock() = Some(peer);
                    let line = String::from_utf8_lossy(&buf[..n]);
                    let req: control::ControlRequest = match serde_json::from_str(line.trim()) {
                        Ok(r) => r,
                        Err(e) => { debug!("[Uasp] malformed control line from {peer}: {e}"); continue; }
                    };
                    if let Some(resp) = control::handle(req, peer, link.as_ref(), &self.dac, &self.destination, false).await {
                        self.send_control(&sock, peer, &resp).await;
                    }
                }
            }
        }
    }

    async fn data_loop(&self, sock: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                recvd = sock.recv_from(&mut buf) => {
                    let (n, _peer) = match recvd {
                        Ok(v) => v,
                        Err(e) => { warn!("[Uasp] data recv error: {e}"); continue; }
                    };
                    match super::decode_frame(&buf[..n]) {
                        Some((_, samples)) => self.dac.append(&samples),
                        None => debug!("[Uasp] dropped undersized/malformed data frame ({n} bytes)"),
                    }
                }
            }
        }
    }

    async fn send_control(&self, sock: &UdpSocket, peer: SocketAddr, payload: &JsonValue) {
        let mut line = payload.to_string();
        line.push('\n');
        if let Err(e) = sock.send_to(line.as_bytes(), peer).await {
            warn!("[Uasp] failed to send control response to {peer}: {e}");
        }
    }
}

#[async_trait]
impl super::ProtocolDaemon for UaspDaemon {
    async fn run(&self, link: Arc<dyn ClientLink>) -> VaoResult<()> {
        let control_sock = Arc::new(
            UdpSocket::bind(self.control_bind)
                .await
                .map_err(VaoError::Bind)?,
        );
        let data_sock = Arc::new(UdpSocket::bind(self.data_bind).await.map_err(VaoError::Bind)?);
        info!(
            "[Uasp] bound control={} data={} (obufsize={})",
            self.control_bind, self.data_bind, self.obufsize
        );
        let _ = self.control_sock.set(control_sock.clone());
        let _ = self.data_sock.set(data_sock.clone());

        let control_link = link.clone();
        // SAFETY-free note: these futures borrow `self` for the daemon's
        // lifetime, which the caller keeps alive in an `Arc` for as long
        // as the simulation runs.
        let control_fut = self.control_loop(control_link, control_sock);
        let data_fut = self.data_loop(data_sock);
        tokio::join!(control_fut, data_fut);
        Ok(())
    }

    async fn stream(&self, t_us: u64, seqno: u32, block: &SampleMatrix) {
        let Some(dest) = *self.destination.0.lock() else {
            return;
        };
        let Some(sock) = self.data_sock.get() else {
            return;
        };
        let header = FrameHeader {
            timestamp_us: t_us,
            seqno,
            nsamples: block.n_samples() as u16,
            nchannels: block.n_channels() as u16,
        };
        let bytes = super::encode_frame(&header, block);
        if let Err(e) = sock.send_to(&bytes, dest).await {
            warn!("[Uasp] failed to stream ADC frame to {dest}: {e}");
        }
    }

    async fn event(&self, t_us: u64, event_name: &str, id: Option<JsonValue>) {
        let Some(sock) = self.control_sock.get() else {
            return;
        };
        let Some(peer) = *self.last_control_peer.lock() else {
            return;
        };
        let mut payload = json!({ "event": event_name, "time": t_us });
        if let (Some(id), JsonValue::Object(map)) = (id, &mut payload) {
            map.insert("id".to_string(), id);
        }
        self.send_control(sock, peer, &payload).await;
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_starts_unset_and_tracks_last_istart() {
        let dest = Destination(Mutex::new(None));
        assert!(dest.0.lock().is_none());
        let addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        dest.start(addr);
        assert_eq!(*dest.0.lock(), Some(addr));
        dest.stop();
        assert!(dest.0.lock().is_none());
    }
}
