//! UASP2 framing: a single TCP connection carries line-delimited JSON
//! control messages, including inline base64 `odata`; a UDP socket
//! pushes ADC `stream` frames out to the address `istart` records
//! (spec §4.5).
//!
//! Only one client connection is served at a time per node, matching
//! the one-node-one-client deployment model the other scenarios assume;
//! a new connection replaces whatever writer handle is currently stored.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::control::{self, DacBuffer, StreamDestination};
use super::{ClientLink, FrameHeader};
use crate::error::{VaoError, VaoResult};
use crate::propagation::SampleMatrix;

struct Destination(Mutex<Option<SocketAddr>>);

impl StreamDestination for Destination {
    fn start(&self, addr: SocketAddr) {
        *self.0.lock() = Some(addr);
    }
    fn stop(&self) {
        *self.0.lock() = None;
    }
}

type Writer = tokio::net::tcp::OwnedWriteHalf;

/// UASP2 daemon for one node: `control_bind` accepts the TCP client
/// connection, `data_bind` sends UDP ADC frames.
pub struct Uasp2Daemon {
    control_bind: SocketAddr,
    data_bind: SocketAddr,
    obufsize: usize,
    dac: DacBuffer,
    destination: Destination,
    /// A `tokio::sync::Mutex`, not `parking_lot`: the guard is held
    /// across the socket write's `.await`.
    writer: tokio::sync::Mutex<Option<Writer>>,
    data_sock: tokio::sync::OnceCell<Arc<UdpSocket>>,
    cancel: CancellationToken,
}

impl Uasp2Daemon {
    pub fn new(control_bind: SocketAddr, data_bind: SocketAddr, obufsize: usize) -> Self {
        Self {
            control_bind,
            data_bind,
            obufsize,
            dac: DacBuffer::new(obufsize),
            destination: Destination(Mutex::new(None)),
            writer: tokio::sync::Mutex::new(None),
            data_sock: tokio::sync::OnceCell::new(),
            cancel: CancellationToken::new(),
        }
    }

    async fn accept_loop(&self, link: Arc<dyn ClientLink>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => { warn!("[Uasp2] accept error: {e}"); continue; }
                    };
                    info!("[Uasp2] client connected from {peer}");
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    self.connection_loop(link.clone(), read_half, peer).await;
                }
            }
        }
    }

    async fn connection_loop(
        &self,
        link: Arc<dyn ClientLink>,
        read_half: tokio::net::tcp::OwnedReadHalf,
        peer: SocketAddr,
    ) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = lines.next_line() => {
                    let line = match next {
                        Ok(Some(l)) => l,
                        Ok(None) => { info!("[Uasp2] client {peer} disconnected"); return; }
                        Err(e) => { warn!("[Uasp2] read error from {peer}: {e}"); return; }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let req: control::ControlRequest = match serde_json::from_str(line.trim()) {
                        Ok(r) => r,
                        Err(e) => { debug!("[Uasp2] malformed control line from {peer}: {e}"); continue; }
                    };
                    if let Some(resp) = control::handle(req, peer, link.as_ref(), &self.dac, &self.destination, true).await {
                        self.send_line(&resp).await;
                    }
                }
            }
        }
    }

    async fn send_line(&self, payload: &JsonValue) {
        let mut line = payload.to_string();
        line.push('\n');
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                warn!("[Uasp2] write failed, dropping connection: {e}");
                *guard = None;
            }
        }
    }
}

#[async_trait]
impl super::ProtocolDaemon for Uasp2Daemon {
    async fn run(&self, link: Arc<dyn ClientLink>) -> VaoResult<()> {
        let listener = TcpListener::bind(self.control_bind).await.map_err(VaoError::Bind)?;
        let data_sock = Arc::new(UdpSocket::bind(self.data_bind).await.map_err(VaoError::Bind)?);
        info!(
            "[Uasp2] bound control={} data={} (obufsize={})",
            self.control_bind, self.data_bind, self.obufsize
        );
        let _ = self.data_sock.set(data_sock);
        self.accept_loop(link, listener).await;
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
            warn!("[Uasp2] failed to stream ADC frame to {dest}: {e}");
        }
    }

    async fn event(&self, t_us: u64, event_name: &str, id: Option<JsonValue>) {
        let mut payload = json!({ "event": event_name, "time": t_us });
        if let (Some(id), JsonValue::Object(map)) = (id, &mut payload) {
            map.insert("id".to_string(), id);
        }
        self.send_line(&payload).await;
    }

    fn close(&self) {
        self.cancel.cancel();
        if let Ok(mut guard) = self.writer.try_lock() {
            *guard = None;
        }
    }
}
