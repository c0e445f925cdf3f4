//! TransmitPipeline: turns one `ostart` burst into tape contributions on
//! every other node plus a pair of scheduled `ostart`/`ostop` events (spec
//! §4.4).
//!
//! Steps 1-6 (mute check, decimation, geometry, channel lookup, gain
//! scaling, `t_start` clamp) and steps 7-8 (tape writes, timer scheduling)
//! all run inline on the calling task rather than handing off to a worker
//! pool: the simplest discipline that still satisfies spec §4.4's
//! ordering guarantee ("the returned `t_start` is observable" before any
//! later request can race it). Spec §9 leaves the choice open; see
//! DESIGN.md.

use std::sync::Arc;

use log::warn;
use serde_json::Value as JsonValue;

use crate::clock::{SimClock, TimerList};
use crate::node::Node;
use crate::propagation::{Position, PropagationAdapter, SampleMatrix};

/// Processing headroom added to `t_request_sample` so a transmission
/// requested for "now" still has time to resolve the propagation model
/// before the scheduler reaches that sample (spec §4.4 step 6,
/// `time_samples(txdelay)`; `txdelay` itself is never pinned down
/// elsewhere in the source material, so this picks a conservative fixed
/// 5ms -- see DESIGN.md).
const TX_HEADROOM_SECS: f64 = 0.005;

fn tx_headroom_samples(irate: f64) -> i64 {
    (TX_HEADROOM_SECS * irate).round() as i64
}

/// Subsamples every column of `x` by `factor`, no anti-alias filtering
/// (spec §4.4 step 2, "simple subsampling").
fn decimate(x: &SampleMatrix, factor: usize) -> SampleMatrix {
    if factor <= 1 {
        return x.clone();
    }
    let columns: Vec<Vec<f32>> = (0..x.n_channels())
        .map(|c| x.column(c).into_iter().step_by(factor).collect())
        .collect();
    SampleMatrix::from_columns(columns)
}

/// Drives one DAC burst from `ostart` through the propagation model onto
/// every other node's tapes.
pub struct TransmitPipeline {
    propagation: Arc<PropagationAdapter>,
    timers: Arc<TimerList>,
    clock: Arc<SimClock>,
    irate: f64,
    orate: f64,
    txref: f64,
    rxref: f64,
}

impl TransmitPipeline {
    pub fn new(
        propagation: Arc<PropagationAdapter>,
        timers: Arc<TimerList>,
        clock: Arc<SimClock>,
        irate: f64,
        orate: f64,
        txref: f64,
        rxref: f64,
    ) -> Self {
        Self {
            propagation,
            timers,
            clock,
            irate,
            orate,
            txref,
            rxref,
        }
    }

    /// Runs the pipeline for `node`'s burst `x`, delivering to every node
    /// in `other_nodes` (already excludes `node` itself, spec §4.4
    /// "Mute & half-duplex"). Returns the resolved start sample.
    pub async fn transmit(
        &self,
        node: &Arc<Node>,
        other_nodes: &[Arc<Node>],
        t_request_sample: i64,
        x: SampleMatrix,
        id: Option<JsonValue>,
    ) -> i64 {
        if node.is_muted() {
            return self.clock.sample();
        }

        let nsamp_dac = x.n_samples();
        let x = if (self.orate - self.irate).abs() > f64::EPSILON {
            let factor = (self.orate / self.irate).round().max(1.0) as usize;
            decimate(&x, factor)
        } else {
            x
        };

        let tx_positions: Vec<Position> = (0..x.n_channels()).map(|ch| node.tx_position(ch)).collect();
        let rx_positions: Vec<Position> = other_nodes.iter().flat_map(|n| n.all_rx_positions()).collect();

        let now_sample = self.clock.sample();
        let t_start = t_request_sample.max(now_sample + tx_headroom_samples(self.irate));

        let channel = match self.propagation.channel(&tx_positions, &rx_positions, self.irate).await {
            Ok(c) => c,
            Err(e) => {
                warn!("[Transmit] propagation model rejected request, dropping burst: {e}");
                return t_start;
            }
        };

        let tx_gain = 10f32.powf(((self.txref + node.ogain()) / 20.0) as f32);
        let mut scaled = x;
        scaled.scale(tx_gain);

        let result = match channel.apply(&scaled, self.irate).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[Transmit] channel apply failed, dropping burst: {e}");
                return t_start;
            }
        };

        let late_ms = (self.clock.sample() - t_start) as f64 / self.irate * 1000.0;
        if late_ms > 1.0 {
            warn!("[Transmit] result for t_start={t_start} arrived {late_ms:.1}ms late");
        }

        let mut col = 0;
        for n in other_nodes {
            for tape in &n.tapes {
                if col < result.n_channels() {
                    let rx_gain = 10f32.powf(((self.rxref + n.igain()) / 20.0) as f32);
                    let mut samples = result.column(col);
                    for s in &mut samples {
                        *s *= rx_gain;
                    }
                    tape.append(t_start, samples);
                }
                col += 1;
            }
        }

        let duration_samples = (nsamp_dac as f64 * self.irate / self.orate).round() as i64;
        let t_stop = t_start + duration_samples;
        let irate = self.irate;

        let daemon = Arc::clone(&node.daemon);
        let id_start = id.clone();
        self.timers.schedule(t_start, move |t_fire| {
            let daemon = Arc::clone(&daemon);
            async move {
                let t_us = (t_fire as f64 / irate * 1_000_000.0).round() as u64;
                daemon.event(t_us, "ostart", id_start).await;
            }
        });

        let daemon = Arc::clone(&node.daemon);
        self.timers.schedule(t_stop, move |t_fire| {
            let daemon = Arc::clone(&daemon);
            async move {
                let t_us = (t_fire as f64 / irate * 1_000_000.0).round() as u64;
                daemon.event(t_us, "ostop", id).await;
            }
        });

        t_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::propagation::test_support::CountingModel;
    use crate::protocol::test_support::NoopDaemon;

    fn node(position: Position, ochannels: usize, daemon: Arc<dyn crate::protocol::ProtocolDaemon>) -> Arc<Node> {
        Arc::new(Node::new(
            NodeConfig {
                position,
                relpos: vec![[0.0, 0.0, 0.0]],
                ochannels,
                igain: 0.0,
                ogain: 0.0,
                obufsize: 1_920_000,
            },
            daemon,
        ))
    }

    #[tokio::test]
    async fn transmission_reaches_other_node_delayed_and_scaled() {
        // Mirrors scenario S3: two nodes 1000m apart, irate=96000 so a
        // 1500 m/s path delay of 1000m/1500 gives 64000 ADC samples.
        let irate = 96000.0;
        let orate = 96000.0;
        let txref = 185.0;
        let rxref = -190.0;

        let model = Arc::new(CountingModel::new(64_000));
        let propagation = Arc::new(PropagationAdapter::new(model, false));
        let timers = Arc::new(TimerList::new());
        let clock = Arc::new(SimClock::new());
        clock.start();

        let pipeline = TransmitPipeline::new(propagation, timers, clock, irate, orate, txref, rxref);

        let tx_node = node([0.0, 0.0, -1.0], 1, Arc::new(NoopDaemon));
        let rx_node = node([1000.0, 0.0, -1.0], 1, Arc::new(NoopDaemon));

        let mut impulse = vec![0.0f32; 1000];
        impulse[0] = 1.0;
        let burst = SampleMatrix::from_columns(vec![impulse]);

        let t_start = pipeline.transmit(&tx_node, &[rx_node.clone()], 0, burst, None).await;

        let expected_gain = 10f32.powf(((txref + rxref) / 20.0) as f32);
        let out = rx_node.tapes[0].read(t_start + 64_000, 1, false);
        assert_eq!(out[0], expected_gain.clamp(-1.0, 1.0));
    }

    #[tokio::test]
    async fn transmitting_node_does_not_receive_its_own_burst() {
        let irate = 96000.0;
        let model = Arc::new(CountingModel::new(0));
        let propagation = Arc::new(PropagationAdapter::new(model, false));
        let timers = Arc::new(TimerList::new());
        let clock = Arc::new(SimClock::new());
        clock.start();

        let pipeline = TransmitPipeline::new(propagation, timers, clock, irate, irate, 185.0, -190.0);
        let tx_node = node([0.0, 0.0, -1.0], 1, Arc::new(NoopDaemon));

        let burst = SampleMatrix::from_columns(vec![vec![1.0; 10]]);
        pipeline.transmit(&tx_node, &[], 0, burst, None).await;

        assert!(tx_node.tapes[0].is_empty());
    }

    #[tokio::test]
    async fn muted_node_returns_now_without_scheduling() {
        let irate = 96000.0;
        let model = Arc::new(CountingModel::new(0));
        let propagation = Arc::new(PropagationAdapter::new(model, false));
        let timers = Arc::new(TimerList::new());
        let clock = Arc::new(SimClock::new());
        clock.start();
        clock.advance(500);

        let pipeline = TransmitPipeline::new(propagation, timers.clone(), clock.clone(), irate, irate, 185.0, -190.0);
        let tx_node = node([0.0, 0.0, -1.0], 1, Arc::new(NoopDaemon));
        tx_node.mute.store(true, std::sync::atomic::Ordering::Relaxed);

        let burst = SampleMatrix::from_columns(vec![vec![1.0; 10]]);
        let t_start = pipeline.transmit(&tx_node, &[], 100, burst, None).await;

        assert_eq!(t_start, clock.sample());
        assert!(timers.is_empty());
    }

    #[tokio::test]
    async fn decimates_when_orate_exceeds_irate() {
        let irate = 96000.0;
        let orate = 192000.0;
        let model = Arc::new(CountingModel::new(0));
        let propagation = Arc::new(PropagationAdapter::new(model, false));
        let timers = Arc::new(TimerList::new());
        let clock = Arc::new(SimClock::new());
        clock.start();

        let pipeline = TransmitPipeline::new(propagation, timers, clock, irate, orate, 185.0, -190.0);
        let tx_node = node([0.0, 0.0, -1.0], 1, Arc::new(NoopDaemon));
        let rx_node = node([10.0, 0.0, -1.0], 1, Arc::new(NoopDaemon));

        let burst = SampleMatrix::from_columns(vec![vec![1.0; 20]]);
        pipeline.transmit(&tx_node, &[rx_node.clone()], 0, burst, None).await;

        assert_eq!(rx_node.tapes[0].len(), 1);
    }
}
