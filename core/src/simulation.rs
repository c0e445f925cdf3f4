//! Simulation orchestrator: the composition root that wires nodes, the
//! scheduler, and the transmit pipeline together and owns their shared
//! lifecycle (spec §2 "Simulation Orchestrator"; spec §3 "Lifecycle").
//!
//! Mirrors the teacher's `bootstrap::bootstrap_services` composition-root
//! pattern: one place builds every collaborator and exposes a single
//! `run`/`close` lifecycle, rather than spreading construction across the
//! call sites that use the pieces.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;

use crate::clock::{auto_iblksize, SimClock, Scheduler, TimerList};
use crate::config::SimulationConfig;
use crate::error::{VaoError, VaoResult};
use crate::node::{Node, NodeConfig};
use crate::noise::NoiseSource;
use crate::params::ParamValue;
use crate::propagation::{PropagationAdapter, PropagationModel, SampleMatrix};
use crate::protocol::{ClientLink, ProtocolDaemon};
use crate::transmit::TransmitPipeline;

/// Simulated-time and transport glue for one node, plus the pieces every
/// node shares (spec §3 "Simulation").
pub struct Simulation {
    config: SimulationConfig,
    nodes: RwLock<Vec<Arc<Node>>>,
    clock: Arc<SimClock>,
    timers: Arc<TimerList>,
    propagation: Arc<PropagationAdapter>,
    transmit: Arc<TransmitPipeline>,
    noise: Arc<dyn NoiseSource>,
    runtime: tokio::runtime::Handle,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    /// Effective block size, resolved once at `run()` from
    /// `config.iblksize` or the auto heuristic (spec §4.2).
    iblksize: AtomicUsize,
    running: AtomicBool,
}

impl Simulation {
    /// Builds a simulation from validated configuration. Returns a
    /// configuration error if `orate` is not an integer multiple of
    /// `irate` (spec §8 invariant 6).
    pub fn new(
        config: SimulationConfig,
        model: Arc<dyn PropagationModel>,
        noise: Arc<dyn NoiseSource>,
        runtime: tokio::runtime::Handle,
    ) -> VaoResult<Arc<Self>> {
        config.validate()?;
        let clock = Arc::new(SimClock::new());
        let timers = Arc::new(TimerList::new());
        let propagation = Arc::new(PropagationAdapter::new(model, config.mobility));
        let transmit = Arc::new(TransmitPipeline::new(
            Arc::clone(&propagation),
            Arc::clone(&timers),
            Arc::clone(&clock),
            config.irate(),
            config.orate(),
            config.txref,
            config.rxref,
        ));
        Ok(Arc::new(Self {
            config,
            nodes: RwLock::new(Vec::new()),
            clock,
            timers,
            propagation,
            transmit,
            noise,
            runtime,
            scheduler: Mutex::new(None),
            iblksize: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }))
    }

    pub fn irate(&self) -> f64 {
        self.config.irate()
    }

    pub fn orate(&self) -> f64 {
        self.config.orate()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current simulated sample index.
    pub fn sample(&self) -> i64 {
        self.clock.sample()
    }

    /// Adds a node to the simulation. Refused once `run` has been called
    /// (spec §4.3, "A second call to `addNode` after `run` is refused";
    /// spec §3, "immutability of node set while running").
    pub fn add_node(
        &self,
        config: NodeConfig,
        daemon: Arc<dyn ProtocolDaemon>,
    ) -> VaoResult<Arc<Node>> {
        if self.running.load(Ordering::SeqCst) {
            return Err(VaoError::Configuration(
                "addNode refused: simulation is already running".into(),
            ));
        }
        let node = Arc::new(Node::new(config, daemon));
        self.nodes.write().push(Arc::clone(&node));
        Ok(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Binds every node's daemon, starts the scheduler, and begins
    /// pacing simulated time against wall clock (spec §4.2, §5).
    pub fn run(self: &Arc<Self>) -> VaoResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let nodes = self.nodes.read().clone();
        let max_hydrophones = nodes.iter().map(|n| n.hydrophone_count()).max().unwrap_or(1);
        let iblksize = if self.config.iblksize == 0 {
            auto_iblksize(max_hydrophones)
        } else {
            self.config.iblksize
        };
        self.iblksize.store(iblksize, Ordering::SeqCst);
        info!(
            "[Simulation] starting: nodes={}, irate={}, orate={}, iblksize={}",
            nodes.len(),
            self.irate(),
            self.orate(),
            iblksize
        );

        for node in &nodes {
            let link: Arc<dyn ClientLink> = Arc::new(NodeLink {
                sim: Arc::clone(self),
                node: Arc::clone(node),
            });
            let daemon = Arc::clone(&node.daemon);
            self.runtime.spawn(async move {
                if let Err(e) = daemon.run(link).await {
                    error!("[Simulation] daemon terminated: {e}");
                }
            });
        }

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.clock),
            Arc::clone(&self.timers),
            nodes,
            self.irate(),
            iblksize,
            self.config.rxref,
            Arc::clone(&self.noise),
            self.runtime.clone(),
        ));
        scheduler.start();
        *self.scheduler.lock() = Some(scheduler);
        Ok(())
    }

    /// Stops the scheduler, tears down every daemon, discards timers,
    /// and empties the node list (spec §3, "On close").
    pub fn close(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.close();
        }
        let nodes = self.nodes.write().drain(..).collect::<Vec<_>>();
        for node in &nodes {
            node.daemon.close();
        }
        self.timers.clear();
        self.running.store(false, Ordering::SeqCst);
    }
}

/// The two-way closure between a daemon and its owning node/simulation
/// (spec §9 "Opaque client indirection"): routes `get`/`set` to
/// [`Node::get_param`]/[`Node::set_param`] with simulation-wide values
/// filled in, and `transmit` into [`TransmitPipeline`] with every other
/// node as the receiver set (spec §4.4, "Mute & half-duplex").
struct NodeLink {
    sim: Arc<Simulation>,
    node: Arc<Node>,
}

#[async_trait]
impl ClientLink for NodeLink {
    fn get(&self, key: &str) -> Option<ParamValue> {
        if key == "iblksize" {
            return Some(ParamValue::Int(self.sim.iblksize.load(Ordering::SeqCst) as i64));
        }
        let sim_time_secs = self.sim.clock.seconds(self.sim.irate());
        self.node.get_param(key, self.sim.irate(), self.sim.orate(), sim_time_secs)
    }

    fn set(&self, key: &str, value: ParamValue) {
        self.node.set_param(key, &value);
    }

    fn now_sample(&self) -> i64 {
        self.sim.clock.sample()
    }

    fn irate(&self) -> f64 {
        self.sim.irate()
    }

    fn ochannels(&self) -> usize {
        self.node.ochannels()
    }

    async fn transmit(&self, t_request_sample: i64, x: SampleMatrix, id: Option<JsonValue>) -> i64 {
        let others: Vec<Arc<Node>> = self
            .sim
            .nodes
            .read()
            .iter()
            .filter(|n| !Arc::ptr_eq(n, &self.node))
            .cloned()
            .collect();
        self.sim
            .transmit
            .transmit(&self.node, &others, t_request_sample, x, id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::SilentNoise;
    use crate::propagation::test_support::CountingModel;
    use crate::protocol::test_support::NoopDaemon;

    fn node_config(position: crate::propagation::Position) -> NodeConfig {
        NodeConfig {
            position,
            relpos: vec![[0.0, 0.0, 0.0]],
            ochannels: 1,
            igain: 0.0,
            ogain: 0.0,
            obufsize: 1_920_000,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn add_node_is_refused_after_run() {
        let config = SimulationConfig::new(24000.0);
        let model = Arc::new(CountingModel::new(0));
        let sim = Simulation::new(config, model, Arc::new(SilentNoise), tokio::runtime::Handle::current()).unwrap();
        sim.add_node(node_config([0.0, 0.0, 0.0]), Arc::new(NoopDaemon)).unwrap();
        sim.run().unwrap();

        let result = sim.add_node(node_config([1.0, 0.0, 0.0]), Arc::new(NoopDaemon));
        assert!(matches!(result, Err(VaoError::Configuration(_))));
        sim.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_empties_node_list_and_stops_clock() {
        let config = SimulationConfig::new(24000.0);
        let model = Arc::new(CountingModel::new(0));
        let sim = Simulation::new(config, model, Arc::new(SilentNoise), tokio::runtime::Handle::current()).unwrap();
        sim.add_node(node_config([0.0, 0.0, 0.0]), Arc::new(NoopDaemon)).unwrap();
        sim.run().unwrap();
        assert_eq!(sim.node_count(), 1);

        sim.close();
        assert_eq!(sim.node_count(), 0);
        assert!(!sim.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_iblksize_resolved_from_max_hydrophone_count_at_run() {
        let config = SimulationConfig::new(24000.0); // iblksize left at 0 => auto
        let model = Arc::new(CountingModel::new(0));
        let sim = Simulation::new(config, model, Arc::new(SilentNoise), tokio::runtime::Handle::current()).unwrap();
        let two_hydrophones = NodeConfig {
            relpos: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            ..node_config([0.0, 0.0, 0.0])
        };
        sim.add_node(two_hydrophones, Arc::new(NoopDaemon)).unwrap();
        sim.run().unwrap();

        let link = NodeLink {
            sim: Arc::clone(&sim),
            node: Arc::clone(&sim.nodes.read()[0]),
        };
        assert_eq!(link.get("iblksize"), Some(ParamValue::Int(176))); // floor(353/2)
        sim.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_link_transmit_excludes_the_transmitting_node() {
        let config = SimulationConfig::new(24000.0);
        let model = Arc::new(CountingModel::new(10));
        let sim = Simulation::new(config, model, Arc::new(SilentNoise), tokio::runtime::Handle::current()).unwrap();
        let a = sim.add_node(node_config([0.0, 0.0, 0.0]), Arc::new(NoopDaemon)).unwrap();
        let b = sim.add_node(node_config([100.0, 0.0, 0.0]), Arc::new(NoopDaemon)).unwrap();
        sim.run().unwrap();

        let link = NodeLink {
            sim: Arc::clone(&sim),
            node: Arc::clone(&a),
        };
        let burst = SampleMatrix::from_columns(vec![vec![1.0; 10]]);
        link.transmit(0, burst, None).await;

        assert!(a.tapes[0].is_empty(), "transmitting node must not receive its own burst");
        assert_eq!(b.tapes[0].len(), 1);
        sim.close();
    }
}
