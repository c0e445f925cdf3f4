//! Dedicated-thread scheduler: paces simulated sample time against wall
//! clock and drives per-node ADC block production plus timer callbacks
//! (spec §4.2).
//!
//! The scheduler runs on its own `std::thread` rather than a `tokio`
//! task so its sleep-until-deadline loop has predictable latency
//! independent of the async runtime's scheduling (spec §5, "one
//! dedicated scheduler thread"). It bridges into the (async)
//! `ProtocolDaemon::stream`/`event` calls via a captured
//! `tokio::runtime::Handle`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::node::Node;
use crate::noise::NoiseSource;
use crate::propagation::SampleMatrix;

/// Budget (bytes, roughly) a single ADC data packet should stay under,
/// used by the auto block-size heuristic (spec §4.2, "Auto block size").
const AUTO_BLKSIZE_BUDGET: usize = 353;
const AUTO_BLKSIZE_MAX: usize = 256;

/// `iblksize = min(floor(353 / maxch), 256)` when the configuration
/// leaves `iblksize` at `0`.
pub fn auto_iblksize(max_hydrophone_count: usize) -> usize {
    let by_budget = AUTO_BLKSIZE_BUDGET / max_hydrophone_count.max(1);
    by_budget.clamp(1, AUTO_BLKSIZE_MAX)
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TimerCallback = Box<dyn FnOnce(i64) -> BoxFuture + Send>;

struct TimerEntry {
    t_fire: i64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.t_fire == other.t_fire
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.t_fire.cmp(&other.t_fire)
    }
}

/// Ascending-`t_fire` timer queue, mutated by transmit (`schedule`) and
/// popped by the scheduler (spec §5, "Timers list ... protect with a
/// mutex; maintain ascending order by `t_fire`").
#[derive(Default)]
pub struct TimerList {
    entries: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to fire once `t_fire` has passed. The
    /// callback returns a future (typically `ProtocolDaemon::event`) that
    /// the scheduler drives to completion on the thread that pops it.
    pub fn schedule<F, Fut>(&self, t_fire: i64, callback: F)
    where
        F: FnOnce(i64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entries.lock().push(Reverse(TimerEntry {
            t_fire,
            callback: Box::new(move |t| Box::pin(callback(t))),
        }));
    }

    /// Pops every entry with `t_fire <= t`, ascending.
    fn drain_due(&self, t: i64) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        let mut guard = self.entries.lock();
        while matches!(guard.peek(), Some(Reverse(e)) if e.t_fire <= t) {
            if let Some(Reverse(e)) = guard.pop() {
                due.push(e);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every pending entry without invoking it (spec §3, "On
    /// close, timers are discarded").
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Wall-clock epoch plus simulated sample index (spec §3, "SimTask /
/// Clock").
pub struct SimClock {
    t0: Mutex<Option<Instant>>,
    t: AtomicI64,
    running: AtomicBool,
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            t0: Mutex::new(None),
            t: AtomicI64::new(0),
            running: AtomicBool::new(false),
        }
    }

    fn start(&self) {
        *self.t0.lock() = Some(Instant::now());
        self.t.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    /// Clears `t0` and `t`, causing the scheduler loop to exit at its
    /// next check (spec §4.2, "Cancellation").
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.t0.lock() = None;
        self.t.store(0, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sample(&self) -> i64 {
        self.t.load(Ordering::SeqCst)
    }

    pub fn seconds(&self, irate: f64) -> f64 {
        self.sample() as f64 / irate
    }

    fn anchor(&self) -> Option<Instant> {
        *self.t0.lock()
    }

    fn advance(&self, by: i64) -> i64 {
        self.t.fetch_add(by, Ordering::SeqCst) + by
    }
}

/// Drives simulated time forward in fixed ADC blocks (spec §4.2).
pub struct Scheduler {
    clock: Arc<SimClock>,
    timers: Arc<TimerList>,
    nodes: Vec<Arc<Node>>,
    irate: f64,
    iblksize: usize,
    rxref: f64,
    noise: Arc<dyn NoiseSource>,
    runtime: tokio::runtime::Handle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<SimClock>,
        timers: Arc<TimerList>,
        nodes: Vec<Arc<Node>>,
        irate: f64,
        iblksize: usize,
        rxref: f64,
        noise: Arc<dyn NoiseSource>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            clock,
            timers,
            nodes,
            irate,
            iblksize,
            rxref,
            noise,
            runtime,
            join: Mutex::new(None),
        }
    }

    /// Starts the dedicated scheduler thread. `self` must already be
    /// wrapped in an `Arc` so the spawned thread can hold a clone.
    pub fn start(self: &Arc<Self>) {
        self.clock.start();
        let sched = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("vaocean-scheduler".into())
            .spawn(move || sched.run_loop())
            .expect("failed to spawn scheduler thread");
        *self.join.lock() = Some(handle);
    }

    /// Stops the clock and joins the scheduler thread.
    pub fn close(&self) {
        self.clock.stop();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self) {
        let Some(t0) = self.clock.anchor() else {
            return;
        };

        while self.clock.is_running() {
            let t = self.clock.sample();
            let deadline = t0 + Duration::from_secs_f64(t as f64 / self.irate);
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            } else {
                let late_ms = (now - deadline).as_secs_f64() * 1000.0;
                if late_ms > 1.0 {
                    warn!("[Clock] t={t} running {late_ms:.1}ms behind schedule");
                }
            }

            if !self.clock.is_running() {
                break;
            }

            for node in &self.nodes {
                self.tick_node(node, t);
            }

            let new_t = self.clock.advance(self.iblksize as i64);
            for entry in self.timers.drain_due(new_t) {
                self.runtime.block_on((entry.callback)(new_t));
            }
        }
    }

    fn tick_node(&self, node: &Arc<Node>, t: i64) {
        let noise_gain = 10f32.powf((self.rxref / 20.0) as f32);
        let mut columns = Vec::with_capacity(node.hydrophone_count());
        for tape in &node.tapes {
            let mut samples = tape.read(t, self.iblksize, true);
            let noise = self.noise.sample(self.iblksize, self.irate);
            for (s, n) in samples.iter_mut().zip(noise.iter()) {
                *s = (*s + n * noise_gain).clamp(-1.0, 1.0);
            }
            columns.push(samples);
        }
        let block = SampleMatrix::from_columns(columns);
        let t_us = (t as f64 / self.irate * 1_000_000.0).round() as u64;
        let seqno = node.next_seqno() as u32;
        let daemon = Arc::clone(&node.daemon);
        self.runtime.block_on(daemon.stream(t_us, seqno, &block));
    }
}
