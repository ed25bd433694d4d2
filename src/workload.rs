// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;

use crate::events::Event;
use crate::events::SharedSink;

pub const DEFAULT_MIN_REQUIRED_MEMORY: f64 = 200.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Delay between two CPU usage updates, in milliseconds.
    pub tick_ms: u64,
    pub cpu_min: f64,
    pub cpu_max: f64,
    /// Range the initial memory usage is drawn from, in MB.
    pub initial_memory_min: f64,
    pub initial_memory_max: f64,
    pub min_required_memory: f64,
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            cpu_min: 5.0,
            cpu_max: 30.0,
            initial_memory_min: 100.0,
            initial_memory_max: 500.0,
            min_required_memory: DEFAULT_MIN_REQUIRED_MEMORY,
            seed: None,
        }
    }
}

impl WorkloadConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            bail!("workload tick must be non-zero");
        }
        if !(0.0..=100.0).contains(&self.cpu_min) || self.cpu_max < self.cpu_min {
            bail!("invalid cpu range [{}, {}]", self.cpu_min, self.cpu_max);
        }
        if self.initial_memory_min < 0.0 || self.initial_memory_max < self.initial_memory_min {
            bail!(
                "invalid initial memory range [{}, {}]",
                self.initial_memory_min,
                self.initial_memory_max
            );
        }
        if self.min_required_memory < 0.0 {
            bail!("min_required_memory must not be negative");
        }
        Ok(())
    }
}

fn uniform<R: Rng>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

/// Fields guarded by a workload's lock. Anyone reading or writing these must
/// hold the guard returned by [`Workload::lock`].
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadState {
    /// Percentage of a CPU, rewritten on every tick of the mutation loop.
    pub cpu_usage: f64,
    /// MB, only touched by the allocator once the workload exists.
    pub memory_usage: f64,
    /// MB floor the allocator's threshold policy must respect.
    pub min_required_memory: f64,
    /// Cleared exactly once by [`Workload::stop`] and never set again.
    pub running: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkloadSnapshot {
    pub name: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub min_required_memory: f64,
    pub running: bool,
}

pub struct Workload {
    name: String,
    tick: Duration,
    cpu_range: (f64, f64),
    seed: u64,
    state: Mutex<WorkloadState>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    sink: SharedSink,
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("name", &self.name)
            .field("state", &*self.lock())
            .finish()
    }
}

impl Workload {
    /// Create a workload with a random initial memory usage drawn from
    /// `cfg`'s initial memory range and zero CPU usage.
    pub fn new<R: Rng>(name: &str, cfg: &WorkloadConfig, rng: &mut R, sink: SharedSink) -> Self {
        let memory = uniform(rng, cfg.initial_memory_min, cfg.initial_memory_max);
        let seed = rng.gen();
        Self::build(name, 0.0, memory, seed, cfg, sink)
    }

    /// Create a workload with fixed starting usage figures.
    pub fn with_usage(
        name: &str,
        cpu_usage: f64,
        memory_usage: f64,
        cfg: &WorkloadConfig,
        sink: SharedSink,
    ) -> Self {
        let seed = cfg.seed.unwrap_or_else(rand::random);
        Self::build(name, cpu_usage, memory_usage.max(0.0), seed, cfg, sink)
    }

    fn build(
        name: &str,
        cpu_usage: f64,
        memory_usage: f64,
        seed: u64,
        cfg: &WorkloadConfig,
        sink: SharedSink,
    ) -> Self {
        Self {
            name: name.to_string(),
            tick: cfg.tick(),
            cpu_range: (cfg.cpu_min, cfg.cpu_max),
            seed,
            state: Mutex::new(WorkloadState {
                cpu_usage,
                memory_usage,
                min_required_memory: cfg.min_required_memory,
                running: true,
            }),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the workload's exclusive-access guard. A panic while the
    /// guard was held leaves plain numbers behind, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, WorkloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cpu_usage(&self) -> f64 {
        self.lock().cpu_usage
    }

    pub fn memory_usage(&self) -> f64 {
        self.lock().memory_usage
    }

    pub fn min_required_memory(&self) -> f64 {
        self.lock().min_required_memory
    }

    pub fn set_min_required_memory(&self, mb: f64) {
        self.lock().min_required_memory = mb.max(0.0);
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn snapshot(&self) -> WorkloadSnapshot {
        let st = self.lock();
        WorkloadSnapshot {
            name: self.name.clone(),
            cpu_usage: st.cpu_usage,
            memory_usage: st.memory_usage,
            min_required_memory: st.min_required_memory,
            running: st.running,
        }
    }

    /// Spawn the mutation loop. Starting an already started or stopped
    /// workload does nothing.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.is_running() || self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Emitted ahead of the spawn so it always precedes WorkloadStopped.
        self.sink.emit(Event::WorkloadStarted {
            workload: self.name.clone(),
        });

        let workload = self.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || workload.mutation_loop())
            .with_context(|| format!("Failed to spawn workload thread {}", self.name))?;

        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// First half of the shutdown protocol: ask the mutation loop to exit.
    /// Takes effect at the loop's next check, never interrupts a tick.
    pub fn stop(&self) {
        self.lock().running = false;
    }

    /// Second half of the shutdown protocol: block until the mutation loop
    /// has exited. Returns immediately if it was never started or has
    /// already been joined. Blocks forever if [`Workload::stop`] is never
    /// called.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("workload {} mutation loop panicked", self.name);
            }
        }
    }

    fn mutation_loop(&self) {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let (lo, hi) = self.cpu_range;

        loop {
            {
                let mut st = self.lock();
                if !st.running {
                    break;
                }
                st.cpu_usage = uniform(&mut rng, lo, hi);
            }
            thread::sleep(self.tick);
        }

        debug!("workload {} mutation loop exited", self.name);
        self.sink.emit(Event::WorkloadStopped {
            workload: self.name.clone(),
        });
    }
}

/// Ordered set of uniquely named workloads. The order is the one the
/// allocator walks and the tie-break order of the scheduler.
#[derive(Debug, Default)]
pub struct WorkloadSet {
    workloads: Vec<Arc<Workload>>,
}

impl WorkloadSet {
    pub fn new(workloads: Vec<Arc<Workload>>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for w in workloads.iter() {
            if !names.insert(w.name()) {
                bail!("Duplicate workload name {:?}", w.name());
            }
        }
        Ok(Self { workloads })
    }

    /// Build randomly seeded workloads, one per name.
    pub fn from_names<R: Rng>(
        names: &[String],
        cfg: &WorkloadConfig,
        rng: &mut R,
        sink: SharedSink,
    ) -> Result<Self> {
        Self::new(
            names
                .iter()
                .map(|name| Arc::new(Workload::new(name, cfg, rng, sink.clone())))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Workload>> {
        self.workloads.iter()
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Workload>> {
        self.workloads.iter().find(|w| w.name() == name)
    }

    pub fn start_all(&self) -> Result<()> {
        for w in self.workloads.iter() {
            w.start()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for w in self.workloads.iter() {
            w.stop();
        }
    }

    pub fn join_all(&self) {
        for w in self.workloads.iter() {
            w.join();
        }
    }

    pub fn snapshots(&self) -> Vec<WorkloadSnapshot> {
        self.workloads.iter().map(|w| w.snapshot()).collect()
    }

    pub fn total_memory(&self) -> f64 {
        self.workloads.iter().map(|w| w.memory_usage()).sum()
    }
}
