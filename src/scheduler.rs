// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU quantum scheduler
//!
//! Each pass orders the workloads by the CPU usage the scheduler observed at
//! the end of their previous turn, lowest first, and grants each a quantum
//! sized by its current CPU usage. A grant is simulated by sleeping for the
//! quantum. Workloads never seen before count as 0.0, and ties keep the set
//! order.
//!
//! The scheduler only reads `cpu_usage` from the workloads. The one piece of
//! state it writes is its own map of last observed usage.
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use ordered_float::OrderedFloat;
use serde::Deserialize;
use serde::Serialize;

use crate::events::Event;
use crate::events::SharedSink;
use crate::workload::Workload;
use crate::workload::WorkloadSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workloads using less CPU than this get `low_quantum_ms`.
    pub low_cpu: f64,
    /// Workloads using less CPU than this, but at least `low_cpu`, get
    /// `mid_quantum_ms`. Everything else gets `high_quantum_ms`.
    pub mid_cpu: f64,
    pub low_quantum_ms: u64,
    pub mid_quantum_ms: u64,
    pub high_quantum_ms: u64,
    /// Pause between passes while there is nothing to schedule.
    pub idle_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            low_cpu: 10.0,
            mid_cpu: 20.0,
            low_quantum_ms: 1500,
            mid_quantum_ms: 1000,
            high_quantum_ms: 500,
            idle_interval_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.low_cpu > self.mid_cpu {
            bail!(
                "low_cpu ({}) is greater than mid_cpu ({})",
                self.low_cpu,
                self.mid_cpu
            );
        }
        if self.idle_interval_ms == 0 {
            bail!("idle_interval_ms must be non-zero");
        }
        Ok(())
    }

    /// Quantum granted to a workload currently using `cpu_usage` percent.
    /// Tier boundaries belong to the busier tier.
    pub fn quantum(&self, cpu_usage: f64) -> Duration {
        let ms = if cpu_usage < self.low_cpu {
            self.low_quantum_ms
        } else if cpu_usage < self.mid_cpu {
            self.mid_quantum_ms
        } else {
            self.high_quantum_ms
        };
        Duration::from_millis(ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

pub struct Scheduler {
    workloads: Arc<WorkloadSet>,
    cfg: SchedulerConfig,
    last_cpu_usages: Mutex<BTreeMap<String, f64>>,
    running: AtomicBool,
    nr_passes: AtomicU64,
    nr_grants: AtomicU64,
    sink: SharedSink,
}

impl Scheduler {
    pub fn new(
        workloads: Arc<WorkloadSet>,
        cfg: SchedulerConfig,
        sink: SharedSink,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            workloads,
            cfg,
            last_cpu_usages: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(true),
            nr_passes: AtomicU64::new(0),
            nr_grants: AtomicU64::new(0),
            sink,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn quantum(&self, cpu_usage: f64) -> Duration {
        self.cfg.quantum(cpu_usage)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Ask [`Scheduler::run`] to return. The current grant is completed
    /// first. Stopping is terminal and may be repeated.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn nr_passes(&self) -> u64 {
        self.nr_passes.load(Ordering::Relaxed)
    }

    pub fn nr_grants(&self) -> u64 {
        self.nr_grants.load(Ordering::Relaxed)
    }

    pub fn last_cpu_usage(&self, name: &str) -> Option<f64> {
        self.last_cpu_usages().get(name).copied()
    }

    fn last_cpu_usages(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, f64>> {
        self.last_cpu_usages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The order the next pass will visit the workloads in.
    pub fn order(&self) -> Vec<Arc<Workload>> {
        let last = self.last_cpu_usages();
        let mut order: Vec<Arc<Workload>> = self.workloads.iter().cloned().collect();
        // sort_by_key is stable, equal keys keep the set order.
        order.sort_by_key(|w| OrderedFloat(last.get(w.name()).copied().unwrap_or(0.0)));
        order
    }

    /// Loop over scheduling passes until stopped.
    pub fn run(&self) {
        debug!("scheduler started with {} workloads", self.workloads.len());
        while self.is_running() {
            if self.workloads.is_empty() {
                thread::sleep(self.cfg.idle_interval());
                continue;
            }
            self.run_pass();
        }
        debug!(
            "scheduler stopped after {} passes, {} grants",
            self.nr_passes(),
            self.nr_grants()
        );
    }

    /// Run a single pass and return the names of the workloads granted a
    /// quantum, in grant order. A stop request cuts the pass short before the
    /// next grant.
    pub fn run_pass(&self) -> Vec<String> {
        let mut granted = vec![];

        for w in self.order() {
            if !self.is_running() {
                break;
            }

            let cpu_usage = w.cpu_usage();
            let quantum = self.cfg.quantum(cpu_usage);
            self.sink.emit(Event::QuantumGranted {
                workload: w.name().to_string(),
                cpu_usage,
                quantum,
            });

            thread::sleep(quantum);

            let observed = w.cpu_usage();
            self.last_cpu_usages().insert(w.name().to_string(), observed);
            self.nr_grants.fetch_add(1, Ordering::Relaxed);
            self.sink.emit(Event::CpuObserved {
                workload: w.name().to_string(),
                cpu_usage: observed,
            });
            granted.push(w.name().to_string());
        }

        self.nr_passes.fetch_add(1, Ordering::Relaxed);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::workload::WorkloadConfig;

    fn fast_cfg() -> SchedulerConfig {
        SchedulerConfig {
            low_quantum_ms: 3,
            mid_quantum_ms: 2,
            high_quantum_ms: 1,
            idle_interval_ms: 1,
            ..Default::default()
        }
    }

    fn set(cpus: &[(&str, f64)]) -> Arc<WorkloadSet> {
        let cfg = WorkloadConfig::default();
        Arc::new(
            WorkloadSet::new(
                cpus.iter()
                    .map(|(name, cpu)| {
                        Arc::new(Workload::with_usage(
                            name,
                            *cpu,
                            300.0,
                            &cfg,
                            Arc::new(NullSink),
                        ))
                    })
                    .collect(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_quantum_tiers() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.quantum(0.0), Duration::from_millis(1500));
        assert_eq!(cfg.quantum(9.999), Duration::from_millis(1500));
        assert_eq!(cfg.quantum(10.0), Duration::from_millis(1000));
        assert_eq!(cfg.quantum(19.999), Duration::from_millis(1000));
        assert_eq!(cfg.quantum(20.0), Duration::from_millis(500));
        assert_eq!(cfg.quantum(100.0), Duration::from_millis(500));
    }

    #[test]
    fn test_quantum_non_increasing() {
        let cfg = SchedulerConfig::default();
        let mut prev = cfg.quantum(0.0);
        for i in 0..=400 {
            let q = cfg.quantum(i as f64 * 0.25);
            assert!(q <= prev);
            prev = q;
        }
    }

    #[test]
    fn test_order_ascending_by_last_usage() {
        let sched = Scheduler::new(
            set(&[("a", 0.0), ("b", 0.0), ("c", 0.0)]),
            fast_cfg(),
            Arc::new(NullSink),
        )
        .unwrap();
        {
            let mut last = sched.last_cpu_usages();
            last.insert("a".into(), 25.0);
            last.insert("b".into(), 5.0);
            last.insert("c".into(), 15.0);
        }
        let order: Vec<String> = sched.order().iter().map(|w| w.name().to_string()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_order_unseen_first_and_stable() {
        let sched = Scheduler::new(
            set(&[("a", 0.0), ("b", 0.0), ("c", 0.0), ("d", 0.0)]),
            fast_cfg(),
            Arc::new(NullSink),
        )
        .unwrap();
        {
            let mut last = sched.last_cpu_usages();
            last.insert("a".into(), 12.0);
            last.insert("c".into(), 12.0);
        }
        let order: Vec<String> = sched.order().iter().map(|w| w.name().to_string()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_pass_records_observed_usage() {
        let sched =
            Scheduler::new(set(&[("a", 25.0), ("b", 5.0)]), fast_cfg(), Arc::new(NullSink))
                .unwrap();
        assert_eq!(sched.run_pass(), vec!["a", "b"]);
        assert_eq!(sched.last_cpu_usage("a"), Some(25.0));
        assert_eq!(sched.last_cpu_usage("b"), Some(5.0));
        assert_eq!(sched.run_pass(), vec!["b", "a"]);
        assert_eq!(sched.nr_passes(), 2);
        assert_eq!(sched.nr_grants(), 4);
    }

    #[test]
    fn test_stopped_pass_grants_nothing() {
        let sched = Scheduler::new(set(&[("a", 25.0)]), fast_cfg(), Arc::new(NullSink)).unwrap();
        sched.stop();
        sched.stop();
        assert!(sched.run_pass().is_empty());
        sched.run();
        assert_eq!(sched.nr_grants(), 0);
    }

    #[test]
    fn test_config_validation() {
        let bad = SchedulerConfig {
            low_cpu: 30.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
