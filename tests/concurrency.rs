// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// Workloads, allocator and scheduler running side by side on their own
// threads. Ticks and quanta are scaled down to milliseconds.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use scx_adaptive::Allocator;
use scx_adaptive::AllocatorConfig;
use scx_adaptive::Event;
use scx_adaptive::MemorySink;
use scx_adaptive::NullSink;
use scx_adaptive::Scheduler;
use scx_adaptive::SchedulerConfig;
use scx_adaptive::Workload;
use scx_adaptive::WorkloadConfig;
use scx_adaptive::WorkloadSet;

fn fast_workloads() -> WorkloadConfig {
    WorkloadConfig {
        tick_ms: 2,
        ..Default::default()
    }
}

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        low_quantum_ms: 6,
        mid_quantum_ms: 4,
        high_quantum_ms: 2,
        idle_interval_ms: 2,
        ..Default::default()
    }
}

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("Program-{}", i)).collect()
}

#[test]
fn fleet_runs_and_shuts_down_cleanly() {
    let sink = Arc::new(MemorySink::new());
    let mut rng = SmallRng::seed_from_u64(11);
    let set = Arc::new(
        WorkloadSet::from_names(&names(3), &fast_workloads(), &mut rng, sink.clone()).unwrap(),
    );
    let mut alloc = Allocator::new(
        set.clone(),
        AllocatorConfig {
            seed: Some(5),
            ..Default::default()
        },
        sink.clone(),
    )
    .unwrap();
    let sched = Arc::new(Scheduler::new(set.clone(), fast_scheduler(), sink.clone()).unwrap());

    set.start_all().unwrap();
    let sched_thread = {
        let sched = sched.clone();
        thread::spawn(move || sched.run())
    };

    for _ in 0..20 {
        alloc.allocate();
        for w in set.iter() {
            let st = w.lock();
            assert!(st.memory_usage >= 0.0);
            assert!(st.memory_usage <= 500.0 + 1e-6);
        }
        thread::sleep(Duration::from_millis(3));
    }

    set.stop_all();
    set.join_all();
    sched.stop();
    sched_thread.join().unwrap();

    assert!(sched.nr_grants() > 0);
    for w in set.iter() {
        assert!(!w.is_running());
        let cpu = w.cpu_usage();
        assert!((5.0..=30.0).contains(&cpu), "{} cpu {}", w.name(), cpu);
    }

    let events = sink.events();
    let stopped = events
        .iter()
        .filter(|e| matches!(e, Event::WorkloadStopped { .. }))
        .count();
    assert_eq!(stopped, 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::QuantumGranted { .. })));
}

#[test]
fn scheduler_stop_returns_after_current_grant() {
    let cfg = WorkloadConfig::default();
    let set = Arc::new(
        WorkloadSet::new(vec![Arc::new(Workload::with_usage(
            "busy",
            50.0,
            300.0,
            &cfg,
            Arc::new(NullSink),
        ))])
        .unwrap(),
    );
    let sched_cfg = SchedulerConfig {
        high_quantum_ms: 20,
        ..fast_scheduler()
    };
    let sched = Arc::new(Scheduler::new(set, sched_cfg, Arc::new(NullSink)).unwrap());

    let handle = {
        let sched = sched.clone();
        thread::spawn(move || sched.run())
    };
    thread::sleep(Duration::from_millis(30));

    let stop_at = Instant::now();
    sched.stop();
    handle.join().unwrap();
    // At most one in-flight grant has to finish.
    assert!(stop_at.elapsed() < Duration::from_secs(1));
    assert!(sched.nr_grants() >= 1);

    // Stopping again is harmless.
    sched.stop();
    assert!(!sched.is_running());
}

#[test]
fn scheduler_orders_by_observed_usage() {
    let cfg = WorkloadConfig::default();
    let fleet: Vec<Arc<Workload>> = [("hot", 25.0), ("warm", 15.0), ("cold", 5.0)]
        .iter()
        .map(|(name, cpu)| {
            Arc::new(Workload::with_usage(
                name,
                *cpu,
                300.0,
                &cfg,
                Arc::new(NullSink),
            ))
        })
        .collect();
    let set = Arc::new(WorkloadSet::new(fleet).unwrap());
    let sink = Arc::new(MemorySink::new());
    let sched = Scheduler::new(set, fast_scheduler(), sink.clone()).unwrap();

    // Nothing observed yet: set order.
    assert_eq!(sched.run_pass(), vec!["hot", "warm", "cold"]);
    // Least recently busy first.
    assert_eq!(sched.run_pass(), vec!["cold", "warm", "hot"]);

    let quanta: Vec<(String, Duration)> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::QuantumGranted {
                workload, quantum, ..
            } => Some((workload, quantum)),
            _ => None,
        })
        .take(3)
        .collect();
    assert_eq!(
        quanta,
        vec![
            ("hot".to_string(), Duration::from_millis(2)),
            ("warm".to_string(), Duration::from_millis(4)),
            ("cold".to_string(), Duration::from_millis(6)),
        ]
    );
}

#[test]
fn scheduler_with_empty_fleet_idles_until_stopped() {
    let set = Arc::new(WorkloadSet::new(vec![]).unwrap());
    let sched = Arc::new(Scheduler::new(set, fast_scheduler(), Arc::new(NullSink)).unwrap());
    let handle = {
        let sched = sched.clone();
        thread::spawn(move || sched.run())
    };
    thread::sleep(Duration::from_millis(10));
    sched.stop();
    handle.join().unwrap();
    assert_eq!(sched.nr_grants(), 0);
}

#[test]
fn workload_join_after_stop_is_prompt() {
    let set = Arc::new(
        WorkloadSet::from_names(
            &names(4),
            &fast_workloads(),
            &mut SmallRng::seed_from_u64(2),
            Arc::new(NullSink),
        )
        .unwrap(),
    );
    set.start_all().unwrap();
    thread::sleep(Duration::from_millis(10));

    let stop_at = Instant::now();
    set.stop_all();
    set.join_all();
    assert!(stop_at.elapsed() < Duration::from_secs(1));

    // Second round is a no-op.
    set.stop_all();
    set.join_all();
    assert!(set.snapshots().iter().all(|s| !s.running));
}
