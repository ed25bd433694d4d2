// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_adaptive
//!
//! Adaptive allocation and scheduling engine for a small fleet of simulated
//! workloads.
//!
//! Each [`Workload`] runs its own thread that keeps publishing a synthetic
//! CPU usage figure. Two independent consumers act on the shared workload
//! state:
//!
//! - [`Allocator`] is invoked periodically by the driver and rebalances a
//!   fixed memory budget across all workloads: proportional scale-down when
//!   over budget, then per-workload grow/shrink/jitter around fixed water
//!   marks.
//!
//! - [`Scheduler`] runs on its own thread, orders workloads by the CPU usage
//!   it observed on their previous turn and grants each a quantum sized by
//!   its current CPU usage.
//!
//! Every decision is published as an [`Event`] through an injected
//! [`EventSink`]; nothing is written to a process-wide output.

pub mod allocator;
pub mod config;
pub mod events;
pub mod sampler;
pub mod scheduler;
pub mod stats;
pub mod workload;

pub use allocator::AllocStats;
pub use allocator::Allocator;
pub use allocator::AllocatorConfig;
pub use allocator::Decision;
pub use config::Config;
pub use events::ChannelSink;
pub use events::Event;
pub use events::EventSink;
pub use events::LogSink;
pub use events::MemorySink;
pub use events::NullSink;
pub use events::SharedSink;
pub use sampler::ProcSampler;
pub use sampler::SystemSample;
pub use sampler::SystemSampler;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerConfig;
pub use stats::History;
pub use stats::Summary;
pub use workload::Workload;
pub use workload::WorkloadConfig;
pub use workload::WorkloadSet;
pub use workload::WorkloadSnapshot;
pub use workload::WorkloadState;
