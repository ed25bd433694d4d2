// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Decision records emitted by workloads, the allocator and the scheduler.
//!
//! Components never print. They hand [`Event`]s to the [`EventSink`] they were
//! constructed with and any presentation layer subscribes to that sink.
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use crossbeam::channel::Sender;
use log::debug;
use log::log;
use log::Level;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    WorkloadStarted {
        workload: String,
    },
    WorkloadStopped {
        workload: String,
    },
    BudgetSummary {
        used: f64,
        remaining: f64,
        budget: f64,
    },
    ScaleDown {
        workload: String,
        from: f64,
        to: f64,
    },
    Grow {
        workload: String,
        from: f64,
        to: f64,
    },
    Shrink {
        workload: String,
        from: f64,
        to: f64,
    },
    Jitter {
        workload: String,
        from: f64,
        to: f64,
    },
    SkipGrow {
        workload: String,
        memory: f64,
        remaining: f64,
    },
    SkipShrink {
        workload: String,
        memory: f64,
        min_required: f64,
    },
    QuantumGranted {
        workload: String,
        cpu_usage: f64,
        quantum: Duration,
    },
    CpuObserved {
        workload: String,
        cpu_usage: f64,
    },
}

impl Event {
    /// Name of the workload the event is about, if any.
    pub fn workload(&self) -> Option<&str> {
        match self {
            Event::BudgetSummary { .. } => None,
            Event::WorkloadStarted { workload }
            | Event::WorkloadStopped { workload }
            | Event::ScaleDown { workload, .. }
            | Event::Grow { workload, .. }
            | Event::Shrink { workload, .. }
            | Event::Jitter { workload, .. }
            | Event::SkipGrow { workload, .. }
            | Event::SkipShrink { workload, .. }
            | Event::QuantumGranted { workload, .. }
            | Event::CpuObserved { workload, .. } => Some(workload.as_str()),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Event::SkipGrow { .. } | Event::SkipShrink { .. })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::WorkloadStarted { workload } => write!(f, "[Workload] started {}", workload),
            Event::WorkloadStopped { workload } => write!(f, "[Workload] stopped {}", workload),
            Event::BudgetSummary {
                used,
                remaining,
                budget,
            } => write!(
                f,
                "[Allocator] used={:.0}MB remaining={:.0}MB budget={:.0}MB",
                used, remaining, budget
            ),
            Event::ScaleDown { workload, from, to } => write!(
                f,
                "[Allocator] over budget, scaled {} {:.0}MB -> {:.0}MB",
                workload, from, to
            ),
            Event::Grow { workload, from, to } => write!(
                f,
                "[Allocator] grew {} {:.0}MB -> {:.0}MB",
                workload, from, to
            ),
            Event::Shrink { workload, from, to } => write!(
                f,
                "[Allocator] shrank {} {:.0}MB -> {:.0}MB",
                workload, from, to
            ),
            Event::Jitter { workload, from, to } => write!(
                f,
                "[Allocator] adjusted {} {:.0}MB -> {:.0}MB",
                workload, from, to
            ),
            Event::SkipGrow {
                workload,
                memory,
                remaining,
            } => write!(
                f,
                "[Allocator] cannot grow {} at {:.0}MB, only {:.0}MB remaining",
                workload, memory, remaining
            ),
            Event::SkipShrink {
                workload,
                memory,
                min_required,
            } => write!(
                f,
                "[Allocator] cannot shrink {} at {:.0}MB below its {:.0}MB minimum",
                workload, memory, min_required
            ),
            Event::QuantumGranted {
                workload,
                cpu_usage,
                quantum,
            } => write!(
                f,
                "[Scheduler] running {} (cpu={:.1}%) for {:.1}s",
                workload,
                cpu_usage,
                quantum.as_secs_f64()
            ),
            Event::CpuObserved {
                workload,
                cpu_usage,
            } => write!(f, "[Scheduler] {} used {:.1}% cpu", workload, cpu_usage),
        }
    }
}

/// Destination for [`Event`]s. Must be callable from any component thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}

/// Drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events to the `log` facade. Scheduler chatter goes to debug so
/// that the allocator decisions stay readable at the default level, skipped
/// adjustments are warnings.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn level(event: &Event) -> Level {
        match event {
            Event::QuantumGranted { .. } | Event::CpuObserved { .. } => Level::Debug,
            Event::SkipGrow { .. } | Event::SkipShrink { .. } => Level::Warn,
            _ => Level::Info,
        }
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        log!(Self::level(&event), "{}", event);
    }
}

/// Sends events over a crossbeam channel. A disconnected receiver only means
/// nobody is listening anymore.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            debug!("event dropped, receiver gone: {}", e.into_inner());
        }
    }
}

/// Captures events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drains the captured events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
