// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::sampler::SystemSample;
use crate::workload::WorkloadSnapshot;

pub const DEFAULT_HISTORY_LEN: usize = 50;

/// Bounded window of host samples, oldest first.
#[derive(Clone, Debug)]
pub struct History {
    cap: usize,
    samples: VecDeque<SystemSample>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl History {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            samples: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, sample: SystemSample) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &SystemSample> {
        self.samples.iter()
    }

    pub fn avg_cpu(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_pct).sum::<f64>() / self.samples.len() as f64
    }

    pub fn peak_mem(&self) -> f64 {
        self.samples.iter().map(|s| s.mem_pct).fold(0.0, f64::max)
    }

    pub fn summary(&self, uptime: Duration) -> Summary {
        Summary {
            avg_cpu: self.avg_cpu(),
            peak_mem: self.peak_mem(),
            uptime,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    pub avg_cpu: f64,
    pub peak_mem: f64,
    pub uptime: Duration,
}

fn fmt_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

impl Summary {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "host avg_cpu={:6.2}% peak_mem={:6.2}% uptime={}",
            self.avg_cpu,
            self.peak_mem,
            fmt_uptime(self.uptime)
        )?;
        Ok(())
    }
}

pub fn format_workloads<W: Write>(w: &mut W, snapshots: &[WorkloadSnapshot]) -> Result<()> {
    for snap in snapshots.iter() {
        writeln!(
            w,
            "  {:<16} cpu={:6.2}% mem={:7.1}MB min={:6.1}MB{}",
            snap.name,
            snap.cpu_usage,
            snap.memory_usage,
            snap.min_required_memory,
            if snap.running { "" } else { " (stopped)" }
        )?;
    }
    Ok(())
}
