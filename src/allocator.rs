// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Memory allocator
//!
//! Rebalances a fixed memory budget across a [`WorkloadSet`]. The driver
//! calls [`Allocator::allocate`] on its own cadence and every call runs one
//! full pass over all workloads:
//!
//! 1. Measure: sum every workload's memory usage under its guard to get
//!    `used`, and `remaining = max(0, budget - used)`.
//!
//! 2. Over-budget correction: if `used` exceeds the budget, each workload
//!    gives back its proportional share of the excess,
//!    `memory / used * excess`, without going below the hard floor.
//!
//! 3. Threshold policy, per workload and in set order:
//!
//!    - above the high water mark, shrink by one step unless that would
//!      cross the workload's `min_required_memory`;
//!    - below the low water mark, grow by one step if `remaining` still
//!      covers a step, consuming it;
//!    - otherwise jitter by up to `jitter` MB and clamp to
//!      `[min_required_memory, max_memory]`.
//!
//! Scarce `remaining` is handed out first-come in set order.
//!
//! The hard floor of step 2 is independent of `min_required_memory`, so the
//! correction may leave a workload under its declared minimum. The threshold
//! step never does.
//!
//! Each workload's guard is held only while that workload is read or
//! adjusted. `used` and `remaining` are therefore a snapshot which can be
//! stale by the time later workloads are adjusted.
use std::io::Write;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use log::trace;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;

use crate::events::Event;
use crate::events::SharedSink;
use crate::workload::WorkloadSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Memory shared by all workloads, in MB.
    pub total_memory_budget: f64,
    /// Lowest value the over-budget correction scales a workload down to.
    pub hard_floor: f64,
    pub high_water: f64,
    pub low_water: f64,
    /// Grow/shrink step of the threshold policy.
    pub step: f64,
    /// Maximum jitter applied in the steady band, in either direction.
    pub jitter: f64,
    pub max_memory: f64,
    pub seed: Option<u64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_memory_budget: 1000.0,
            hard_floor: 50.0,
            high_water: 400.0,
            low_water: 200.0,
            step: 50.0,
            jitter: 20.0,
            max_memory: 500.0,
            seed: None,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_memory_budget < 0.0 {
            bail!("total_memory_budget must not be negative");
        }
        if self.hard_floor < 0.0 || self.step < 0.0 || self.jitter < 0.0 {
            bail!("hard_floor, step and jitter must not be negative");
        }
        if self.low_water > self.high_water {
            bail!(
                "low_water ({}) is greater than high_water ({})",
                self.low_water,
                self.high_water
            );
        }
        Ok(())
    }
}

/// Outcome of the threshold policy for one workload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decision {
    Shrink { to: f64 },
    /// Shrinking would cross `min_required_memory`.
    SkipShrink,
    Grow { to: f64 },
    /// Not enough of the budget left for a step.
    SkipGrow,
    Jitter { to: f64 },
}

impl Decision {
    pub fn target(&self) -> Option<f64> {
        match self {
            Decision::Shrink { to } | Decision::Grow { to } | Decision::Jitter { to } => Some(*to),
            Decision::SkipShrink | Decision::SkipGrow => None,
        }
    }
}

/// Apply the threshold policy to one workload's figures. `jitter` is the
/// already drawn random offset, only used in the steady band.
pub fn threshold_decision(
    cfg: &AllocatorConfig,
    memory: f64,
    min_required: f64,
    remaining: f64,
    jitter: f64,
) -> Decision {
    if memory > cfg.high_water {
        let to = memory - cfg.step;
        if to >= min_required {
            Decision::Shrink { to }
        } else {
            Decision::SkipShrink
        }
    } else if memory < cfg.low_water {
        if remaining >= cfg.step {
            Decision::Grow {
                to: memory + cfg.step,
            }
        } else {
            Decision::SkipGrow
        }
    } else {
        // The floor wins if a workload's minimum sits above max_memory.
        let to = (memory + jitter).min(cfg.max_memory).max(min_required);
        Decision::Jitter { to }
    }
}

/// Proportional share of `excess` taken back from a workload using `memory`
/// out of `used`. Never raises a workload already under the floor.
pub fn scale_down(memory: f64, used: f64, excess: f64, floor: f64) -> f64 {
    if used <= 0.0 {
        return memory;
    }
    let reduced = memory - memory / used * excess;
    reduced.max(floor.min(memory)).max(0.0)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AllocStats {
    pub used: f64,
    pub remaining: f64,
    pub excess: f64,
    /// Budget left unclaimed after the threshold pass.
    pub remaining_after: f64,
    pub nr_scaled_down: usize,
    pub nr_shrunk: usize,
    pub nr_grown: usize,
    pub nr_jittered: usize,
    pub nr_skipped_shrink: usize,
    pub nr_skipped_grow: usize,
}

impl AllocStats {
    pub fn nr_skipped(&self) -> usize {
        self.nr_skipped_shrink + self.nr_skipped_grow
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "alloc used={:7.1}MB remaining={:7.1}MB excess={:6.1}MB left={:6.1}MB",
            self.used, self.remaining, self.excess, self.remaining_after
        )?;
        writeln!(
            w,
            "      scaled={} shrunk={} grown={} jittered={} skipped(shrink/grow)={}/{}",
            self.nr_scaled_down,
            self.nr_shrunk,
            self.nr_grown,
            self.nr_jittered,
            self.nr_skipped_shrink,
            self.nr_skipped_grow
        )?;
        Ok(())
    }
}

pub struct Allocator {
    workloads: Arc<WorkloadSet>,
    cfg: AllocatorConfig,
    rng: SmallRng,
    sink: SharedSink,
}

impl Allocator {
    pub fn new(
        workloads: Arc<WorkloadSet>,
        cfg: AllocatorConfig,
        sink: SharedSink,
    ) -> Result<Self> {
        cfg.validate()?;
        let rng = match cfg.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Ok(Self {
            workloads,
            cfg,
            rng,
            sink,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.cfg
    }

    pub fn budget(&self) -> f64 {
        self.cfg.total_memory_budget
    }

    /// Run one rebalancing pass over every workload. Never fails; skipped
    /// adjustments are reported as events and counted in the result.
    pub fn allocate(&mut self) -> AllocStats {
        let (used, remaining) = self.measure();
        self.sink.emit(Event::BudgetSummary {
            used,
            remaining,
            budget: self.cfg.total_memory_budget,
        });

        let mut stats = AllocStats {
            used,
            remaining,
            ..Default::default()
        };

        if used > self.cfg.total_memory_budget {
            stats.excess = used - self.cfg.total_memory_budget;
            stats.nr_scaled_down = self.correct_over_budget(used);
        }

        self.apply_thresholds(remaining, &mut stats);
        stats
    }

    /// Sum of all workloads' memory usage and the unclaimed budget.
    pub fn measure(&self) -> (f64, f64) {
        let used: f64 = self
            .workloads
            .iter()
            .map(|w| w.lock().memory_usage)
            .sum();
        (used, (self.cfg.total_memory_budget - used).max(0.0))
    }

    /// Scale every workload down by its share of the excess over the
    /// budget, `used` being the figure returned by [`Allocator::measure`].
    /// Returns the number of workloads whose memory actually went down.
    pub fn correct_over_budget(&self, used: f64) -> usize {
        let excess = used - self.cfg.total_memory_budget;
        if excess <= 0.0 {
            return 0;
        }

        let mut nr_scaled = 0;
        for w in self.workloads.iter() {
            let (from, to) = {
                let mut st = w.lock();
                let from = st.memory_usage;
                st.memory_usage = scale_down(from, used, excess, self.cfg.hard_floor);
                (from, st.memory_usage)
            };
            // Already at the floor, nothing was taken.
            if to >= from {
                continue;
            }
            nr_scaled += 1;
            self.sink.emit(Event::ScaleDown {
                workload: w.name().to_string(),
                from,
                to,
            });
        }
        nr_scaled
    }

    /// Run the threshold policy over all workloads in set order, handing out
    /// `remaining` first-come.
    pub fn apply_thresholds(&mut self, remaining: f64, stats: &mut AllocStats) {
        let mut remaining = remaining;

        for w in self.workloads.iter() {
            let jitter = if self.cfg.jitter > 0.0 {
                self.rng.gen_range(-self.cfg.jitter..=self.cfg.jitter)
            } else {
                0.0
            };

            let (from, min_required, decision) = {
                let mut st = w.lock();
                let from = st.memory_usage;
                let decision = threshold_decision(
                    &self.cfg,
                    from,
                    st.min_required_memory,
                    remaining,
                    jitter,
                );
                if let Some(to) = decision.target() {
                    st.memory_usage = to;
                }
                (from, st.min_required_memory, decision)
            };

            let workload = w.name().to_string();
            trace!("{}: {:.1}MB -> {:?}", workload, from, decision);
            let event = match decision {
                Decision::Shrink { to } => {
                    stats.nr_shrunk += 1;
                    Event::Shrink { workload, from, to }
                }
                Decision::SkipShrink => {
                    stats.nr_skipped_shrink += 1;
                    Event::SkipShrink {
                        workload,
                        memory: from,
                        min_required,
                    }
                }
                Decision::Grow { to } => {
                    remaining -= self.cfg.step;
                    stats.nr_grown += 1;
                    Event::Grow { workload, from, to }
                }
                Decision::SkipGrow => {
                    stats.nr_skipped_grow += 1;
                    Event::SkipGrow {
                        workload,
                        memory: from,
                        remaining,
                    }
                }
                Decision::Jitter { to } => {
                    stats.nr_jittered += 1;
                    Event::Jitter { workload, from, to }
                }
            };
            self.sink.emit(event);
        }

        stats.remaining_after = remaining;
    }
}
