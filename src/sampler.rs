// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host metrics for the driver. The allocator and scheduler never look at
//! these, they work on the synthetic workload figures only.
use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SystemSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

pub trait SystemSampler {
    fn sample(&mut self) -> Result<SystemSample>;
}

pub fn sub_or_zero(curr: &u64, prev: &u64) -> u64 {
    curr.checked_sub(*prev).unwrap_or(0)
}

fn read_total_cpu(reader: &procfs::ProcReader) -> Result<procfs::CpuStat> {
    reader
        .read_stat()
        .context("Failed to read procfs")?
        .total_cpu
        .ok_or_else(|| anyhow!("Could not read total cpu stat in proc"))
}

/// Cumulative (busy, total) microseconds of one `/proc/stat` line. Idle and
/// iowait time count towards the total only.
fn busy_and_total(stat: &procfs::CpuStat) -> Option<(u64, u64)> {
    let busy = [
        stat.user_usec?,
        stat.nice_usec?,
        stat.system_usec?,
        stat.irq_usec?,
        stat.softirq_usec?,
        stat.stolen_usec?,
    ]
    .iter()
    .sum::<u64>();
    Some((busy, busy + stat.idle_usec? + stat.iowait_usec?))
}

/// Busy fraction between two cumulative `/proc/stat` readings.
pub fn calc_busy(prev: &procfs::CpuStat, curr: &procfs::CpuStat) -> Result<f64> {
    let (Some((prev_busy, prev_total)), Some((curr_busy, curr_total))) =
        (busy_and_total(prev), busy_and_total(curr))
    else {
        bail!("Some procfs stats are not populated!");
    };

    let busy = sub_or_zero(&curr_busy, &prev_busy);
    let total = sub_or_zero(&curr_total, &prev_total);
    if total == 0 {
        return Ok(0.0);
    }
    Ok((busy as f64 / total as f64).clamp(0.0, 1.0))
}

/// Samples host CPU and memory utilization from procfs.
pub struct ProcSampler {
    reader: procfs::ProcReader,
    prev_total_cpu: procfs::CpuStat,
}

impl ProcSampler {
    pub fn new() -> Result<Self> {
        let reader = procfs::ProcReader::new();
        let prev_total_cpu = read_total_cpu(&reader)?;
        Ok(Self {
            reader,
            prev_total_cpu,
        })
    }

    fn mem_pct(&self) -> Result<f64> {
        let meminfo = self
            .reader
            .read_meminfo()
            .context("Failed to read meminfo")?;
        match (meminfo.total, meminfo.available) {
            (Some(total), Some(available)) if total > 0 => {
                Ok(sub_or_zero(&total, &available) as f64 * 100.0 / total as f64)
            }
            _ => bail!("meminfo is missing total or available memory"),
        }
    }
}

impl SystemSampler for ProcSampler {
    /// CPU utilization since the previous sample, memory utilization now.
    fn sample(&mut self) -> Result<SystemSample> {
        let total_cpu = read_total_cpu(&self.reader)?;
        let busy = calc_busy(&self.prev_total_cpu, &total_cpu)?;
        self.prev_total_cpu = total_cpu;

        Ok(SystemSample {
            cpu_pct: busy * 100.0,
            mem_pct: self.mem_pct()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(busy: u64, idle: u64) -> procfs::CpuStat {
        procfs::CpuStat {
            user_usec: Some(busy),
            nice_usec: Some(0),
            system_usec: Some(0),
            idle_usec: Some(idle),
            iowait_usec: Some(0),
            irq_usec: Some(0),
            softirq_usec: Some(0),
            stolen_usec: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_calc_busy() {
        let busy = calc_busy(&stat(100, 100), &stat(175, 125)).unwrap();
        assert!((busy - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_calc_busy_no_progress() {
        assert_eq!(calc_busy(&stat(10, 10), &stat(10, 10)).unwrap(), 0.0);
    }

    #[test]
    fn test_calc_busy_missing_fields() {
        assert!(calc_busy(&procfs::CpuStat::default(), &stat(1, 1)).is_err());
    }

    #[test]
    fn test_sub_or_zero() {
        assert_eq!(sub_or_zero(&5, &7), 0);
        assert_eq!(sub_or_zero(&7, &5), 2);
    }
}
