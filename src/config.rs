// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::allocator::AllocatorConfig;
use crate::scheduler::SchedulerConfig;
use crate::stats::DEFAULT_HISTORY_LEN;
use crate::workload::WorkloadConfig;

/// Complete simulation setup. Every field has a default so a config
/// document only needs to name what it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workload names, in allocation order.
    pub workloads: Vec<String>,
    /// Seconds between two allocator passes.
    pub interval: f64,
    /// Number of allocator passes to run, 0 runs until interrupted.
    pub cycles: u64,
    pub history_len: usize,
    pub run_scheduler: bool,
    pub workload: WorkloadConfig,
    pub allocator: AllocatorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workloads: ["Program-A", "Program-B", "Program-C"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            interval: 1.0,
            cycles: 0,
            history_len: DEFAULT_HISTORY_LEN,
            run_scheduler: true,
            workload: WorkloadConfig::default(),
            allocator: AllocatorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Parse a JSON config, either inline or from the file named after an
    /// `f:` or `file:` prefix.
    pub fn parse(input: &str) -> Result<Self> {
        let config: Config = match input.split_once(':') {
            Some(("f", path)) | Some(("file", path)) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?
            }
            _ => serde_json::from_str(input).context("Failed to parse inline config")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// `interval` as a `Duration`. Fails unless it is positive and
    /// representable, which rules out NaN, infinity and absurdly large
    /// values.
    pub fn interval_duration(&self) -> Result<Duration> {
        match Duration::try_from_secs_f64(self.interval) {
            Ok(d) if !d.is_zero() => Ok(d),
            _ => bail!("interval must be a positive number of seconds, got {}", self.interval),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for name in self.workloads.iter() {
            if name.is_empty() {
                bail!("Workload names must not be empty");
            }
            if !names.insert(name) {
                bail!("Duplicate workload name {:?}", name);
            }
        }
        self.interval_duration()?;
        self.workload.validate().context("Invalid workload config")?;
        self.allocator
            .validate()
            .context("Invalid allocator config")?;
        self.scheduler
            .validate()
            .context("Invalid scheduler config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_inline_partial() {
        let cfg = Config::parse(
            r#"{"workloads": ["x", "y"], "allocator": {"total_memory_budget": 600.0}}"#,
        )
        .unwrap();
        assert_eq!(cfg.workloads, vec!["x", "y"]);
        assert_eq!(cfg.allocator.total_memory_budget, 600.0);
        assert_eq!(cfg.allocator.step, 50.0);
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_parse_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"cycles": 4, "interval": 0.25}}"#).unwrap();
        let path = f.path().to_str().unwrap().to_string();

        for prefix in ["f:", "file:"] {
            let cfg = Config::parse(&format!("{}{}", prefix, path)).unwrap();
            assert_eq!(cfg.cycles, 4);
            assert_eq!(cfg.interval, 0.25);
            assert_eq!(cfg.workloads.len(), 3);
        }
    }

    #[test]
    fn test_parse_missing_file() {
        assert!(Config::parse("f:/nonexistent/scx_adaptive.json").is_err());
    }

    #[test]
    fn test_rejects_duplicate_workloads() {
        assert!(Config::parse(r#"{"workloads": ["a", "a"]}"#).is_err());
    }

    #[test]
    fn test_rejects_bad_interval() {
        assert!(Config::parse(r#"{"interval": 0.0}"#).is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_interval() {
        assert!(Config::parse(r#"{"interval": 1e300}"#).is_err());
        assert!(Config::parse(r#"{"interval": -1.0}"#).is_err());
        assert!(Config::parse(r#"{"interval": 1e-12}"#).is_err());

        for interval in [f64::INFINITY, f64::NAN] {
            let cfg = Config {
                interval,
                ..Default::default()
            };
            assert!(cfg.validate().is_err());
        }

        let cfg = Config::parse(r#"{"interval": 0.25}"#).unwrap();
        assert_eq!(cfg.interval_duration().unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_millisecond_fields() {
        let cfg = Config::parse(
            r#"{"workload": {"tick_ms": 250}, "scheduler": {"low_quantum_ms": 900}}"#,
        )
        .unwrap();
        assert_eq!(cfg.workload.tick(), Duration::from_millis(250));
        assert_eq!(cfg.scheduler.quantum(0.0), Duration::from_millis(900));
        assert_eq!(cfg.scheduler.mid_quantum_ms, 1000);
        assert!(Config::parse(r#"{"workload": {"tick_ms": 0}}"#).is_err());
    }

    #[test]
    fn test_default_round_trips() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert_eq!(Config::parse(&json).unwrap(), Config::default());
    }
}
