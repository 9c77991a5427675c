// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runtime tunables of the migration engine.
//!
//! A `Tunables` value is validated as a whole before it replaces the active
//! one, so the engine never observes a partially updated or inconsistent
//! configuration.
use anyhow::bail;
use anyhow::Result;

/// Highest per-entity load on the HMP scale.
pub const HMP_MAX_LOAD: u32 = 1023;
pub const NICE_0_LOAD: u32 = 1024;

pub const MAX_RT_PRIO: i32 = 100;
pub const DEFAULT_PRIO: i32 = MAX_RT_PRIO + 20;

pub const HMP_VARIABLE_SCALE_SHIFT: u32 = 16;
/// Period of the load average in milliseconds at which the engine's time
/// scale equals wall time.
pub const LOAD_AVG_PERIOD: u64 = 32;

pub const fn nice_to_prio(nice: i32) -> i32 {
    DEFAULT_PRIO + nice
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    pub up_threshold: u32,
    pub down_threshold: u32,
    pub up_migration_cooldown: u64,
    pub down_migration_cooldown: u64,
    pub dynamic_threshold_enabled: bool,
    pub packing_enabled: bool,
    pub packing_full_threshold: u32,
    pub priority_filter_enabled: bool,
    /// Tasks with a priority value at or above this are low priority.
    pub priority_filter_cutoff: i32,
    pub freq_invariant_enabled: bool,
    /// Use the cluster-aware eligibility rules. When off, the classic
    /// threshold comparison is used.
    pub enhanced_mode: bool,
    pub global_balance_enabled: bool,
    pub lazy_balance_enabled: bool,
    /// Offloading is abandoned for tasks whose usage-to-runnable ratio is
    /// above this, on the 0..=1024 scale.
    pub starvation_cutoff: u32,
    pub max_search_tasks: usize,
    pub load_avg_period_ms: u32,
    /// Idle states with an exit latency above this are avoided while a
    /// migration is in flight.
    pub keepalive_max_delay_ns: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            up_threshold: 700,
            down_threshold: 512,
            up_migration_cooldown: 4096,
            down_migration_cooldown: 4096,
            dynamic_threshold_enabled: true,
            packing_enabled: true,
            packing_full_threshold: 650,
            priority_filter_enabled: true,
            priority_filter_cutoff: nice_to_prio(5),
            freq_invariant_enabled: true,
            enhanced_mode: true,
            global_balance_enabled: true,
            lazy_balance_enabled: false,
            starvation_cutoff: 768,
            max_search_tasks: 5,
            load_avg_period_ms: LOAD_AVG_PERIOD as u32,
            keepalive_max_delay_ns: 100_000,
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if self.up_threshold > NICE_0_LOAD || self.down_threshold > NICE_0_LOAD {
            bail!(
                "Thresholds must be at most {} (up={} down={})",
                NICE_0_LOAD,
                self.up_threshold,
                self.down_threshold
            );
        }
        if self.up_threshold < self.down_threshold {
            bail!(
                "up_threshold {} is below down_threshold {}",
                self.up_threshold,
                self.down_threshold
            );
        }
        if self.packing_full_threshold > NICE_0_LOAD {
            bail!(
                "packing_full_threshold {} exceeds {}",
                self.packing_full_threshold,
                NICE_0_LOAD
            );
        }
        if self.starvation_cutoff > NICE_0_LOAD {
            bail!("starvation_cutoff {} exceeds {}", self.starvation_cutoff, NICE_0_LOAD);
        }
        if self.load_avg_period_ms == 0 {
            bail!("load_avg_period_ms must be non-zero");
        }
        if self.max_search_tasks == 0 {
            bail!("max_search_tasks must be at least 1");
        }
        Ok(())
    }

    pub fn task_is_low_priority(&self, prio: i32) -> bool {
        self.priority_filter_enabled && prio >= self.priority_filter_cutoff
    }

    /// Multiplier applied to time deltas so that load average periods other
    /// than the default still decay in the same number of steps.
    pub fn variable_scale_multiplier(&self) -> u64 {
        (LOAD_AVG_PERIOD << HMP_VARIABLE_SCALE_SHIFT) / self.load_avg_period_ms.max(1) as u64
    }

    /// Scale @delta by the multiplier. The split into 32 bit halves keeps the
    /// intermediate products within 64 bits.
    pub fn variable_scale_convert(&self, delta: u64) -> u64 {
        let mult = self.variable_scale_multiplier();
        let high = delta >> 32;
        let low = delta & 0xffff_ffff;
        let low = (low * mult) >> HMP_VARIABLE_SCALE_SHIFT;
        let high = (high * mult) << (32 - HMP_VARIABLE_SCALE_SHIFT);
        low + high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let t = Tunables::default();
        t.validate().unwrap();
        assert_eq!(t.priority_filter_cutoff, 125);
        assert_eq!(t.up_migration_cooldown, 4096);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let t = Tunables {
            up_threshold: 400,
            down_threshold: 600,
            ..Default::default()
        };
        assert!(t.validate().is_err());

        let t = Tunables {
            up_threshold: 2000,
            ..Default::default()
        };
        assert!(t.validate().is_err());

        let t = Tunables {
            load_avg_period_ms: 0,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_low_priority() {
        let mut t = Tunables::default();
        assert!(t.task_is_low_priority(nice_to_prio(5)));
        assert!(t.task_is_low_priority(nice_to_prio(19)));
        assert!(!t.task_is_low_priority(DEFAULT_PRIO));
        t.priority_filter_enabled = false;
        assert!(!t.task_is_low_priority(nice_to_prio(19)));
    }

    #[test]
    fn test_variable_scale() {
        let t = Tunables::default();
        assert_eq!(t.variable_scale_multiplier(), 1 << 16);
        assert_eq!(t.variable_scale_convert(12345), 12345);

        let t = Tunables {
            load_avg_period_ms: 16,
            ..Default::default()
        };
        assert_eq!(t.variable_scale_convert(1000), 2000);
        assert_eq!(t.variable_scale_convert(1 << 32), 1 << 33);
    }
}
