// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU frequency extents and the scale factors derived from them.
//!
//! Frequencies are in kHz. Scale factors are on the 0..=1024 capacity scale
//! and describe the current and maximum allowed frequency relative to the
//! hardware maximum. Updates come from the frequency policy layer and are
//! read without locks by the cluster statistics collector.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::trace;

use crate::cpumask::Cpumask;
use crate::topology::SCHED_CAPACITY_SCALE;

#[derive(Debug)]
struct CpuFreqExtents {
    min: AtomicU32,
    max: AtomicU32,
    const_max: AtomicU32,
    curr: AtomicU32,
    curr_scale: AtomicU32,
    max_scale: AtomicU32,
    throttling: AtomicBool,
    single_freq: AtomicBool,
}

impl CpuFreqExtents {
    fn new() -> Self {
        Self {
            min: AtomicU32::new(0),
            max: AtomicU32::new(0),
            const_max: AtomicU32::new(0),
            curr: AtomicU32::new(0),
            curr_scale: AtomicU32::new(SCHED_CAPACITY_SCALE),
            max_scale: AtomicU32::new(SCHED_CAPACITY_SCALE),
            throttling: AtomicBool::new(false),
            single_freq: AtomicBool::new(false),
        }
    }
}

/// Snapshot of the extents of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreqExtents {
    pub min: u32,
    pub max: u32,
    pub const_max: u32,
    pub curr: u32,
}

/// Scale of @freq relative to @max on the capacity scale. A zero @max means
/// nothing is known about the CPU yet and reads as full scale.
fn calc_scale(freq: u32, max: u32) -> u32 {
    if max == 0 {
        return SCHED_CAPACITY_SCALE;
    }
    let scale = ((freq as u64) << 10) / max as u64;
    scale.min(SCHED_CAPACITY_SCALE as u64) as u32
}

#[derive(Debug)]
pub struct FreqScale {
    cpus: Vec<CpuFreqExtents>,
}

impl FreqScale {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus).map(|_| CpuFreqExtents::new()).collect(),
        }
    }

    fn cpu(&self, cpu: usize) -> Option<&CpuFreqExtents> {
        self.cpus.get(cpu)
    }

    /// A policy change on the CPUs of @cpus. @single_freq is set for
    /// governors that pin the CPU to one frequency, in which case the current
    /// scale stays at full.
    pub fn policy_update(
        &self,
        cpus: &Cpumask,
        min: u32,
        max: u32,
        const_max: u32,
        single_freq: bool,
    ) {
        for cpu in cpus.iter() {
            let Some(ext) = self.cpu(cpu) else {
                continue;
            };
            ext.min.store(min, Ordering::Relaxed);
            ext.max.store(max, Ordering::Relaxed);
            ext.const_max.store(const_max, Ordering::Relaxed);
            ext.single_freq.store(single_freq, Ordering::Relaxed);
            ext.max_scale
                .store(calc_scale(max, const_max), Ordering::Relaxed);
            ext.throttling.store(max < const_max, Ordering::Relaxed);
            if single_freq {
                ext.curr_scale.store(SCHED_CAPACITY_SCALE, Ordering::Relaxed);
            }
        }
        trace!(
            "freq policy cpus={} min={} max={} const_max={} single={}",
            cpus,
            min,
            max,
            const_max,
            single_freq
        );
    }

    /// A frequency transition on @cpu. The new frequency applies to all of
    /// @freq_domain, the CPUs sharing a clock with @cpu. With frequency
    /// invariance disabled the scale stays at full.
    pub fn transition(&self, freq_domain: &Cpumask, new_freq: u32, invariant: bool) {
        for cpu in freq_domain.iter() {
            let Some(ext) = self.cpu(cpu) else {
                continue;
            };
            ext.curr.store(new_freq, Ordering::Relaxed);
            let scale = if !invariant || ext.single_freq.load(Ordering::Relaxed) {
                SCHED_CAPACITY_SCALE
            } else {
                calc_scale(new_freq, ext.const_max.load(Ordering::Relaxed))
            };
            ext.curr_scale.store(scale, Ordering::Relaxed);
        }
    }

    pub fn extents(&self, cpu: usize) -> FreqExtents {
        match self.cpu(cpu) {
            Some(ext) => FreqExtents {
                min: ext.min.load(Ordering::Relaxed),
                max: ext.max.load(Ordering::Relaxed),
                const_max: ext.const_max.load(Ordering::Relaxed),
                curr: ext.curr.load(Ordering::Relaxed),
            },
            None => FreqExtents::default(),
        }
    }

    pub fn curr_scale(&self, cpu: usize) -> u32 {
        self.cpu(cpu)
            .map(|ext| ext.curr_scale.load(Ordering::Relaxed))
            .unwrap_or(SCHED_CAPACITY_SCALE)
    }

    pub fn max_scale(&self, cpu: usize) -> u32 {
        self.cpu(cpu)
            .map(|ext| ext.max_scale.load(Ordering::Relaxed))
            .unwrap_or(SCHED_CAPACITY_SCALE)
    }

    /// Whether the policy caps @cpu below its hardware maximum.
    pub fn throttling(&self, cpu: usize) -> bool {
        self.cpu(cpu)
            .map(|ext| ext.throttling.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_full_scale() {
        let freq = FreqScale::new(4);
        assert_eq!(freq.curr_scale(0), 1024);
        assert_eq!(freq.max_scale(3), 1024);
        assert!(!freq.throttling(2));
        assert_eq!(freq.curr_scale(64), 1024);
    }

    #[test]
    fn test_transition_propagates_to_domain() {
        let freq = FreqScale::new(4);
        let dom = Cpumask::from_cpulist("2-3", 4).unwrap();
        freq.policy_update(&dom, 500_000, 2_000_000, 2_000_000, false);
        freq.transition(&dom, 1_000_000, true);

        assert_eq!(freq.curr_scale(2), 512);
        assert_eq!(freq.curr_scale(3), 512);
        assert_eq!(freq.curr_scale(0), 1024);
        assert_eq!(freq.extents(3).curr, 1_000_000);

        freq.transition(&dom, 1_000_000, false);
        assert_eq!(freq.curr_scale(2), 1024);
    }

    #[test]
    fn test_throttling_and_single_freq() {
        let freq = FreqScale::new(2);
        let all = Cpumask::full(2);
        freq.policy_update(&all, 500_000, 1_500_000, 2_000_000, false);
        assert!(freq.throttling(0));
        assert_eq!(freq.max_scale(0), 768);

        freq.policy_update(&all, 2_000_000, 2_000_000, 2_000_000, true);
        freq.transition(&all, 700_000, true);
        assert!(!freq.throttling(1));
        assert_eq!(freq.curr_scale(1), 1024);
    }
}
