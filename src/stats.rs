// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::cmp::Ordering;
use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering as AtomicOrdering;

use anyhow::Result;
use ordered_float::OrderedFloat;
use sorted_vec::SortedVec;

/// Running counters of the engine. Bumped from any thread.
#[derive(Debug, Default)]
pub struct HmpStats {
    nr_force_up: AtomicU64,
    nr_force_down: AtomicU64,
    nr_idle_pull: AtomicU64,
    nr_offload: AtomicU64,
    nr_dispatch_failed: AtomicU64,
    nr_abandoned: AtomicU64,
    nr_moved: AtomicU64,
    nr_deferred: AtomicU64,
    nr_sweeps: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, AtomicOrdering::Relaxed);
}

impl HmpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_up(&self) {
        bump(&self.nr_force_up);
    }

    pub fn force_down(&self) {
        bump(&self.nr_force_down);
    }

    pub fn idle_pull(&self) {
        bump(&self.nr_idle_pull);
    }

    pub fn offload(&self) {
        bump(&self.nr_offload);
    }

    pub fn dispatch_failed(&self) {
        bump(&self.nr_dispatch_failed);
    }

    pub fn abandoned(&self) {
        bump(&self.nr_abandoned);
    }

    pub fn moved(&self) {
        bump(&self.nr_moved);
    }

    pub fn deferred(&self) {
        bump(&self.nr_deferred);
    }

    pub fn sweep(&self) {
        bump(&self.nr_sweeps);
    }

    pub fn snapshot(&self) -> HmpStatsSnapshot {
        let get = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        HmpStatsSnapshot {
            nr_force_up: get(&self.nr_force_up),
            nr_force_down: get(&self.nr_force_down),
            nr_idle_pull: get(&self.nr_idle_pull),
            nr_offload: get(&self.nr_offload),
            nr_dispatch_failed: get(&self.nr_dispatch_failed),
            nr_abandoned: get(&self.nr_abandoned),
            nr_moved: get(&self.nr_moved),
            nr_deferred: get(&self.nr_deferred),
            nr_sweeps: get(&self.nr_sweeps),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HmpStatsSnapshot {
    pub nr_force_up: u64,
    pub nr_force_down: u64,
    pub nr_idle_pull: u64,
    pub nr_offload: u64,
    pub nr_dispatch_failed: u64,
    pub nr_abandoned: u64,
    pub nr_moved: u64,
    pub nr_deferred: u64,
    pub nr_sweeps: u64,
}

impl HmpStatsSnapshot {
    /// Counts accumulated since @prev.
    pub fn delta(&self, prev: &HmpStatsSnapshot) -> HmpStatsSnapshot {
        HmpStatsSnapshot {
            nr_force_up: self.nr_force_up.saturating_sub(prev.nr_force_up),
            nr_force_down: self.nr_force_down.saturating_sub(prev.nr_force_down),
            nr_idle_pull: self.nr_idle_pull.saturating_sub(prev.nr_idle_pull),
            nr_offload: self.nr_offload.saturating_sub(prev.nr_offload),
            nr_dispatch_failed: self
                .nr_dispatch_failed
                .saturating_sub(prev.nr_dispatch_failed),
            nr_abandoned: self.nr_abandoned.saturating_sub(prev.nr_abandoned),
            nr_moved: self.nr_moved.saturating_sub(prev.nr_moved),
            nr_deferred: self.nr_deferred.saturating_sub(prev.nr_deferred),
            nr_sweeps: self.nr_sweeps.saturating_sub(prev.nr_sweeps),
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "sweeps={:6} force_up={:5} force_down={:5} idle_pull={:5} offload={:5}",
            self.nr_sweeps, self.nr_force_up, self.nr_force_down, self.nr_idle_pull, self.nr_offload,
        )?;
        writeln!(
            w,
            "moved={:5} deferred={:5} abandoned={:5} dispatch_failed={:5}",
            self.nr_moved, self.nr_deferred, self.nr_abandoned, self.nr_dispatch_failed,
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DomainLoadStats {
    pub id: usize,
    pub nr_online: usize,
    pub nr_running: u32,
    pub load_avg: OrderedFloat<f64>,
    pub capacity: u32,
}

impl DomainLoadStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "  DOM[{:02}] cap={:4} online={:2} nr_running={:3} load_avg={:7.2}",
            self.id, self.capacity, self.nr_online, self.nr_running, *self.load_avg,
        )?;
        Ok(())
    }
}

impl PartialEq for DomainLoadStats {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DomainLoadStats {}

impl PartialOrd for DomainLoadStats {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DomainLoadStats {
    fn cmp(&self, other: &Self) -> Ordering {
        self.load_avg
            .cmp(&other.load_avg)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// What the periodic report prints: counters for the interval and the
/// domains ordered from the busiest down.
#[derive(Clone, Debug, Default)]
pub struct SystemStats {
    pub counters: HmpStatsSnapshot,
    pub up_threshold: u32,
    pub down_threshold: u32,
    pub doms: SortedVec<DomainLoadStats>,
}

impl SystemStats {
    pub fn busiest(&self) -> Option<&DomainLoadStats> {
        self.doms.last()
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        self.counters.format(w)?;
        writeln!(
            w,
            "thresholds up={} down={}",
            self.up_threshold, self.down_threshold
        )?;
        for dom in self.doms.iter().rev() {
            dom.format(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_delta() {
        let stats = HmpStats::new();
        stats.force_up();
        stats.force_up();
        let prev = stats.snapshot();
        stats.force_up();
        stats.dispatch_failed();
        let delta = stats.snapshot().delta(&prev);
        assert_eq!(delta.nr_force_up, 1);
        assert_eq!(delta.nr_dispatch_failed, 1);
        assert_eq!(delta.nr_force_down, 0);
    }

    #[test]
    fn test_report_orders_busiest_first() {
        let mut sys = SystemStats::default();
        for (id, load) in [(0, 120.0), (1, 640.5)] {
            sys.doms.insert(DomainLoadStats {
                id,
                nr_online: 2,
                nr_running: 1,
                load_avg: OrderedFloat(load),
                capacity: 1024,
            });
        }
        assert_eq!(sys.busiest().map(|d| d.id), Some(1));

        let mut buf = vec![];
        sys.format(&mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();
        let dom1 = out.find("DOM[01]").unwrap();
        let dom0 = out.find("DOM[00]").unwrap();
        assert!(dom1 < dom0);
        assert!(out.contains("force_up="));
    }
}
