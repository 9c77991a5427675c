// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cluster statistics
//!
//! Every migration decision compares two clusters: the faster one (B) and
//! the slower one (L). For each side the collector sums the run queue
//! counters of its online CPUs and derives the available capacity of one
//! target CPU, the CPU a task would land on.
//!
//! Available capacity comes in two flavours. `acap` is what is left of the
//! target's (frequency adjusted) capacity after its current load. `atask`
//! additionally weighs that load by the number of tasks sharing the CPU, so
//! a CPU with many small tasks reads as busier than one with a single task
//! of the same total load. Both are kept at a coarser resolution
//! (`scaled_*`) for the threshold arithmetic.
use log::trace;

use crate::cpumask::Cpumask;
use crate::domain::DomainGroup;
use crate::rq::RunQueues;
use crate::threshold::adjust_thresholds;
use crate::tunables::Tunables;
use crate::tunables::HMP_MAX_LOAD;

const HMP_RESOLUTION_SCALING: u32 = 4;

fn scale_down(v: i64) -> i64 {
    v >> HMP_RESOLUTION_SCALING
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub ncpu: u32,
    pub ntask: u32,
    /// Average load per online CPU.
    pub load_avg: u32,
    /// Capacity of the target CPU on the 0..=1023 load scale, adjusted for
    /// the frequency cap when frequency invariance is on.
    pub cpu_capacity: u32,
    /// Nominal capacity of the target CPU.
    pub cpu_power: u32,
    pub acap: i64,
    pub scaled_acap: i64,
    pub scaled_atask: i64,
    pub threshold: u32,
    pub nr_normal_prio: u32,
    pub nr_dequeuing_low_prio: u32,
}

impl ClusterStats {
    /// Collect the statistics of @cluster_cpus as seen from @target. The
    /// cluster-wide counters are always filled in. The capacity fields stay
    /// at zero if the cluster has no online CPU or @target is not one of
    /// its CPUs.
    pub fn collect(
        dom_group: &DomainGroup,
        rqs: &RunQueues,
        cluster_cpus: &Cpumask,
        target: Option<usize>,
        freq_invariant: bool,
    ) -> Self {
        let mut clbs = Self::default();

        let online = cluster_cpus.and(&dom_group.online_mask());
        for cpu in online.iter() {
            let stats = rqs.stats(cpu);
            clbs.ncpu += 1;
            clbs.ntask += stats.nr_running;
            clbs.load_avg += stats.load_avg_ratio;
            clbs.nr_normal_prio += stats.nr_normal_prio;
            clbs.nr_dequeuing_low_prio += stats.nr_dequeuing_low_prio;
        }

        let Some(target) = target.filter(|t| cluster_cpus.test_cpu(*t)) else {
            return clbs;
        };
        if clbs.ncpu == 0 {
            return clbs;
        }

        clbs.cpu_power = dom_group.capacity_of(target);

        clbs.cpu_capacity = HMP_MAX_LOAD;
        if freq_invariant {
            let freq = dom_group.freq();
            let scale = if freq.throttling(target) {
                freq.curr_scale(target)
            } else {
                freq.max_scale(target)
            };
            clbs.cpu_capacity = ((clbs.cpu_capacity * scale) >> 10).min(HMP_MAX_LOAD);
        }

        let target_stats = rqs.stats(target);
        let cap = clbs.cpu_capacity as i64;
        let load = target_stats.load_avg_ratio as i64;

        clbs.load_avg /= clbs.ncpu;
        clbs.acap = cap - load;
        clbs.scaled_acap = scale_down(clbs.acap);
        clbs.scaled_atask = scale_down(cap - target_stats.nr_running as i64 * load);

        trace!(
            "cluster={} target={} load/len={}/{} ncpu={} ntask={} load_avg={} cap={} acap={} scaled_acap={} scaled_atask={}",
            cluster_cpus,
            target,
            load,
            target_stats.nr_running,
            clbs.ncpu,
            clbs.ntask,
            clbs.load_avg,
            clbs.cpu_capacity,
            clbs.acap,
            clbs.scaled_acap,
            clbs.scaled_atask
        );

        clbs
    }
}

/// The pair of clusters a decision is made between.
#[derive(Debug, Clone)]
pub struct ClusterEnv {
    pub bcpus: Cpumask,
    pub lcpus: Cpumask,
    pub btarget: Option<usize>,
    pub ltarget: Option<usize>,
    pub bstats: ClusterStats,
    pub lstats: ClusterStats,
}

impl ClusterEnv {
    /// Collect both sides and derive their migration thresholds.
    pub fn collect(
        dom_group: &DomainGroup,
        rqs: &RunQueues,
        tunables: &Tunables,
        bcpus: &Cpumask,
        lcpus: &Cpumask,
        btarget: Option<usize>,
        ltarget: Option<usize>,
    ) -> Self {
        let invariant = tunables.freq_invariant_enabled;
        let mut bstats = ClusterStats::collect(dom_group, rqs, bcpus, btarget, invariant);
        let mut lstats = ClusterStats::collect(dom_group, rqs, lcpus, ltarget, invariant);
        adjust_thresholds(tunables, &mut bstats, &mut lstats);

        Self {
            bcpus: bcpus.clone(),
            lcpus: lcpus.clone(),
            btarget,
            ltarget,
            bstats,
            lstats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rq::Task;
    use crate::topology::ClusterSpec;
    use crate::topology::Topology;

    fn setup() -> (DomainGroup, RunQueues) {
        let specs: Vec<ClusterSpec> = ["0-1:a53:1300", "2-3:a57:1900"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let topo = Topology::from_clusters(&specs).unwrap();
        let dg = DomainGroup::new(&topo, &Cpumask::full(4)).unwrap();
        (dg, RunQueues::new(4, 125))
    }

    #[test]
    fn test_collect_busy_target() {
        let (dg, rqs) = setup();
        {
            let mut rq = rqs.lock(2);
            rq.enqueue(Task::new(1, "a", 4).with_load(300));
            rq.enqueue(Task::new(2, "b", 4).with_load(200));
        }
        rqs.lock(3).enqueue(Task::new(3, "c", 4).with_load(100));

        let big = dg.fastest().cpus().clone();
        let clbs = ClusterStats::collect(&dg, &rqs, &big, Some(2), true);
        assert_eq!(clbs.ncpu, 2);
        assert_eq!(clbs.ntask, 3);
        assert_eq!(clbs.load_avg, 300);
        assert_eq!(clbs.cpu_capacity, 1023);
        assert_eq!(clbs.cpu_power, 1024);
        assert_eq!(clbs.acap, 523);
        assert_eq!(clbs.scaled_acap, 523 >> 4);
        assert_eq!(clbs.scaled_atask, (1023 - 2 * 500) >> 4);
    }

    #[test]
    fn test_collect_is_idempotent() {
        let (dg, rqs) = setup();
        rqs.lock(0).enqueue(Task::new(1, "a", 4).with_load(700));
        let little = dg.slowest().cpus().clone();
        let a = ClusterStats::collect(&dg, &rqs, &little, Some(0), true);
        let b = ClusterStats::collect(&dg, &rqs, &little, Some(0), true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_target_outside_cluster_leaves_capacity_empty() {
        let (dg, rqs) = setup();
        let little = dg.slowest().cpus().clone();
        let clbs = ClusterStats::collect(&dg, &rqs, &little, Some(3), true);
        assert_eq!(clbs.ncpu, 2);
        assert_eq!(clbs.cpu_capacity, 0);
        assert_eq!(clbs.acap, 0);

        let clbs = ClusterStats::collect(&dg, &rqs, &little, None, true);
        assert_eq!(clbs.cpu_power, 0);
    }

    #[test]
    fn test_offline_cluster_has_no_cpus() {
        let (dg, rqs) = setup();
        dg.set_cpu_online(0, false).unwrap();
        dg.set_cpu_online(1, false).unwrap();
        let little = dg.slowest().cpus().clone();
        let clbs = ClusterStats::collect(&dg, &rqs, &little, Some(0), true);
        assert_eq!(clbs, ClusterStats::default());
    }

    #[test]
    fn test_throttled_capacity() {
        let (dg, rqs) = setup();
        let big = dg.fastest().cpus().clone();
        dg.freq().policy_update(&big, 500_000, 1_000_000, 2_000_000, false);
        dg.freq().transition(&big, 1_000_000, true);
        let clbs = ClusterStats::collect(&dg, &rqs, &big, Some(2), true);
        assert_eq!(clbs.cpu_capacity, (1023 * 512) >> 10);

        let clbs = ClusterStats::collect(&dg, &rqs, &big, Some(2), false);
        assert_eq!(clbs.cpu_capacity, 1023);
    }
}
