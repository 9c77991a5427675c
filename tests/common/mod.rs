// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use scx_hmp::cluster::ClusterEnv;
use scx_hmp::domain::DomainGroup;
use scx_hmp::eligibility::HmpPolicy;
use scx_hmp::events::RecordingSink;
use scx_hmp::rq::Pid;
use scx_hmp::rq::RunQueues;
use scx_hmp::stats::HmpStats;
use scx_hmp::Cpumask;
use scx_hmp::ClusterSpec;
use scx_hmp::HmpBalancer;
use scx_hmp::Task;
use scx_hmp::Topology;
use scx_hmp::Tunables;

/// 0-1 little, 2-3 big.
pub const BIG_LITTLE: &[&str] = &["0-1:cortex-a53:1300", "2-3:cortex-a57:1900"];

/// 0-1 little, 2-3 middle, 4-5 big.
pub const THREE_TIER: &[&str] = &[
    "0-1:cortex-a53:1000",
    "2-3:cortex-a53:1800",
    "4-5:cortex-a57:1900",
];

pub fn topology(clusters: &[&str]) -> Topology {
    let specs: Vec<ClusterSpec> = clusters.iter().map(|c| c.parse().unwrap()).collect();
    Topology::from_clusters(&specs).unwrap()
}

/// A task for the four CPUs of `BIG_LITTLE`.
pub fn task(pid: Pid, load: u32) -> Task {
    task_on(4, pid, load)
}

pub fn task_on(nr_cpus: usize, pid: Pid, load: u32) -> Task {
    Task::new(pid, &format!("task-{}", pid), nr_cpus).with_load(load)
}

pub fn balancer(clusters: &[&str], tunables: Tunables) -> (HmpBalancer, Arc<RecordingSink>) {
    let topo = topology(clusters);
    let sink = Arc::new(RecordingSink::new());
    let bal = HmpBalancer::new(&topo, tunables, sink.clone()).unwrap();
    (bal, sink)
}

/// Where each task currently sits.
pub fn locations(bal: &HmpBalancer) -> HashMap<Pid, usize> {
    let mut locs = HashMap::new();
    for cpu in 0..bal.rqs().nr_cpus() {
        for t in bal.rqs().lock(cpu).tasks() {
            locs.insert(t.pid, cpu);
        }
    }
    locs
}

/// The engine state a policy borrows, owned in one place.
pub struct Harness {
    pub dg: DomainGroup,
    pub rqs: RunQueues,
    pub tunables: Tunables,
    pub stats: HmpStats,
    pub sink: RecordingSink,
}

impl Harness {
    pub fn new(clusters: &[&str]) -> Self {
        Self::with_tunables(clusters, Tunables::default())
    }

    pub fn with_tunables(clusters: &[&str], tunables: Tunables) -> Self {
        let topo = topology(clusters);
        let nr_cpus = topo.nr_cpus();
        Self {
            dg: DomainGroup::new(&topo, &Cpumask::full(nr_cpus)).unwrap(),
            rqs: RunQueues::new(nr_cpus, tunables.priority_filter_cutoff),
            tunables,
            stats: HmpStats::new(),
            sink: RecordingSink::new(),
        }
    }

    pub fn policy(&self) -> HmpPolicy<'_> {
        HmpPolicy::new(&self.dg, &self.rqs, &self.tunables, &self.stats, &self.sink)
    }

    pub fn enqueue(&self, cpu: usize, task: Task) {
        self.rqs.lock(cpu).enqueue(task);
    }

    pub fn set_now(&self, now: u64) {
        for cpu in 0..self.rqs.nr_cpus() {
            self.rqs.set_clock(cpu, now);
        }
    }

    /// The environment of a move between the domain of @big_cpu and the
    /// domain of @little_cpu, seen from those two CPUs.
    pub fn env(&self, big_cpu: usize, little_cpu: usize) -> ClusterEnv {
        let big = self.dg.domain_of(big_cpu).unwrap();
        let little = self.dg.domain_of(little_cpu).unwrap();
        ClusterEnv::collect(
            &self.dg,
            &self.rqs,
            &self.tunables,
            big.cpus(),
            little.cpus(),
            Some(big_cpu),
            Some(little_cpu),
        )
    }
}
