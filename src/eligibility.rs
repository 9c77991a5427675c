// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Migration eligibility
//!
//! Decides whether one task should move between a pair of clusters. An up
//! check walks these steps and stops at the first conclusive one:
//!
//! 1. Ineligible: one side has no online CPU, the task already runs on the
//!    big side or its affinity excludes the big side.
//! 2. Stabilizing: the target CPU took an up migration within the cool-down.
//! 3. Low priority tasks are held back while big is full or little still
//!    runs normal priority work.
//! 4. An idle big target is approved right away.
//! 5. The big target must afford the task on top of its current load.
//! 6. The task load must exceed the up threshold.
//!
//! Down checks mirror this. A busy big CPU hands a task to a fully idle
//! little one on wakeup, low priority tasks are pushed down while big is
//! full, and otherwise big must be oversubscribed, little must afford the
//! task and the load must be at or below the down threshold.
//!
//! Every check carries a `MigrationStatus` describing why it ended where it
//! did. The status is reported but never consulted by the engine.
//!
//! With `enhanced_mode` off, the simpler threshold-only rules are used
//! instead. Cool-downs then apply per task rather than per target CPU.
use log::trace;

use crate::cluster::ClusterEnv;
use crate::cluster::ClusterStats;
use crate::domain::DomainGroup;
use crate::events::EventSink;
use crate::events::HmpEvent;
use crate::rq::Task;
use crate::rq::RunQueues;
use crate::stats::HmpStats;
use crate::threshold::hmp_ratio;
use crate::tunables::Tunables;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MigrationStatus: u32 {
        const BIG_NOT_OVERSUBSCRIBED = 0x01;
        const BIG_CAPACITY_INSUFFICIENT = 0x02;
        const LITTLE_CAPACITY_INSUFFICIENT = 0x04;
        const LOW_PRIORITY_FILTER = 0x08;
        const BIG_BUSY_LITTLE_IDLE = 0x10;
        const BIG_IDLE = 0x20;
        const MIGRATION_APPROVED = 0x100;
        const TASK_UP_MIGRATION = 0x200;
        const TASK_DOWN_MIGRATION = 0x400;
        const GLOBAL_BALANCE = 0x1000;
        const SELECT_RQ = 0x2000;
        const LOAD_BALANCE = 0x4000;
    }
}

impl MigrationStatus {
    pub fn is_up(&self) -> bool {
        self.contains(MigrationStatus::TASK_UP_MIGRATION)
    }

    pub fn approved(&self) -> bool {
        self.contains(MigrationStatus::MIGRATION_APPROVED)
    }
}

/// Which path asked for the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    GlobalBalance,
    SelectRq,
    LoadBalance,
}

impl Caller {
    pub fn flag(&self) -> MigrationStatus {
        match self {
            Caller::GlobalBalance => MigrationStatus::GLOBAL_BALANCE,
            Caller::SelectRq => MigrationStatus::SELECT_RQ,
            Caller::LoadBalance => MigrationStatus::LOAD_BALANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationCheck {
    pub status: MigrationStatus,
    pub result: bool,
}

impl MigrationCheck {
    fn new(caller: Caller, dir: MigrationStatus) -> Self {
        Self {
            status: caller.flag() | dir,
            result: false,
        }
    }

    fn approve(&mut self, reason: MigrationStatus) {
        self.status |= reason | MigrationStatus::MIGRATION_APPROVED;
        self.result = true;
    }

    fn reject(&mut self, reason: MigrationStatus) {
        self.status |= reason;
    }
}

/// Load a task may carry and still be pushed down by the priority filter.
const LOW_PRIO_LOAD_LIMIT: u32 = 800;

fn stable(last: Option<u64>, cooldown: u64, now: u64) -> bool {
    match last {
        Some(last) => now.saturating_sub(last) >= cooldown,
        None => true,
    }
}

/// Everything a decision reads, borrowed for the duration of one
/// operation.
pub struct HmpPolicy<'a> {
    pub dom_group: &'a DomainGroup,
    pub rqs: &'a RunQueues,
    pub tunables: &'a Tunables,
    pub stats: &'a HmpStats,
    pub events: &'a dyn EventSink,
}

impl<'a> HmpPolicy<'a> {
    pub fn new(
        dom_group: &'a DomainGroup,
        rqs: &'a RunQueues,
        tunables: &'a Tunables,
        stats: &'a HmpStats,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            dom_group,
            rqs,
            tunables,
            stats,
            events,
        }
    }

    /// The clock of the first online CPU, shared by every timestamp.
    pub fn now(&self) -> u64 {
        self.dom_group
            .first_online()
            .map(|cpu| self.rqs.clock(cpu))
            .unwrap_or(0)
    }

    pub fn cpu_load(&self, cpu: usize) -> u32 {
        self.rqs.stats(cpu).load_avg_ratio
    }

    pub fn cpu_up_stable(&self, cpu: usize) -> bool {
        let last = self.rqs.stats(cpu).hmp.last_up_migration;
        stable(last, self.tunables.up_migration_cooldown, self.now())
    }

    pub fn cpu_down_stable(&self, cpu: usize) -> bool {
        let last = self.rqs.stats(cpu).hmp.last_down_migration;
        stable(last, self.tunables.down_migration_cooldown, self.now())
    }

    /// A CPU on the fast side receives up migrations and one on the slow
    /// side down migrations. Middle domains receive both.
    pub fn cpu_stable(&self, cpu: usize) -> bool {
        if self.dom_group.is_fastest(cpu) {
            self.cpu_up_stable(cpu)
        } else if self.dom_group.is_slowest(cpu) {
            self.cpu_down_stable(cpu)
        } else {
            self.cpu_up_stable(cpu) && self.cpu_down_stable(cpu)
        }
    }

    pub fn task_up_stable(&self, task: &Task) -> bool {
        stable(
            task.hmp.last_up_migration,
            self.tunables.up_migration_cooldown,
            self.now(),
        )
    }

    pub fn task_down_stable(&self, task: &Task) -> bool {
        stable(
            task.hmp.last_down_migration,
            self.tunables.down_migration_cooldown,
            self.now(),
        )
    }

    fn fast_cpu_has_spare_cycles(b: &ClusterStats, load: u32) -> bool {
        let cap = b.cpu_capacity as i64;
        (load as i64) < hmp_ratio(cap) - (cap >> 2)
    }

    fn task_fast_cpu_afford(&self, b: &ClusterStats, task: &Task, cpu: usize) -> bool {
        b.acap > 0 && Self::fast_cpu_has_spare_cycles(b, task.load_avg_ratio + self.cpu_load(cpu))
    }

    fn fast_cpu_oversubscribed(
        &self,
        caller: Caller,
        b: &ClusterStats,
        task: &Task,
        cpu: usize,
    ) -> bool {
        if caller == Caller::GlobalBalance {
            !Self::fast_cpu_has_spare_cycles(b, self.cpu_load(cpu))
        } else {
            !self.task_fast_cpu_afford(b, task, cpu)
        }
    }

    fn task_slow_cpu_afford(l: &ClusterStats, task: &Task) -> bool {
        l.acap > 0 && l.acap >= task.load_avg_ratio as i64
    }

    fn low_prio_up_rejected(&self, task: &Task, b: &ClusterStats, l: &ClusterStats) -> bool {
        self.tunables.task_is_low_priority(task.prio)
            && (b.ntask >= b.ncpu || l.nr_normal_prio != 0)
            && task.load_avg_ratio < LOW_PRIO_LOAD_LIMIT
    }

    fn low_prio_down_allowed(&self, task: &Task, b: &ClusterStats, l: &ClusterStats) -> bool {
        self.tunables.task_is_low_priority(task.prio)
            && b.nr_dequeuing_low_prio == 0
            && b.ntask >= b.ncpu
            && l.nr_normal_prio != 0
            && task.load_avg_ratio < LOW_PRIO_LOAD_LIMIT
    }

    fn trace_check(
        &self,
        check: &MigrationCheck,
        task: &Task,
        cpu: usize,
        target: usize,
        env: &ClusterEnv,
    ) {
        let up = check.status.is_up();
        if check.result && check.status.contains(MigrationStatus::GLOBAL_BALANCE) {
            if up {
                self.stats.force_up();
            } else {
                self.stats.force_down();
            }
        }
        let snap = self.stats.snapshot();
        self.events.emit(&HmpEvent::Stats {
            nr_force_up: snap.nr_force_up,
            nr_force_down: snap.nr_force_down,
        });
        self.events.emit(&HmpEvent::DynamicThreshold {
            pid: task.pid,
            threshold: if up {
                env.bstats.threshold
            } else {
                env.lstats.threshold
            },
            status: check.status,
            src_cpu: cpu,
            dst_cpu: target,
            load: task.load_avg_ratio,
            big: env.bstats.clone(),
            little: env.lstats.clone(),
        });
        trace!(
            "{} check pid={} {}->{} status={:#x} result={}",
            if up { "up" } else { "down" },
            task.pid,
            cpu,
            target,
            check.status.bits(),
            check.result
        );
    }

    /// Should @task move from @cpu on the little side of @env to @target on
    /// the big side?
    pub fn up_migration(
        &self,
        caller: Caller,
        cpu: usize,
        target: usize,
        task: &Task,
        env: &ClusterEnv,
    ) -> MigrationCheck {
        let (b, l) = (&env.bstats, &env.lstats);
        let mut check = MigrationCheck::new(caller, MigrationStatus::TASK_UP_MIGRATION);

        if l.ncpu == 0
            || b.ncpu == 0
            || env.bcpus.test_cpu(cpu)
            || !env.bcpus.intersects(&task.cpus_allowed)
        {
            return check;
        }

        if !self.cpu_up_stable(target) {
            return check;
        }

        if self.low_prio_up_rejected(task, b, l) {
            check.reject(MigrationStatus::LOW_PRIORITY_FILTER);
        } else if self.rqs.stats(target).rq_length() == 0 {
            check.approve(MigrationStatus::BIG_IDLE);
        } else if !self.task_fast_cpu_afford(b, task, target) {
            check.reject(MigrationStatus::BIG_CAPACITY_INSUFFICIENT);
        } else if task.load_avg_ratio > b.threshold {
            check.approve(MigrationStatus::empty());
        }

        self.trace_check(&check, task, cpu, target, env);
        check
    }

    /// Should @task move from @cpu on the big side of @env to @target on the
    /// little side?
    pub fn down_migration(
        &self,
        caller: Caller,
        cpu: usize,
        target: usize,
        task: &Task,
        env: &ClusterEnv,
    ) -> MigrationCheck {
        let (b, l) = (&env.bstats, &env.lstats);
        let mut check = MigrationCheck::new(caller, MigrationStatus::TASK_DOWN_MIGRATION);

        if l.ncpu == 0
            || b.ncpu == 0
            || env.lcpus.test_cpu(cpu)
            || !env.lcpus.intersects(&task.cpus_allowed)
        {
            return check;
        }

        if !self.cpu_down_stable(target) {
            return check;
        }

        if self.rqs.stats(target).rq_length() == 0
            && caller == Caller::SelectRq
            && self.rqs.stats(cpu).rq_length() > 0
        {
            check.approve(MigrationStatus::BIG_BUSY_LITTLE_IDLE);
        } else if self.low_prio_down_allowed(task, b, l) {
            self.rqs.lock(cpu).stats_mut().nr_dequeuing_low_prio += 1;
            check.approve(MigrationStatus::LOW_PRIORITY_FILTER);
        } else if !self.fast_cpu_oversubscribed(caller, b, task, cpu) {
            check.reject(MigrationStatus::BIG_NOT_OVERSUBSCRIBED);
        } else if !Self::task_slow_cpu_afford(l, task) {
            check.reject(MigrationStatus::LITTLE_CAPACITY_INSUFFICIENT);
        } else if l.threshold >= task.load_avg_ratio {
            check.approve(MigrationStatus::empty());
        }

        self.trace_check(&check, task, cpu, target, env);
        check
    }

    /// Threshold-only up check. Returns the idle faster CPU to move to.
    pub fn classic_up_migration(&self, cpu: usize, task: &Task) -> Option<usize> {
        if self.dom_group.is_fastest(cpu) {
            return None;
        }
        if self.tunables.task_is_low_priority(task.prio) {
            return None;
        }
        if task.load_avg_ratio < self.tunables.up_threshold {
            return None;
        }
        if !self.task_up_stable(task) {
            return None;
        }
        let faster = self.dom_group.faster_domain(cpu).ok()?;
        match self.domain_min_load(faster, Some(&task.cpus_allowed)) {
            (0, Some(target)) => Some(target),
            _ => None,
        }
    }

    /// Threshold-only down check.
    pub fn classic_down_migration(&self, cpu: usize, task: &Task) -> bool {
        if self.dom_group.is_slowest(cpu) {
            return self.tunables.packing_enabled;
        }
        let Ok(slower) = self.dom_group.slower_domain(cpu) else {
            return false;
        };
        let allowed = slower.cpus().intersects(&task.cpus_allowed);

        if self.tunables.task_is_low_priority(task.prio) && allowed {
            return true;
        }
        if !self.task_down_stable(task) {
            return false;
        }
        allowed && task.load_avg_ratio < self.tunables.down_threshold
    }

    /// Where @task should be offloaded to from @cpu, if anywhere. Only a
    /// task sharing a CPU of a fully busy domain, and getting too little
    /// of that CPU, is sent to an idle CPU of the slower domain.
    pub fn offload_down(&self, cpu: usize, task: &Task) -> Option<usize> {
        if self.dom_group.is_slowest(cpu) {
            return None;
        }
        let own = self.dom_group.domain_of(cpu)?;
        let slower = self.dom_group.slower_domain(cpu).ok()?;

        let abort = |value: u64, reason: &'static str| {
            self.events
                .emit(&HmpEvent::OffloadAbort { cpu, value, reason });
            None
        };

        let (min_load, _) = self.domain_min_load(own, None);
        if min_load == 0 {
            return abort(min_load as u64, "load");
        }

        let nr_running = self.rqs.stats(cpu).nr_running;
        if nr_running < 2 {
            return abort(nr_running as u64, "nr_running");
        }

        let starvation = task.run_ratio();
        if starvation > self.tunables.starvation_cutoff {
            return abort(starvation as u64, "starvation");
        }

        match self.domain_min_load(slower, Some(&task.cpus_allowed)) {
            (0, Some(dest_cpu)) => {
                self.events
                    .emit(&HmpEvent::OffloadSucceed { cpu, dest_cpu });
                Some(dest_cpu)
            }
            (min_load, _) => abort(min_load as u64, "slowdomain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumask::Cpumask;
    use crate::events::RecordingSink;
    use crate::topology::ClusterSpec;
    use crate::topology::Topology;

    struct Fixture {
        dg: DomainGroup,
        rqs: RunQueues,
        tunables: Tunables,
        stats: HmpStats,
        sink: RecordingSink,
    }

    impl Fixture {
        fn new() -> Self {
            let specs: Vec<ClusterSpec> = ["0-1:a53:1300", "2-3:a57:1900"]
                .iter()
                .map(|s| s.parse().unwrap())
                .collect();
            let topo = Topology::from_clusters(&specs).unwrap();
            Self {
                dg: DomainGroup::new(&topo, &Cpumask::full(4)).unwrap(),
                rqs: RunQueues::new(4, 125),
                tunables: Tunables::default(),
                stats: HmpStats::new(),
                sink: RecordingSink::new(),
            }
        }

        fn policy(&self) -> HmpPolicy<'_> {
            HmpPolicy::new(&self.dg, &self.rqs, &self.tunables, &self.stats, &self.sink)
        }

        fn env(&self, btarget: usize, ltarget: usize) -> ClusterEnv {
            ClusterEnv::collect(
                &self.dg,
                &self.rqs,
                &self.tunables,
                self.dg.fastest().cpus(),
                self.dg.slowest().cpus(),
                Some(btarget),
                Some(ltarget),
            )
        }

        fn task_on(&self, cpu: usize, pid: i32, load: u32) -> Task {
            let task = Task::new(pid, "t", 4).with_load(load);
            self.rqs.lock(cpu).enqueue(task.clone());
            task
        }
    }

    #[test]
    fn test_up_to_idle_big() {
        let fx = Fixture::new();
        let task = fx.task_on(0, 1, 900);
        let env = fx.env(2, 0);
        let check = fx.policy().up_migration(Caller::GlobalBalance, 0, 2, &task, &env);
        assert!(check.result);
        assert!(check.status.contains(MigrationStatus::BIG_IDLE));
        assert!(check.status.approved());
        assert_eq!(fx.stats.snapshot().nr_force_up, 1);
    }

    #[test]
    fn test_up_rejected_on_busy_big() {
        let fx = Fixture::new();
        fx.task_on(2, 10, 1000);
        fx.task_on(3, 11, 1000);
        let task = fx.task_on(0, 1, 900);
        let env = fx.env(2, 0);
        let check = fx.policy().up_migration(Caller::GlobalBalance, 0, 2, &task, &env);
        assert!(!check.result);
        assert!(check.status.contains(MigrationStatus::BIG_CAPACITY_INSUFFICIENT));
        assert_eq!(fx.stats.snapshot().nr_force_up, 0);
    }

    #[test]
    fn test_up_ineligible_from_big_or_pinned() {
        let fx = Fixture::new();
        let task = fx.task_on(2, 1, 900);
        let env = fx.env(3, 0);
        let check = fx.policy().up_migration(Caller::GlobalBalance, 2, 3, &task, &env);
        assert!(!check.result);

        let pinned = Task::new(2, "p", 4)
            .with_load(900)
            .with_affinity(Cpumask::from_cpulist("0-1", 4).unwrap());
        fx.rqs.lock(0).enqueue(pinned.clone());
        let check = fx.policy().up_migration(Caller::GlobalBalance, 0, 2, &pinned, &env);
        assert!(!check.result);
        assert!(fx.sink.events().is_empty());
    }

    #[test]
    fn test_up_cooldown_on_target() {
        let fx = Fixture::new();
        let task = fx.task_on(0, 1, 900);
        fx.rqs.lock(2).stats_mut().hmp.mark_up(1000);
        fx.rqs.set_clock(0, 2000);
        let env = fx.env(2, 0);
        let check = fx.policy().up_migration(Caller::GlobalBalance, 0, 2, &task, &env);
        assert!(!check.result);

        fx.rqs.set_clock(0, 5200);
        let check = fx.policy().up_migration(Caller::GlobalBalance, 0, 2, &task, &env);
        assert!(check.result);
    }

    #[test]
    fn test_low_priority_filter_up() {
        let fx = Fixture::new();
        fx.task_on(1, 5, 100);
        let task = Task::new(1, "bg", 4).with_load(700).with_prio(130);
        fx.rqs.lock(0).enqueue(task.clone());
        let env = fx.env(2, 0);
        let check = fx.policy().up_migration(Caller::GlobalBalance, 0, 2, &task, &env);
        assert!(!check.result);
        assert!(check.status.contains(MigrationStatus::LOW_PRIORITY_FILTER));
    }

    #[test]
    fn test_down_big_busy_little_idle_on_wakeup() {
        let fx = Fixture::new();
        fx.task_on(2, 10, 300);
        let task = Task::new(1, "w", 4).with_load(200);
        let env = fx.env(2, 0);
        let check = fx.policy().down_migration(Caller::SelectRq, 2, 0, &task, &env);
        assert!(check.result);
        assert!(check.status.contains(MigrationStatus::BIG_BUSY_LITTLE_IDLE));
    }

    #[test]
    fn test_down_requires_oversubscribed_big() {
        let fx = Fixture::new();
        let task = fx.task_on(2, 1, 100);
        fx.task_on(0, 2, 100);
        let env = fx.env(2, 0);
        let check = fx.policy().down_migration(Caller::GlobalBalance, 2, 0, &task, &env);
        assert!(!check.result);
        assert!(check.status.contains(MigrationStatus::BIG_NOT_OVERSUBSCRIBED));
    }

    #[test]
    fn test_down_low_priority_pushes_once() {
        let fx = Fixture::new();
        fx.task_on(0, 20, 100);
        fx.task_on(2, 10, 600);
        fx.task_on(3, 11, 600);
        let task = Task::new(1, "bg", 4).with_load(300).with_prio(130);
        fx.rqs.lock(2).enqueue(task.clone());

        let env = fx.env(2, 1);
        let check = fx.policy().down_migration(Caller::GlobalBalance, 2, 1, &task, &env);
        assert!(check.result);
        assert!(check.status.contains(MigrationStatus::LOW_PRIORITY_FILTER));
        assert_eq!(fx.rqs.stats(2).nr_dequeuing_low_prio, 1);

        let env = fx.env(2, 1);
        let check = fx.policy().down_migration(Caller::GlobalBalance, 2, 1, &task, &env);
        assert!(!check.status.contains(MigrationStatus::LOW_PRIORITY_FILTER));
    }

    #[test]
    fn test_classic_rules() {
        let mut fx = Fixture::new();
        fx.tunables.enhanced_mode = false;
        let heavy = fx.task_on(0, 1, 800);
        assert_eq!(fx.policy().classic_up_migration(0, &heavy), Some(2));

        let light = Task::new(2, "l", 4).with_load(100);
        assert_eq!(fx.policy().classic_up_migration(0, &light), None);
        assert!(fx.policy().classic_down_migration(2, &light));
        assert!(!fx.policy().classic_down_migration(2, &heavy));

        let bg = Task::new(3, "bg", 4).with_load(900).with_prio(130);
        assert!(fx.policy().classic_down_migration(3, &bg));
        assert_eq!(fx.policy().classic_up_migration(0, &bg), None);
    }

    fn offload_reasons(fx: &Fixture) -> Vec<&'static str> {
        fx.sink
            .events()
            .iter()
            .filter_map(|ev| match ev {
                HmpEvent::OffloadAbort { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_offload_guards() {
        let fx = Fixture::new();
        let task = fx.task_on(2, 1, 300);
        // cpu3 is idle
        assert_eq!(fx.policy().offload_down(2, &task), None);
        assert_eq!(fx.policy().offload_down(0, &task), None);

        fx.task_on(3, 2, 300);
        assert_eq!(fx.policy().offload_down(2, &task), None);

        // Alone on its CPU, it gets all of it.
        let alone = fx.rqs.lock(2).task(1).cloned().unwrap();
        assert_eq!(fx.policy().offload_down(2, &alone), None);
        assert_eq!(offload_reasons(&fx), vec!["load", "nr_running", "nr_running"]);
    }

    #[test]
    fn test_offload_to_idle_little() {
        let fx = Fixture::new();
        fx.task_on(2, 1, 300);
        fx.task_on(2, 2, 200);
        fx.task_on(3, 3, 300);
        fx.task_on(0, 4, 100);

        let waiting = fx.rqs.lock(2).task(2).cloned().unwrap();
        assert!(waiting.run_ratio() < fx.tunables.starvation_cutoff);
        assert_eq!(fx.policy().offload_down(2, &waiting), Some(1));
        assert_eq!(
            fx.sink
                .count(|ev| matches!(ev, HmpEvent::OffloadSucceed { cpu: 2, dest_cpu: 1 })),
            1
        );

        let starved = Task::new(5, "s", 4).with_load(200);
        assert_eq!(fx.policy().offload_down(2, &starved), None);
        assert_eq!(offload_reasons(&fx), vec!["starvation"]);

        fx.task_on(1, 6, 100);
        assert_eq!(fx.policy().offload_down(2, &waiting), None);
        assert_eq!(offload_reasons(&fx), vec!["starvation", "slowdomain"]);
    }
}
