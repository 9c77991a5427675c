// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Migration executor
//!
//! Carries out a migration the policy approved. Decisions are taken on
//! snapshots without holding any run queue lock, so everything is checked
//! again under the locks before a task is touched:
//!
//! 1. The source run queue is claimed: it must not be mid active balance
//!    and the task must still be on it. The task's migration stamp is
//!    updated right there.
//! 2. A task that is not running is moved at once, with both run queues
//!    locked lower CPU first.
//! 3. A running task can't be moved from under itself. The source is
//!    marked for active balance and the move is handed to its stopper,
//!    which performs it at the CPU's next safe point. If the stopper can't
//!    take the work, the active balance mark is rolled back and the next
//!    tick tries again.
//!
//! Whatever gets in the way, the attempt is dropped and the task stays
//! where it was. Nothing here returns an error.
use log::debug;

use crate::eligibility::HmpPolicy;
use crate::events::HmpEvent;
use crate::events::MigrationKind;
use crate::rq::Pid;
use crate::rq::RunQueue;
use crate::rq::RunQueues;
use crate::stopper::CpuStoppers;
use crate::stopper::StopCompletion;

/// One approved migration on its way to being carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub src_cpu: usize,
    pub dst_cpu: usize,
    pub pid: Pid,
    pub kind: MigrationKind,
}

#[derive(Debug)]
pub enum MigrationOutcome {
    Moved,
    Deferred(StopCompletion),
    Abandoned(&'static str),
    DispatchFailed,
}

impl MigrationOutcome {
    /// Whether the task moved or will be moved by the stopper.
    pub fn is_success(&self) -> bool {
        matches!(self, MigrationOutcome::Moved | MigrationOutcome::Deferred(_))
    }
}

pub struct MigrationExecutor<'a> {
    policy: &'a HmpPolicy<'a>,
    stoppers: &'a CpuStoppers<MigrationRequest>,
}

fn release(rq: &mut RunQueue) {
    rq.active_balance = false;
    rq.push_cpu = None;
    rq.migrate_task = None;
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(policy: &'a HmpPolicy<'a>, stoppers: &'a CpuStoppers<MigrationRequest>) -> Self {
        Self { policy, stoppers }
    }

    fn mark_task(rq: &mut RunQueue, pid: Pid, up: bool, now: u64) {
        if let Some(task) = rq.task_mut(pid) {
            if up {
                task.hmp.mark_up(now);
            } else {
                task.hmp.mark_down(now);
            }
        }
    }

    fn mark_cpu(rq: &mut RunQueue, up: bool, now: u64) {
        let stamps = &mut rq.stats_mut().hmp;
        if up {
            stamps.mark_up(now);
        } else {
            stamps.mark_down(now);
        }
    }

    fn abandon(&self, req: &MigrationRequest, reason: &'static str) -> MigrationOutcome {
        self.policy.stats.abandoned();
        self.policy.events.emit(&HmpEvent::MigrationAbandoned {
            cpu: req.src_cpu,
            pid: req.pid,
            reason,
        });
        MigrationOutcome::Abandoned(reason)
    }

    /// Carry out @req.
    pub fn execute(&self, req: &MigrationRequest) -> MigrationOutcome {
        let policy = self.policy;
        let nr_cpus = policy.dom_group.nr_cpus();
        if req.src_cpu >= nr_cpus || req.dst_cpu >= nr_cpus || req.src_cpu == req.dst_cpu {
            return self.abandon(req, "invalid");
        }
        if !policy.dom_group.cpu_online(req.dst_cpu) {
            return self.abandon(req, "offline");
        }

        let now = policy.now();
        let up = req.kind.is_up();
        let running = {
            let mut src = policy.rqs.lock(req.src_cpu);
            if src.active_balance {
                drop(src);
                return self.abandon(req, "active_balance");
            }
            if src.task(req.pid).is_none() {
                drop(src);
                return self.abandon(req, "task_gone");
            }
            Self::mark_task(&mut src, req.pid, up, now);
            src.push_cpu = Some(req.dst_cpu);
            src.migrate_task = Some(req.pid);
            let running = src.is_running(req.pid);
            if running {
                src.active_balance = true;
            }
            running
        };
        Self::mark_cpu(&mut policy.rqs.lock(req.dst_cpu), up, now);

        match req.kind {
            MigrationKind::IdlePull => policy.stats.idle_pull(),
            MigrationKind::Offload => policy.stats.offload(),
            // Counted when the policy approved them.
            MigrationKind::ForceUp | MigrationKind::ForceDown => {}
        }
        policy.events.emit(&HmpEvent::Migrate {
            pid: req.pid,
            dest_cpu: req.dst_cpu,
            kind: req.kind,
        });
        if req.kind == MigrationKind::IdlePull {
            policy
                .events
                .emit(&HmpEvent::MigrateIdleRunning { pid: req.pid, running });
        } else {
            policy
                .events
                .emit(&HmpEvent::MigrateForceRunning { pid: req.pid, running });
        }

        if !running {
            return self.migrate_runnable_task(req);
        }

        match self.stoppers.dispatch(req.src_cpu, req.clone()) {
            Ok(completion) => {
                policy.stats.deferred();
                MigrationOutcome::Deferred(completion)
            }
            Err(e) => {
                debug!("{:#}", e);
                release(&mut policy.rqs.lock(req.src_cpu));
                policy.stats.dispatch_failed();
                policy
                    .events
                    .emit(&HmpEvent::DispatchFailed { cpu: req.src_cpu });
                MigrationOutcome::DispatchFailed
            }
        }
    }

    /// Move a task which is not running, checking once more under both
    /// locks that nothing changed since it was picked.
    pub fn migrate_runnable_task(&self, req: &MigrationRequest) -> MigrationOutcome {
        let policy = self.policy;
        let reason = {
            let (mut src, mut dst) = match policy.rqs.double_lock(req.src_cpu, req.dst_cpu) {
                Ok(guards) => guards,
                Err(e) => {
                    debug!("{:#}", e);
                    return self.abandon(req, "invalid");
                }
            };

            if src.active_balance {
                Some("active_balance")
            } else if src.nr_running() <= 1 {
                release(&mut src);
                Some("nr_running")
            } else {
                let online = policy.dom_group.cpu_online(req.dst_cpu);
                let res = RunQueues::move_task(&mut src, &mut dst, req.pid, online);
                release(&mut src);
                match res {
                    Ok(()) => None,
                    Err(e) => {
                        debug!("{:#}", e);
                        Some("revalidate")
                    }
                }
            }
        };

        match reason {
            Some(reason) => self.abandon(req, reason),
            None => {
                policy.stats.moved();
                MigrationOutcome::Moved
            }
        }
    }

    /// Run the work pending on @cpu's stopper. Called by @cpu at a safe
    /// point. Returns whether a task was moved, None if there was nothing
    /// to do.
    pub fn run_stopper(&self, cpu: usize) -> Option<bool> {
        let ticket = self.stoppers.take(cpu)?;
        let req = ticket.work().clone();
        let moved = self.active_migrate(&req);
        ticket.complete(moved);
        Some(moved)
    }

    fn active_migrate(&self, req: &MigrationRequest) -> bool {
        let policy = self.policy;
        let reason = match policy.rqs.double_lock(req.src_cpu, req.dst_cpu) {
            Err(e) => {
                debug!("{:#}", e);
                release(&mut policy.rqs.lock(req.src_cpu));
                Some("invalid")
            }
            Ok((mut src, mut dst)) => {
                let reason = if !src.active_balance {
                    Some("stale")
                } else if !policy.dom_group.cpu_online(req.src_cpu) {
                    Some("offline")
                } else {
                    let online = policy.dom_group.cpu_online(req.dst_cpu);
                    let prev = src.preempt();
                    let res = RunQueues::move_task(&mut src, &mut dst, req.pid, online);
                    src.resume(prev);
                    match res {
                        Ok(()) => None,
                        Err(e) => {
                            debug!("{:#}", e);
                            Some("revalidate")
                        }
                    }
                };
                release(&mut src);
                reason
            }
        };

        match reason {
            Some(reason) => {
                self.abandon(req, reason);
                false
            }
            None => {
                policy.stats.moved();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumask::Cpumask;
    use crate::domain::DomainGroup;
    use crate::events::RecordingSink;
    use crate::rq::Task;
    use crate::stats::HmpStats;
    use crate::topology::ClusterSpec;
    use crate::topology::Topology;
    use crate::tunables::Tunables;

    struct Fixture {
        dg: DomainGroup,
        rqs: RunQueues,
        tunables: Tunables,
        stats: HmpStats,
        sink: RecordingSink,
        stoppers: CpuStoppers<MigrationRequest>,
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
                stoppers: CpuStoppers::new(4),
            }
        }

        fn policy(&self) -> HmpPolicy<'_> {
            HmpPolicy::new(&self.dg, &self.rqs, &self.tunables, &self.stats, &self.sink)
        }

        fn load(&self, cpu: usize, pid: i32, load: u32) {
            self.rqs
                .lock(cpu)
                .enqueue(Task::new(pid, "t", 4).with_load(load));
        }
    }

    fn req(src_cpu: usize, dst_cpu: usize, pid: Pid, kind: MigrationKind) -> MigrationRequest {
        MigrationRequest {
            src_cpu,
            dst_cpu,
            pid,
            kind,
        }
    }

    #[test]
    fn test_runnable_task_moves_now() {
        let fx = Fixture::new();
        fx.load(0, 1, 100);
        fx.load(0, 2, 900);
        fx.rqs.set_clock(0, 3000);
        let policy = fx.policy();
        let exec = MigrationExecutor::new(&policy, &fx.stoppers);

        let outcome = exec.execute(&req(0, 2, 2, MigrationKind::ForceUp));
        assert!(matches!(outcome, MigrationOutcome::Moved));
        let dst = fx.rqs.lock(2);
        assert_eq!(dst.task(2).unwrap().hmp.last_up_migration, Some(3000));
        assert_eq!(dst.stats().hmp.last_up_migration, Some(3000));
        drop(dst);
        assert!(!fx.rqs.lock(0).active_balance);
        assert_eq!(fx.stats.snapshot().nr_moved, 1);
        assert_eq!(
            fx.sink
                .count(|ev| matches!(ev, HmpEvent::MigrateForceRunning { running: false, .. })),
            1
        );
    }

    #[test]
    fn test_running_task_goes_through_stopper() {
        let fx = Fixture::new();
        fx.load(0, 1, 900);
        fx.rqs.set_clock(0, 10);
        let policy = fx.policy();
        let exec = MigrationExecutor::new(&policy, &fx.stoppers);

        let outcome = exec.execute(&req(0, 3, 1, MigrationKind::IdlePull));
        let MigrationOutcome::Deferred(done) = outcome else {
            panic!("expected deferred, got {:?}", outcome);
        };
        assert!(fx.rqs.lock(0).active_balance);
        assert_eq!(fx.rqs.lock(0).push_cpu, Some(3));
        assert_eq!(done.try_result(), None);

        // A second attempt while the first is in flight is turned away.
        let outcome = exec.execute(&req(0, 2, 1, MigrationKind::ForceUp));
        assert!(matches!(outcome, MigrationOutcome::Abandoned("active_balance")));

        assert_eq!(exec.run_stopper(0), Some(true));
        assert_eq!(done.try_result(), Some(true));
        assert!(fx.rqs.lock(3).is_running(1));
        assert!(!fx.rqs.lock(0).active_balance);
        assert_eq!(exec.run_stopper(0), None);

        let snap = fx.stats.snapshot();
        assert_eq!((snap.nr_idle_pull, snap.nr_deferred, snap.nr_moved), (1, 1, 1));
    }

    #[test]
    fn test_dispatch_failure_rolls_back() {
        let fx = Fixture::new();
        fx.load(2, 1, 100);
        let policy = fx.policy();
        let exec = MigrationExecutor::new(&policy, &fx.stoppers);
        let _busy = fx
            .stoppers
            .dispatch(2, req(2, 3, 99, MigrationKind::ForceDown))
            .unwrap();

        let outcome = exec.execute(&req(2, 0, 1, MigrationKind::ForceDown));
        assert!(matches!(outcome, MigrationOutcome::DispatchFailed));
        let rq = fx.rqs.lock(2);
        assert!(!rq.active_balance);
        assert_eq!(rq.push_cpu, None);
        assert!(rq.is_running(1));
        drop(rq);
        assert_eq!(fx.stats.snapshot().nr_dispatch_failed, 1);
        assert_eq!(fx.sink.count(|ev| matches!(ev, HmpEvent::DispatchFailed { cpu: 2 })), 1);
    }

    #[test]
    fn test_offline_destination_is_abandoned() {
        let fx = Fixture::new();
        fx.load(0, 1, 100);
        fx.load(0, 2, 900);
        let policy = fx.policy();
        let exec = MigrationExecutor::new(&policy, &fx.stoppers);

        fx.dg.set_cpu_online(2, false).unwrap();
        let outcome = exec.execute(&req(0, 2, 2, MigrationKind::ForceUp));
        assert!(matches!(outcome, MigrationOutcome::Abandoned("offline")));
        assert!(fx.rqs.lock(0).task(2).is_some());

        let outcome = exec.execute(&req(0, 3, 42, MigrationKind::ForceUp));
        assert!(matches!(outcome, MigrationOutcome::Abandoned("task_gone")));
        assert_eq!(fx.stats.snapshot().nr_abandoned, 2);
    }

    #[test]
    fn test_stopper_abandons_when_destination_went_away() {
        let fx = Fixture::new();
        fx.load(0, 1, 900);
        let policy = fx.policy();
        let exec = MigrationExecutor::new(&policy, &fx.stoppers);

        let outcome = exec.execute(&req(0, 2, 1, MigrationKind::ForceUp));
        assert!(outcome.is_success());
        fx.dg.set_cpu_online(2, false).unwrap();
        assert_eq!(exec.run_stopper(0), Some(false));
        let rq = fx.rqs.lock(0);
        assert!(rq.is_running(1));
        assert!(!rq.active_balance);
    }

    #[test]
    fn test_stamps_follow_direction() {
        let fx = Fixture::new();
        fx.load(0, 1, 100);
        fx.load(0, 2, 900);
        fx.load(2, 3, 500);
        let policy = fx.policy();
        let exec = MigrationExecutor::new(&policy, &fx.stoppers);

        // Clock 0 is a real point in time.
        let outcome = exec.execute(&req(0, 2, 2, MigrationKind::ForceUp));
        assert!(matches!(outcome, MigrationOutcome::Moved));
        let task = fx.rqs.lock(2).task(2).cloned().unwrap();
        assert_eq!(task.hmp.last_up_migration, Some(0));
        assert_eq!(fx.rqs.stats(2).hmp.last_up_migration, Some(0));
        assert!(!policy.cpu_up_stable(2));
        assert!(!policy.task_up_stable(&task));

        fx.rqs.set_clock(0, 1500);
        let outcome = exec.execute(&req(2, 1, 2, MigrationKind::ForceDown));
        assert!(matches!(outcome, MigrationOutcome::Moved));
        let task = fx.rqs.lock(1).task(2).cloned().unwrap();
        assert_eq!(task.hmp.last_up_migration, None);
        assert_eq!(task.hmp.last_down_migration, Some(1500));
        assert_eq!(fx.rqs.stats(1).hmp.last_down_migration, Some(1500));
        assert_eq!(fx.rqs.stats(1).hmp.last_up_migration, None);
        assert_eq!(fx.rqs.stats(2).hmp.last_up_migration, Some(0));
    }
}
