// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Task and CPU selection
//!
//! Helpers picking which task to move and where to put it. All of them are
//! bounded: task scans look at no more than `max_search_tasks` entries and
//! CPU scans at one domain.
use log::debug;

use crate::cluster::ClusterEnv;
use crate::cpumask::Cpumask;
use crate::domain::CapacityDomain;
use crate::eligibility::Caller;
use crate::eligibility::HmpPolicy;
use crate::events::HmpEvent;
use crate::rq::RunQueue;
use crate::rq::Task;
use crate::tunables::HMP_MAX_LOAD;
use crate::tunables::NICE_0_LOAD;

impl<'a> HmpPolicy<'a> {
    /// Look for an idle CPU in @dom, optionally restricted to @affinity.
    /// Returns 0 and the CPU if one is found. Otherwise the load is 1023
    /// and the CPU, if any, is the one which went the longest without a
    /// migration.
    pub fn domain_min_load(
        &self,
        dom: &CapacityDomain,
        affinity: Option<&Cpumask>,
    ) -> (u32, Option<usize>) {
        let mut mask = dom.cpus().and(&self.dom_group.online_mask());
        if let Some(affinity) = affinity {
            mask = mask.and(affinity);
        }

        let mut min_load = HMP_MAX_LOAD;
        let mut min_cpu = None;
        let mut min_last_migration = None;
        for cpu in mask.iter() {
            let stats = self.rqs.stats(cpu);
            let last = stats.hmp.last_migration();
            // Any load at all counts as busy.
            let contrib = if stats.load_avg_ratio > 0 {
                HMP_MAX_LOAD
            } else {
                0
            };

            if min_cpu.is_none()
                || contrib < min_load
                || (contrib == min_load && last < min_last_migration)
            {
                min_load = contrib;
                min_cpu = Some(cpu);
                min_last_migration = last;
            }
        }

        (min_load, min_cpu)
    }

    fn weighted_load(&self, cpu: usize) -> u64 {
        let stats = self.rqs.stats(cpu);
        (stats.load_avg_ratio as u64 + 1 + stats.pending_load as u64) * stats.rq_length() as u64
    }

    /// The least loaded online CPU of @mask which @task may run on, load
    /// being weighed by queue length. Ties go to @prev. Global balance
    /// skips CPUs still cooling down from a migration.
    pub fn select_cpu(
        &self,
        caller: Caller,
        task: &Task,
        mask: &Cpumask,
        prev: Option<usize>,
    ) -> Option<usize> {
        let candidates = mask
            .and(&self.dom_group.online_mask())
            .and(&task.cpus_allowed);

        let mut target: Option<(usize, u64)> = None;
        for cpu in candidates.iter() {
            if caller == Caller::GlobalBalance && !self.cpu_stable(cpu) {
                continue;
            }
            let wload = self.weighted_load(cpu);
            target = match target {
                None => Some((cpu, wload)),
                Some((_, best)) if wload < best => Some((cpu, wload)),
                Some((_, best)) if wload == best && Some(cpu) == prev => Some((cpu, wload)),
                keep => keep,
            };
        }
        target.map(|(cpu, _)| cpu)
    }

    /// The heaviest of the first few tasks on @rq, starting from the running
    /// one, which may move towards the faster domain. With @target set, only
    /// tasks allowed there count, and None is returned if @target is not in
    /// the faster domain. On the fastest domain the running task is
    /// returned as is.
    pub fn heaviest_task(&self, rq: &RunQueue, target: Option<usize>) -> Option<Task> {
        let curr = rq.curr()?;
        if self.dom_group.is_fastest(rq.cpu()) {
            return Some(curr.clone());
        }
        let faster = self.dom_group.faster_domain(rq.cpu()).ok()?;
        let target_mask = match target {
            Some(cpu) if !faster.cpus().test_cpu(cpu) => return None,
            Some(cpu) => Cpumask::from_cpus([cpu], self.dom_group.nr_cpus()),
            None => faster.cpus().clone(),
        };

        let mut max = curr;
        for task in rq.queued().take(self.tunables.max_search_tasks) {
            if task.load_avg_ratio > max.load_avg_ratio
                && target_mask.intersects(&task.cpus_allowed)
            {
                max = task;
            }
        }
        Some(max.clone())
    }

    /// The lightest of the first few tasks on @rq which may move to the
    /// slower domain, starting from the running one. Without
    /// @migrate_down, or on the slowest domain, the running task is
    /// returned.
    pub fn lightest_task(&self, rq: &RunQueue, migrate_down: bool) -> Option<Task> {
        let curr = rq.curr()?;
        if !migrate_down || self.dom_group.is_slowest(rq.cpu()) {
            return Some(curr.clone());
        }
        let slower = self.dom_group.slower_domain(rq.cpu()).ok()?;

        let mut min = curr;
        for task in rq.queued().take(self.tunables.max_search_tasks) {
            if task.load_avg_ratio < min.load_avg_ratio
                && slower.cpus().intersects(&task.cpus_allowed)
            {
                min = task;
            }
        }
        Some(min.clone())
    }

    fn select_in_domain(&self, task: &Task, dom: &CapacityDomain) -> Option<usize> {
        match self.domain_min_load(dom, None) {
            (_, Some(cpu)) if task.cpus_allowed.test_cpu(cpu) => Some(cpu),
            _ => dom
                .cpus()
                .and(&self.dom_group.online_mask())
                .and(&task.cpus_allowed)
                .first(),
        }
    }

    /// A CPU one domain slower than @cpu for @task. On the slowest domain,
    /// its own domain is searched.
    pub fn select_slower_cpu(&self, task: &Task, cpu: usize) -> Option<usize> {
        let dom = match self.dom_group.slower_domain(cpu) {
            Ok(dom) => dom,
            Err(_) => self.dom_group.domain_of(cpu)?,
        };
        self.select_in_domain(task, dom)
    }

    /// First fit packing onto the slower side. The first online allowed CPU
    /// which stays at or under the full threshold with @task added wins.
    /// Heavy tasks, or any task with packing off, go through the regular
    /// slower CPU selection. Falls back to @cpu.
    pub fn best_little_cpu(&self, task: &Task, cpu: usize) -> usize {
        if !self.tunables.packing_enabled || task.load_avg_ratio > NICE_0_LOAD * 90 / 100 {
            return self.select_slower_cpu(task, cpu).unwrap_or(cpu);
        }

        let dom = match self.dom_group.slower_domain(cpu) {
            Ok(dom) => dom,
            Err(_) => match self.dom_group.domain_of(cpu) {
                Some(dom) => dom,
                None => return cpu,
            },
        };

        let allowed = dom
            .cpus()
            .and(&self.dom_group.online_mask())
            .and(&task.cpus_allowed);
        for tmp_cpu in allowed.iter() {
            let estimated = self.cpu_load(tmp_cpu) + task.load_avg_ratio;
            if estimated <= self.tunables.packing_full_threshold {
                return tmp_cpu;
            }
        }
        cpu
    }

    /// A task running less than a quarter of the time.
    pub fn is_light_task(task: &Task) -> bool {
        (task.usage_avg_sum << 2) < task.runnable_avg_period
    }

    /// A CPU with a high load, or a small load spread over many tasks.
    pub fn is_buddy_busy(&self, cpu: usize) -> bool {
        let stats = self.rqs.stats(cpu);
        let usage = (stats.usage_avg_sum as u64)
            .checked_shl(stats.nr_running)
            .unwrap_or(u64::MAX);
        usage > stats.runnable_avg_period as u64
    }

    /// The CPU small tasks of @cpu get packed onto: the first online CPU
    /// of the slowest domain.
    pub fn pack_buddy(&self, _cpu: usize) -> Option<usize> {
        self.dom_group.online_cpus(self.dom_group.nr_doms() - 1).first()
    }

    /// Place a waking @task that last ran on @prev_cpu. @fallback is used
    /// when there is no choice to make. The chosen CPU gets the task's load
    /// reserved as pending until the task is enqueued there.
    pub fn select_task_rq(
        &self,
        task: &Task,
        prev_cpu: usize,
        fallback: usize,
        created: bool,
    ) -> usize {
        let (new_cpu, step, env) = self.pick_task_rq(task, prev_cpu, created);
        let new_cpu = new_cpu
            .filter(|cpu| *cpu < self.dom_group.nr_cpus())
            .unwrap_or(if fallback < self.dom_group.nr_cpus() {
                fallback
            } else {
                prev_cpu
            });

        if new_cpu < self.dom_group.nr_cpus() {
            let mut rq = self.rqs.lock(new_cpu);
            let stats = rq.stats_mut();
            stats.nr_pending += 1;
            stats.pending_load += task.load_avg_ratio;
        }

        if let Some(env) = env {
            self.events.emit(&HmpEvent::Load {
                big_load_avg: env.bstats.load_avg,
                little_load_avg: env.lstats.load_avg,
            });
        }
        self.events.emit(&HmpEvent::SelectTaskRq {
            pid: task.pid,
            step,
            prev_cpu,
            new_cpu,
            load: task.load_avg_ratio,
        });
        debug!(
            "select_task_rq pid={} prev={} new={} step={}",
            task.pid, prev_cpu, new_cpu, step
        );
        new_cpu
    }

    fn pick_task_rq(
        &self,
        task: &Task,
        prev_cpu: usize,
        created: bool,
    ) -> (Option<usize>, u32, Option<ClusterEnv>) {
        if prev_cpu >= self.dom_group.nr_cpus() {
            return (None, 0, None);
        }
        if self.dom_group.nr_online() == 1 || self.dom_group.arch_is_smp() {
            return (None, 0, None);
        }

        if !self.tunables.enhanced_mode {
            if let Some(target) = self.classic_up_migration(prev_cpu, task) {
                return (Some(target), 2, None);
            }
            if self.classic_down_migration(prev_cpu, task) {
                return (Some(self.best_little_cpu(task, prev_cpu)), 3, None);
            }
            return (Some(prev_cpu), 4, None);
        }

        // The two domains around @prev_cpu.
        let Some(prev_dom) = self.dom_group.cpu_dom_id(prev_cpu) else {
            return (None, 0, None);
        };
        let (big_id, little_id) = if prev_dom == 0 {
            (0, 1)
        } else {
            (prev_dom - 1, prev_dom)
        };
        let (Some(big), Some(little)) = (self.dom_group.dom(big_id), self.dom_group.dom(little_id))
        else {
            return (None, 0, None);
        };

        let b_target = self.select_cpu(Caller::SelectRq, task, big.cpus(), Some(prev_cpu));
        let l_target = self.select_cpu(Caller::SelectRq, task, little.cpus(), Some(prev_cpu));
        let (Some(b_target), Some(l_target)) = (b_target, l_target) else {
            return (None, 0, None);
        };

        if created && !self.tunables.task_is_low_priority(task.prio) {
            if self.rqs.stats(b_target).rq_length() == 0 {
                return (Some(b_target), 1, None);
            }
            if self.rqs.stats(l_target).rq_length() == 0 {
                return (Some(l_target), 1, None);
            }
        }

        let env = ClusterEnv::collect(
            self.dom_group,
            self.rqs,
            self.tunables,
            big.cpus(),
            little.cpus(),
            Some(b_target),
            Some(l_target),
        );

        if self
            .up_migration(Caller::SelectRq, l_target, b_target, task, &env)
            .result
        {
            return (Some(b_target), 2, Some(env));
        }
        if self
            .down_migration(Caller::SelectRq, b_target, l_target, task, &env)
            .result
        {
            return (Some(l_target), 3, Some(env));
        }
        if little.cpus().test_cpu(prev_cpu) {
            (Some(l_target), 4, Some(env))
        } else {
            (Some(b_target), 4, Some(env))
        }
    }
}
