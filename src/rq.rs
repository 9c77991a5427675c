// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-CPU run queues
//!
//! The engine does not schedule anything itself. It reads the state of each
//! CPU's run queue, decides where tasks should live, and moves them between
//! queues. This module is the run queue model it works against: tasks with
//! their tracked load, one queue per CPU behind its own lock, and a per-CPU
//! clock readable without taking any lock.
//!
//! Lock ordering: a thread holds at most one run queue lock at a time, except
//! through `RunQueues::double_lock()` which always takes the lower CPU id
//! first.
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Result;

use crate::cpumask::Cpumask;
use crate::tunables::DEFAULT_PRIO;
use crate::tunables::HMP_MAX_LOAD;

pub type Pid = i32;

/// Maximum value of the geometric runnable sums.
pub const LOAD_AVG_MAX: u32 = 47742;

/// When a task or CPU was last moved between domains, None if never.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStamps {
    pub last_up_migration: Option<u64>,
    pub last_down_migration: Option<u64>,
}

impl MigrationStamps {
    /// The most recent migration, preferring the up timestamp.
    pub fn last_migration(&self) -> Option<u64> {
        self.last_up_migration.or(self.last_down_migration)
    }

    pub fn mark_up(&mut self, now: u64) {
        self.last_up_migration = Some(now);
        self.last_down_migration = None;
    }

    pub fn mark_down(&mut self, now: u64) {
        self.last_down_migration = Some(now);
        self.last_up_migration = None;
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub comm: String,
    pub prio: i32,
    /// Tracked load on the 0..=1023 scale.
    pub load_avg_ratio: u32,
    pub usage_avg_sum: u32,
    pub runnable_avg_sum: u32,
    pub runnable_avg_period: u32,
    pub cpus_allowed: Cpumask,
    pub hmp: MigrationStamps,
}

impl Task {
    pub fn new(pid: Pid, comm: &str, nr_cpus: usize) -> Self {
        Self {
            pid,
            comm: comm.to_string(),
            prio: DEFAULT_PRIO,
            load_avg_ratio: 0,
            usage_avg_sum: 0,
            runnable_avg_sum: 0,
            runnable_avg_period: LOAD_AVG_MAX,
            cpus_allowed: Cpumask::full(nr_cpus),
            hmp: MigrationStamps::default(),
        }
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.set_load(load);
        self
    }

    pub fn with_prio(mut self, prio: i32) -> Self {
        self.prio = prio;
        self
    }

    pub fn with_affinity(mut self, cpus_allowed: Cpumask) -> Self {
        self.cpus_allowed = cpus_allowed;
        self
    }

    /// Set the tracked load and derive runnable and usage sums consistent
    /// with a task that runs whenever it is runnable.
    pub fn set_load(&mut self, load: u32) {
        let load = load.min(HMP_MAX_LOAD);
        self.load_avg_ratio = load;
        self.runnable_avg_sum =
            ((self.runnable_avg_period as u64 * load as u64) >> 10) as u32;
        self.usage_avg_sum = self.runnable_avg_sum;
    }

    /// Share of its runnable time the task actually ran, on the 0..=1024
    /// scale. Tasks waiting for a CPU score low.
    pub fn run_ratio(&self) -> u32 {
        ((self.usage_avg_sum as u64 * 1024) / (self.runnable_avg_sum as u64 + 1)) as u32
    }
}

/// Per-CPU counters read by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RqStats {
    pub nr_running: u32,
    pub load_avg_ratio: u32,
    pub usage_avg_sum: u32,
    pub runnable_avg_period: u32,
    pub hmp: MigrationStamps,
    /// Load and count of tasks placed on this CPU but not enqueued yet.
    pub pending_load: u32,
    pub nr_pending: u32,
    pub nr_normal_prio: u32,
    pub nr_dequeuing_low_prio: u32,
}

impl RqStats {
    /// Queue length including placements still in flight.
    pub fn rq_length(&self) -> u32 {
        self.nr_running + self.nr_pending
    }
}

#[derive(Debug)]
pub struct RunQueue {
    cpu: usize,
    curr: Option<Pid>,
    tasks: VecDeque<Task>,
    prio_cutoff: i32,
    stats: RqStats,
    pub active_balance: bool,
    pub push_cpu: Option<usize>,
    pub migrate_task: Option<Pid>,
}

impl RunQueue {
    fn new(cpu: usize, prio_cutoff: i32) -> Self {
        Self {
            cpu,
            curr: None,
            tasks: VecDeque::new(),
            prio_cutoff,
            stats: RqStats::default(),
            active_balance: false,
            push_cpu: None,
            migrate_task: None,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn stats(&self) -> &RqStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RqStats {
        &mut self.stats
    }

    pub fn nr_running(&self) -> u32 {
        self.stats.nr_running
    }

    pub fn load(&self) -> u32 {
        self.stats.load_avg_ratio
    }

    pub fn curr(&self) -> Option<&Task> {
        self.curr.and_then(|pid| self.task(pid))
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.curr == Some(pid)
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.pid == pid)
    }

    /// The running task first, then the waiting ones in queue order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.curr()
            .into_iter()
            .chain(self.tasks.iter().filter(move |t| Some(t.pid) != self.curr))
    }

    /// Tasks waiting behind the running one.
    pub fn queued(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.iter().filter(move |t| Some(t.pid) != self.curr)
    }

    /// Add @task. An idle CPU starts running it right away. A pending
    /// placement reserved for the task is consumed.
    pub fn enqueue(&mut self, task: Task) {
        if self.stats.nr_pending > 0 {
            self.stats.nr_pending -= 1;
            self.stats.pending_load = self.stats.pending_load.saturating_sub(task.load_avg_ratio);
        }
        if self.curr.is_none() {
            self.curr = Some(task.pid);
        }
        self.tasks.push_back(task);
        self.update_load();
    }

    /// Remove @pid. If it was running, the next queued task takes over.
    pub fn dequeue(&mut self, pid: Pid) -> Option<Task> {
        let idx = self.tasks.iter().position(|t| t.pid == pid)?;
        let task = self.tasks.remove(idx)?;
        if self.curr == Some(pid) {
            self.curr = self.tasks.front().map(|t| t.pid);
        }
        if task.prio >= self.prio_cutoff {
            self.stats.nr_dequeuing_low_prio = self.stats.nr_dequeuing_low_prio.saturating_sub(1);
        }
        self.update_load();
        Some(task)
    }

    /// Round robin to the next queued task.
    pub fn schedule(&mut self) {
        let Some(curr) = self.curr else {
            self.curr = self.tasks.front().map(|t| t.pid);
            return;
        };
        if let Some(idx) = self.tasks.iter().position(|t| t.pid == curr) {
            if let Some(task) = self.tasks.remove(idx) {
                self.tasks.push_back(task);
            }
        }
        self.curr = self.tasks.front().map(|t| t.pid);
    }

    /// Take the CPU away from the running task. Used by the stopper, which
    /// runs in place of the task while it moves it.
    pub fn preempt(&mut self) -> Option<Pid> {
        self.curr.take()
    }

    /// Give the CPU back after `preempt()`: to @prev if it is still here,
    /// to the first queued task otherwise.
    pub fn resume(&mut self, prev: Option<Pid>) {
        if self.curr.is_some() {
            return;
        }
        self.curr = match prev {
            Some(pid) if self.task(pid).is_some() => Some(pid),
            _ => self.tasks.front().map(|t| t.pid),
        };
    }

    pub fn set_prio_cutoff(&mut self, prio_cutoff: i32) {
        self.prio_cutoff = prio_cutoff;
        self.update_load();
    }

    /// Recompute the aggregate counters after task loads changed.
    pub fn update_load(&mut self) {
        // Runnable tasks share the CPU evenly.
        let nr = self.tasks.len() as u32;
        for task in self.tasks.iter_mut() {
            task.usage_avg_sum = task.runnable_avg_sum / nr;
        }

        let load: u32 = self.tasks.iter().map(|t| t.load_avg_ratio).sum();
        self.stats.nr_running = nr;
        self.stats.load_avg_ratio = load.min(HMP_MAX_LOAD);
        self.stats.usage_avg_sum = self.tasks.iter().map(|t| t.usage_avg_sum).sum();
        self.stats.runnable_avg_period = self
            .tasks
            .iter()
            .map(|t| t.runnable_avg_period)
            .max()
            .unwrap_or(LOAD_AVG_MAX);
        self.stats.nr_normal_prio = self
            .tasks
            .iter()
            .filter(|t| t.prio < self.prio_cutoff)
            .count() as u32;
    }
}

#[derive(Debug)]
pub struct RunQueues {
    rqs: Vec<Mutex<RunQueue>>,
    clocks: Vec<AtomicU64>,
}

impl RunQueues {
    pub fn new(nr_cpus: usize, prio_cutoff: i32) -> Self {
        Self {
            rqs: (0..nr_cpus)
                .map(|cpu| Mutex::new(RunQueue::new(cpu, prio_cutoff)))
                .collect(),
            clocks: (0..nr_cpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    /// Lock @cpu's run queue. @cpu must be below `nr_cpus()`.
    pub fn lock(&self, cpu: usize) -> MutexGuard<'_, RunQueue> {
        self.rqs[cpu].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock two different run queues, lower CPU id first. The guards are
    /// returned in argument order.
    pub fn double_lock(
        &self,
        a: usize,
        b: usize,
    ) -> Result<(MutexGuard<'_, RunQueue>, MutexGuard<'_, RunQueue>)> {
        if a == b {
            bail!("Cannot double lock CPU {} with itself", a);
        }
        if a >= self.rqs.len() || b >= self.rqs.len() {
            bail!("Invalid CPU pair {}/{}", a, b);
        }
        if a < b {
            let ga = self.lock(a);
            let gb = self.lock(b);
            Ok((ga, gb))
        } else {
            let gb = self.lock(b);
            let ga = self.lock(a);
            Ok((ga, gb))
        }
    }

    /// Consistent copy of @cpu's counters.
    pub fn stats(&self, cpu: usize) -> RqStats {
        self.lock(cpu).stats().clone()
    }

    pub fn clock(&self, cpu: usize) -> u64 {
        self.clocks
            .get(cpu)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_clock(&self, cpu: usize, now: u64) {
        if let Some(c) = self.clocks.get(cpu) {
            c.store(now, Ordering::Release);
        }
    }

    pub fn set_prio_cutoff(&self, prio_cutoff: i32) {
        for cpu in 0..self.rqs.len() {
            self.lock(cpu).set_prio_cutoff(prio_cutoff);
        }
    }

    /// Move @pid from @src to @dst. Both locks must be held by the caller,
    /// which passes the guards in. Fails if the task is gone, running, not
    /// allowed on @dst or if @dst is not @dst_online.
    pub fn move_task(
        src: &mut RunQueue,
        dst: &mut RunQueue,
        pid: Pid,
        dst_online: bool,
    ) -> Result<()> {
        let Some(task) = src.task(pid) else {
            bail!("Task {} is no longer on CPU {}", pid, src.cpu());
        };
        if !task.cpus_allowed.test_cpu(dst.cpu()) {
            bail!("Task {} is not allowed on CPU {}", pid, dst.cpu());
        }
        if src.is_running(pid) {
            bail!("Task {} is running on CPU {}", pid, src.cpu());
        }
        if !dst_online {
            bail!("Destination CPU {} is offline", dst.cpu());
        }
        if let Some(task) = src.dequeue(pid) {
            dst.enqueue(task);
        }
        Ok(())
    }
}
