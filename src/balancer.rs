// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # HMP balancer
//!
//! The entry points of the engine. `HmpBalancer` owns the domain group, the
//! run queues and the per-CPU stoppers, and is driven from outside:
//!
//! - `on_rebalance_tick()` on the periodic tick: forced up migration of
//!   running tasks from slow to fast CPUs, then the global balance down
//!   sweep. In classic mode, the heaviest task of each CPU is checked for
//!   an up move and the lightest one for offloading.
//! - `on_cpu_idle()` when a CPU is about to go idle: pull the heaviest
//!   eligible task of the slower domain.
//! - `run_stopper()` at each CPU's safe points.
//! - `select_task_rq()` on wakeup.
//!
//! A single sweep lock serializes the tick sweep and idle pulls. Idle pull
//! only tries it; a pull missed because a sweep is running is picked up by
//! the next idle event or tick.
//!
//! Run queue clocks tick every 1024ns.
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::TryLockError;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use ordered_float::OrderedFloat;

use crate::cluster::ClusterEnv;
use crate::cpumask::Cpumask;
use crate::domain::DomainGroup;
use crate::eligibility::Caller;
use crate::eligibility::HmpPolicy;
use crate::events::EventSink;
use crate::events::HmpEvent;
use crate::events::MigrationKind;
use crate::executor::MigrationExecutor;
use crate::executor::MigrationOutcome;
use crate::executor::MigrationRequest;
use crate::rq::Pid;
use crate::rq::RunQueues;
use crate::rq::Task;
use crate::stats::DomainLoadStats;
use crate::stats::HmpStats;
use crate::stats::HmpStatsSnapshot;
use crate::stats::SystemStats;
use crate::stopper::CpuStoppers;
use crate::topology::Topology;
use crate::tunables::Tunables;

pub const CLOCK_SHIFT: u32 = 10;

/// One entry of a CPU's idle state table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleState {
    pub name: String,
    pub exit_latency_us: u64,
    pub target_residency_us: u64,
}

impl IdleState {
    pub fn new(name: &str, exit_latency_us: u64, target_residency_us: u64) -> Self {
        Self {
            name: name.to_string(),
            exit_latency_us,
            target_residency_us,
        }
    }
}

/// Idle states of a typical big.LITTLE part: WFI, core power down and
/// cluster power down.
pub fn default_idle_states() -> Vec<IdleState> {
    vec![
        IdleState::new("wfi", 1, 1),
        IdleState::new("core-off", 300, 1000),
        IdleState::new("cluster-off", 1500, 5000),
    ]
}

/// How long a CPU waiting for a migration must be kept out of idle states
/// whose exit latency is above @max_delay_ns. That is just under the
/// shortest target residency among those states, so the CPU never enters
/// them. Zero if no state is too slow.
pub fn keepalive_delay_ns(states: &[IdleState], max_delay_ns: u64) -> u64 {
    let max_delay_us = max_delay_ns / 1000;
    states
        .iter()
        .filter(|state| state.exit_latency_us > max_delay_us)
        .map(|state| state.target_residency_us)
        .min()
        .map(|us| us.saturating_sub(1) * 1000)
        .unwrap_or(0)
}

/// Per-CPU keepalive timers. An armed timer keeps its CPU out of deep
/// idle states until it expires.
#[derive(Debug)]
pub struct Keepalive {
    delay_ns: Vec<AtomicU64>,
    expires_ns: Vec<AtomicU64>,
}

impl Keepalive {
    pub fn new(nr_cpus: usize, states: &[IdleState], max_delay_ns: u64) -> Self {
        let delay = keepalive_delay_ns(states, max_delay_ns);
        Self {
            delay_ns: (0..nr_cpus).map(|_| AtomicU64::new(delay)).collect(),
            expires_ns: (0..nr_cpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn set_delay(&self, states: &[IdleState], max_delay_ns: u64) {
        let delay = keepalive_delay_ns(states, max_delay_ns);
        for d in self.delay_ns.iter() {
            d.store(delay, Ordering::Relaxed);
        }
    }

    pub fn delay_ns(&self, cpu: usize) -> u64 {
        self.delay_ns
            .get(cpu)
            .map(|d| d.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Arm @cpu's timer. Returns false if no timer is needed.
    pub fn trigger(&self, cpu: usize, now_ns: u64) -> bool {
        let delay = self.delay_ns(cpu);
        match self.expires_ns.get(cpu) {
            Some(expires) if delay != 0 => {
                expires.store(now_ns + delay, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, cpu: usize) {
        if let Some(expires) = self.expires_ns.get(cpu) {
            expires.store(0, Ordering::Release);
        }
    }

    pub fn is_armed(&self, cpu: usize, now_ns: u64) -> bool {
        self.expires_ns
            .get(cpu)
            .map(|e| e.load(Ordering::Acquire) > now_ns)
            .unwrap_or(false)
    }
}

pub struct HmpBalancer {
    dom_group: DomainGroup,
    rqs: RunQueues,
    tunables: RwLock<Tunables>,
    stats: HmpStats,
    events: Arc<dyn EventSink>,
    stoppers: CpuStoppers<MigrationRequest>,
    idle_states: Vec<IdleState>,
    keepalive: Keepalive,
    sweep_lock: Mutex<()>,
    prev_counters: Mutex<HmpStatsSnapshot>,
}

impl HmpBalancer {
    pub fn new(topo: &Topology, tunables: Tunables, events: Arc<dyn EventSink>) -> Result<Self> {
        tunables.validate().context("Invalid tunables")?;

        let nr_cpus = topo.nr_cpus();
        let dom_group = DomainGroup::new(topo, &Cpumask::full(nr_cpus))?;
        let idle_states = default_idle_states();
        let keepalive = Keepalive::new(nr_cpus, &idle_states, tunables.keepalive_max_delay_ns);

        info!(
            "HMP engine on {} CPUs in {} domains ({} mode, keepalive {}ns)",
            nr_cpus,
            dom_group.nr_doms(),
            if tunables.enhanced_mode {
                "enhanced"
            } else {
                "classic"
            },
            keepalive.delay_ns(0)
        );

        Ok(Self {
            rqs: RunQueues::new(nr_cpus, tunables.priority_filter_cutoff),
            stoppers: CpuStoppers::new(nr_cpus),
            dom_group,
            tunables: RwLock::new(tunables),
            stats: HmpStats::new(),
            events,
            idle_states,
            keepalive,
            sweep_lock: Mutex::new(()),
            prev_counters: Mutex::new(HmpStatsSnapshot::default()),
        })
    }

    /// Replace the idle state table the keepalive delay is derived from.
    pub fn with_idle_states(mut self, idle_states: Vec<IdleState>) -> Self {
        self.keepalive
            .set_delay(&idle_states, self.tunables().keepalive_max_delay_ns);
        self.idle_states = idle_states;
        self
    }

    pub fn dom_group(&self) -> &DomainGroup {
        &self.dom_group
    }

    pub fn rqs(&self) -> &RunQueues {
        &self.rqs
    }

    pub fn stats(&self) -> &HmpStats {
        &self.stats
    }

    pub fn keepalive(&self) -> &Keepalive {
        &self.keepalive
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate @tunables and make them the active set.
    pub fn set_tunables(&self, tunables: Tunables) -> Result<()> {
        if let Err(e) = tunables.validate() {
            warn!("Rejecting tunables: {:#}", e);
            return Err(e);
        }

        let mut cur = self.tunables.write().unwrap_or_else(PoisonError::into_inner);
        if cur.priority_filter_cutoff != tunables.priority_filter_cutoff {
            self.rqs.set_prio_cutoff(tunables.priority_filter_cutoff);
        }
        if cur.keepalive_max_delay_ns != tunables.keepalive_max_delay_ns {
            self.keepalive
                .set_delay(&self.idle_states, tunables.keepalive_max_delay_ns);
        }
        *cur = tunables;
        info!("Tunables updated: {:?}", *cur);
        Ok(())
    }

    fn policy<'a>(&'a self, tunables: &'a Tunables) -> HmpPolicy<'a> {
        HmpPolicy::new(
            &self.dom_group,
            &self.rqs,
            tunables,
            &self.stats,
            self.events.as_ref(),
        )
    }

    fn try_sweep_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.sweep_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn now_ns(&self, policy: &HmpPolicy) -> u64 {
        policy.now() << CLOCK_SHIFT
    }

    /// Advance every CPU clock by @delta_ns, scaled by the load average
    /// period.
    pub fn advance_clocks(&self, delta_ns: u64) {
        let ticks = self
            .tunables()
            .variable_scale_convert(delta_ns >> CLOCK_SHIFT);
        for cpu in 0..self.rqs.nr_cpus() {
            self.rqs.set_clock(cpu, self.rqs.clock(cpu) + ticks);
        }
    }

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.dom_group.nr_cpus() {
            bail!(
                "Invalid CPU {}, only {} CPUs",
                cpu,
                self.dom_group.nr_cpus()
            );
        }
        Ok(())
    }

    pub fn enqueue(&self, cpu: usize, task: Task) -> Result<()> {
        self.check_cpu(cpu)?;
        self.rqs.lock(cpu).enqueue(task);
        Ok(())
    }

    pub fn dequeue(&self, cpu: usize, pid: Pid) -> Option<Task> {
        if cpu >= self.rqs.nr_cpus() {
            return None;
        }
        self.rqs.lock(cpu).dequeue(pid)
    }

    /// Where a waking @task last seen on @prev_cpu should run.
    pub fn select_task_rq(&self, task: &Task, prev_cpu: usize, created: bool) -> usize {
        let tunables = self.tunables();
        self.policy(&tunables)
            .select_task_rq(task, prev_cpu, prev_cpu, created)
    }

    /// Pick a CPU for @task and enqueue it there.
    pub fn wake_up(&self, task: Task, prev_cpu: usize, created: bool) -> Result<usize> {
        let cpu = self.select_task_rq(&task, prev_cpu, created);
        self.enqueue(cpu, task)?;
        Ok(cpu)
    }

    fn curr_task(&self, cpu: usize) -> Option<Task> {
        let rq = self.rqs.lock(cpu);
        if rq.active_balance {
            return None;
        }
        rq.curr().cloned()
    }

    /// The periodic rebalance, run on @this_cpu.
    pub fn on_rebalance_tick(&self, this_cpu: usize) {
        if self.dom_group.arch_is_smp() {
            return;
        }
        let Some(guard) = self.try_sweep_lock() else {
            debug!("cpu{}: sweep already running", this_cpu);
            return;
        };

        let tunables = self.tunables();
        let policy = self.policy(&tunables);
        let exec = MigrationExecutor::new(&policy, &self.stoppers);

        let mut pull = None;
        if tunables.enhanced_mode {
            let mut last_env = self.force_up_sweep(&policy, &exec);
            if tunables.global_balance_enabled {
                last_env = self.force_down_sweep(&policy, &exec).or(last_env);
            }
            if let Some(env) = last_env {
                self.events.emit(&HmpEvent::Load {
                    big_load_avg: env.bstats.load_avg,
                    little_load_avg: env.lstats.load_avg,
                });
            }
        } else {
            pull = self.classic_sweep(&policy, &exec);
        }
        self.stats.sweep();
        drop(guard);

        if let Some(target) = pull {
            debug!("cpu{}: kicking cpu{} for an idle pull", this_cpu, target);
            self.on_cpu_idle(target);
        }
    }

    fn force_up_sweep(&self, policy: &HmpPolicy, exec: &MigrationExecutor) -> Option<ClusterEnv> {
        let mut last_env = None;
        for cpu in self.dom_group.online_mask().iter() {
            if self.dom_group.is_fastest(cpu) {
                continue;
            }
            let Some(task) = self.curr_task(cpu) else {
                continue;
            };
            let (Ok(faster), Some(own)) = (
                self.dom_group.faster_domain(cpu),
                self.dom_group.domain_of(cpu),
            ) else {
                continue;
            };
            let Some(target) = policy.select_cpu(Caller::GlobalBalance, &task, faster.cpus(), None)
            else {
                continue;
            };

            let env = ClusterEnv::collect(
                &self.dom_group,
                &self.rqs,
                policy.tunables,
                faster.cpus(),
                own.cpus(),
                Some(target),
                Some(cpu),
            );

            let lazy = policy.tunables.lazy_balance_enabled
                && HmpPolicy::is_light_task(&task)
                && policy
                    .pack_buddy(cpu)
                    .is_some_and(|buddy| !policy.is_buddy_busy(buddy));

            if !lazy
                && policy
                    .up_migration(Caller::GlobalBalance, cpu, target, &task, &env)
                    .result
            {
                exec.execute(&MigrationRequest {
                    src_cpu: cpu,
                    dst_cpu: target,
                    pid: task.pid,
                    kind: MigrationKind::ForceUp,
                });
            }
            last_env = Some(env);
        }
        last_env
    }

    fn force_down_sweep(
        &self,
        policy: &HmpPolicy,
        exec: &MigrationExecutor,
    ) -> Option<ClusterEnv> {
        let mut last_env = None;
        for cpu in self.dom_group.online_mask().iter() {
            if self.dom_group.is_slowest(cpu) {
                continue;
            }
            let Some(task) = self.curr_task(cpu) else {
                continue;
            };
            let (Ok(slower), Some(own)) = (
                self.dom_group.slower_domain(cpu),
                self.dom_group.domain_of(cpu),
            ) else {
                continue;
            };
            let Some(target) = policy.select_cpu(Caller::GlobalBalance, &task, slower.cpus(), None)
            else {
                continue;
            };

            let env = ClusterEnv::collect(
                &self.dom_group,
                &self.rqs,
                policy.tunables,
                own.cpus(),
                slower.cpus(),
                Some(cpu),
                Some(target),
            );

            if policy
                .down_migration(Caller::GlobalBalance, cpu, target, &task, &env)
                .result
            {
                exec.execute(&MigrationRequest {
                    src_cpu: cpu,
                    dst_cpu: target,
                    pid: task.pid,
                    kind: MigrationKind::ForceDown,
                });
            }
            last_env = Some(env);
        }
        last_env
    }

    /// Threshold-only sweep. Returns the CPU to kick for an idle pull if a
    /// task wants to move up.
    fn classic_sweep(&self, policy: &HmpPolicy, exec: &MigrationExecutor) -> Option<usize> {
        for cpu in self.dom_group.online_mask().iter() {
            let (heaviest, lightest) = {
                let rq = self.rqs.lock(cpu);
                if rq.active_balance || rq.curr().is_none() {
                    continue;
                }
                (policy.heaviest_task(&rq, None), policy.lightest_task(&rq, true))
            };

            if let Some(target) = heaviest.and_then(|t| policy.classic_up_migration(cpu, &t)) {
                return Some(target);
            }

            let Some(task) = lightest else {
                continue;
            };
            if let Some(dst_cpu) = policy.offload_down(cpu, &task) {
                exec.execute(&MigrationRequest {
                    src_cpu: cpu,
                    dst_cpu,
                    pid: task.pid,
                    kind: MigrationKind::Offload,
                });
            }
        }
        None
    }

    /// @this_cpu is going idle. Pull the heaviest task of the slower domain
    /// which is heavy enough to go up. Returns whether a task was pulled.
    pub fn on_cpu_idle(&self, this_cpu: usize) -> bool {
        if !self.dom_group.cpu_online(this_cpu) {
            return false;
        }
        let Ok(slower) = self.dom_group.slower_domain(this_cpu) else {
            return false;
        };
        let Some(_guard) = self.try_sweep_lock() else {
            return false;
        };

        let tunables = self.tunables();
        let policy = self.policy(&tunables);

        let mut candidate: Option<(usize, Task)> = None;
        for cpu in slower.cpus().and(&self.dom_group.online_mask()).iter() {
            let task = {
                let rq = self.rqs.lock(cpu);
                if rq.curr().is_none() {
                    continue;
                }
                policy.heaviest_task(&rq, Some(this_cpu))
            };
            let Some(task) = task else {
                continue;
            };
            let ratio = candidate
                .as_ref()
                .map(|(_, t)| t.load_avg_ratio)
                .unwrap_or(0);
            if task.load_avg_ratio >= tunables.up_threshold
                && task.load_avg_ratio > ratio
                && task.cpus_allowed.test_cpu(this_cpu)
            {
                candidate = Some((cpu, task));
            }
        }

        let Some((src_cpu, task)) = candidate else {
            return false;
        };

        let exec = MigrationExecutor::new(&policy, &self.stoppers);
        let outcome = exec.execute(&MigrationRequest {
            src_cpu,
            dst_cpu: this_cpu,
            pid: task.pid,
            kind: MigrationKind::IdlePull,
        });
        if let MigrationOutcome::Deferred(_) = &outcome {
            self.keepalive.trigger(this_cpu, self.now_ns(&policy));
        }
        outcome.is_success()
    }

    /// Run the work pending on @cpu's stopper.
    pub fn run_stopper(&self, cpu: usize) -> Option<bool> {
        let tunables = self.tunables();
        let policy = self.policy(&tunables);
        MigrationExecutor::new(&policy, &self.stoppers).run_stopper(cpu)
    }

    pub fn keepalive_armed(&self, cpu: usize) -> bool {
        let tunables = self.tunables();
        let now = self.now_ns(&self.policy(&tunables));
        self.keepalive.is_armed(cpu, now)
    }

    pub fn cpu_online(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        if self.dom_group.set_cpu_online(cpu, true)? {
            info!("cpu{} online", cpu);
        }
        Ok(())
    }

    /// Take @cpu offline. Work already handed to its stopper is dropped
    /// when the stopper runs.
    pub fn cpu_offline(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        if self.dom_group.cpu_online(cpu) && self.dom_group.nr_online() == 1 {
            bail!("Refusing to offline cpu{}, the last online CPU", cpu);
        }
        self.keepalive.cancel(cpu);
        if self.dom_group.set_cpu_online(cpu, false)? {
            info!("cpu{} offline", cpu);
        }
        Ok(())
    }

    /// Frequency of @cpu's domain changed to @freq_khz.
    pub fn cpufreq_transition(&self, cpu: usize, freq_khz: u32) -> Result<()> {
        let Some(dom) = self.dom_group.domain_of(cpu) else {
            bail!("Invalid CPU {} for frequency transition", cpu);
        };
        let invariant = self.tunables().freq_invariant_enabled;
        self.dom_group.freq().transition(dom.cpus(), freq_khz, invariant);
        Ok(())
    }

    /// Frequency policy of @cpu's domain changed.
    pub fn cpufreq_policy(
        &self,
        cpu: usize,
        min_khz: u32,
        max_khz: u32,
        const_max_khz: u32,
        single_freq: bool,
    ) -> Result<()> {
        let Some(dom) = self.dom_group.domain_of(cpu) else {
            bail!("Invalid CPU {} for frequency policy", cpu);
        };
        self.dom_group
            .freq()
            .policy_update(dom.cpus(), min_khz, max_khz, const_max_khz, single_freq);
        Ok(())
    }

    /// Counters since the previous call and the current load per domain.
    pub fn system_stats(&self) -> SystemStats {
        let counters = self.stats.snapshot();
        let delta = {
            let mut prev = self
                .prev_counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let delta = counters.delta(&prev);
            *prev = counters;
            delta
        };

        let tunables = self.tunables();
        let mut sys = SystemStats {
            counters: delta,
            up_threshold: tunables.up_threshold,
            down_threshold: tunables.down_threshold,
            ..Default::default()
        };
        for dom in self.dom_group.doms() {
            let online = self.dom_group.online_cpus(dom.id());
            let mut nr_running = 0;
            let mut load = 0u64;
            for cpu in online.iter() {
                let stats = self.rqs.stats(cpu);
                nr_running += stats.nr_running;
                load += stats.load_avg_ratio as u64;
            }
            let nr_online = online.weight();
            let load_avg = if nr_online > 0 {
                load as f64 / nr_online as f64
            } else {
                0.0
            };
            sys.doms.insert(DomainLoadStats {
                id: dom.id(),
                nr_online,
                nr_running,
                load_avg: OrderedFloat(load_avg),
                capacity: dom.capacity(),
            });
        }
        sys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::topology::ClusterSpec;

    fn balancer(tunables: Tunables) -> (HmpBalancer, Arc<RecordingSink>) {
        let specs: Vec<ClusterSpec> = ["0-1:a53:1300", "2-3:a57:1900"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let topo = Topology::from_clusters(&specs).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let bal = HmpBalancer::new(&topo, tunables, sink.clone()).unwrap();
        (bal, sink)
    }

    fn task(pid: Pid, load: u32) -> Task {
        Task::new(pid, "t", 4).with_load(load)
    }

    #[test]
    fn test_keepalive_delay_from_idle_states() {
        let states = default_idle_states();
        assert_eq!(keepalive_delay_ns(&states, 100_000), 999_000);
        assert_eq!(keepalive_delay_ns(&states, 1_000_000), 4_999_000);
        assert_eq!(keepalive_delay_ns(&states, 2_000_000), 0);
        assert_eq!(keepalive_delay_ns(&[], 100_000), 0);
    }

    #[test]
    fn test_force_up_of_running_task() {
        let (bal, sink) = balancer(Tunables::default());
        bal.enqueue(0, task(1, 900)).unwrap();

        bal.on_rebalance_tick(0);
        assert!(bal.rqs().lock(0).active_balance);
        assert_eq!(bal.stats().snapshot().nr_force_up, 1);

        assert_eq!(bal.run_stopper(0), Some(true));
        assert!(bal.rqs().lock(2).is_running(1));
        assert_eq!(
            sink.count(|ev| matches!(
                ev,
                HmpEvent::Migrate {
                    kind: MigrationKind::ForceUp,
                    dest_cpu: 2,
                    ..
                }
            )),
            1
        );
        assert!(sink.count(|ev| matches!(ev, HmpEvent::Load { .. })) >= 1);
    }

    #[test]
    fn test_idle_pull_arms_keepalive() {
        let (bal, sink) = balancer(Tunables::default());
        bal.enqueue(1, task(1, 800)).unwrap();
        bal.enqueue(0, task(2, 300)).unwrap();

        assert!(!bal.on_cpu_idle(0));
        assert!(bal.on_cpu_idle(3));
        assert!(bal.keepalive_armed(3));
        assert_eq!(
            sink.count(|ev| matches!(ev, HmpEvent::MigrateIdleRunning { pid: 1, running: true })),
            1
        );
        assert_eq!(bal.run_stopper(1), Some(true));
        assert!(bal.rqs().lock(3).is_running(1));

        bal.cpu_offline(3).unwrap();
        assert!(!bal.keepalive_armed(3));
    }

    #[test]
    fn test_idle_pull_skipped_while_sweeping() {
        let (bal, _sink) = balancer(Tunables::default());
        bal.enqueue(1, task(1, 800)).unwrap();
        let guard = bal.sweep_lock.lock().unwrap();
        assert!(!bal.on_cpu_idle(3));
        drop(guard);
        assert!(bal.on_cpu_idle(3));
    }

    #[test]
    fn test_light_task_not_pulled() {
        let (bal, _sink) = balancer(Tunables::default());
        bal.enqueue(0, task(1, 400)).unwrap();
        assert!(!bal.on_cpu_idle(2));
        assert_eq!(bal.stats().snapshot().nr_idle_pull, 0);
    }

    #[test]
    fn test_classic_offload() {
        let (bal, sink) = balancer(Tunables {
            enhanced_mode: false,
            ..Default::default()
        });
        bal.enqueue(2, task(1, 300)).unwrap();
        bal.enqueue(2, task(2, 200)).unwrap();
        bal.enqueue(3, task(3, 300)).unwrap();
        bal.enqueue(0, task(4, 100)).unwrap();

        bal.on_rebalance_tick(0);
        assert!(bal.rqs().lock(1).is_running(2));
        assert_eq!(bal.rqs().lock(2).nr_running(), 1);
        let snap = bal.stats().snapshot();
        assert_eq!((snap.nr_offload, snap.nr_moved), (1, 1));
        assert_eq!(
            sink.count(|ev| matches!(ev, HmpEvent::OffloadSucceed { cpu: 2, dest_cpu: 1 })),
            1
        );
    }

    #[test]
    fn test_set_tunables() {
        let (bal, _sink) = balancer(Tunables::default());
        let bad = Tunables {
            up_threshold: 100,
            down_threshold: 200,
            ..Default::default()
        };
        assert!(bal.set_tunables(bad).is_err());
        assert_eq!(bal.tunables(), Tunables::default());

        bal.enqueue(0, task(1, 100).with_prio(122)).unwrap();
        assert_eq!(bal.rqs().stats(0).nr_normal_prio, 1);
        let lower = Tunables {
            priority_filter_cutoff: 121,
            keepalive_max_delay_ns: 2_000_000,
            ..Default::default()
        };
        bal.set_tunables(lower).unwrap();
        assert_eq!(bal.rqs().stats(0).nr_normal_prio, 0);
        assert_eq!(bal.keepalive().delay_ns(0), 0);
    }

    #[test]
    fn test_hotplug() {
        let (bal, _sink) = balancer(Tunables::default());
        bal.cpu_offline(2).unwrap();
        assert_eq!(bal.dom_group().online_cpus(0).weight(), 1);
        assert!(bal.cpu_offline(9).is_err());
        bal.cpu_online(2).unwrap();
        assert_eq!(bal.dom_group().nr_online(), 4);

        for cpu in 1..4 {
            bal.cpu_offline(cpu).unwrap();
        }
        assert!(bal.cpu_offline(0).is_err());
    }

    #[test]
    fn test_system_stats() {
        let (bal, _sink) = balancer(Tunables::default());
        bal.enqueue(2, task(1, 600)).unwrap();
        bal.enqueue(3, task(2, 200)).unwrap();
        bal.stats().moved();

        let sys = bal.system_stats();
        assert_eq!(sys.counters.nr_moved, 1);
        let busiest = sys.busiest().unwrap();
        assert_eq!((busiest.id, busiest.nr_running), (0, 2));
        assert_eq!(*busiest.load_avg, 400.0);
        assert_eq!(bal.system_stats().counters.nr_moved, 0);
    }

    #[test]
    fn test_cpufreq_changes_capacity() {
        let (bal, _sink) = balancer(Tunables::default());
        bal.cpufreq_policy(2, 500_000, 2_000_000, 2_000_000, false)
            .unwrap();
        bal.cpufreq_transition(3, 1_000_000).unwrap();
        assert_eq!(bal.dom_group().capacity_of(2), 512);
        assert!(bal.cpufreq_transition(8, 1).is_err());
    }
}
