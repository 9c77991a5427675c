// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_hmp::rq::Pid;
use scx_hmp::stats::SystemStats;
use scx_hmp::ClusterSpec;
use scx_hmp::HmpBalancer;
use scx_hmp::LogSink;
use scx_hmp::Task;
use scx_hmp::Topology;
use scx_hmp::Tunables;

/// scx_hmp: big.LITTLE task placement and migration
///
/// CPUs are grouped into capacity domains, fastest first. A task whose load
/// rises above the up threshold of its domain boundary is moved to a faster
/// CPU, one whose load drops below the down threshold is pushed back down.
/// Both thresholds adapt to how busy each side is unless dynamic thresholds
/// are disabled.
///
/// Running tasks are moved by the source CPU's stopper at its next safe
/// point. A CPU of a faster domain going idle pulls the heaviest eligible
/// task of the slower domain.
///
/// This binary drives the engine with synthetic tasks following periodic
/// load profiles, and reports what it decides.
#[derive(Debug, Parser)]
struct Opts {
    /// Cluster layout, one --cluster per cluster, as
    /// <cpulist>[:<core>[:<mhz>]], e.g. --cluster 4-7:cortex-a57:1900
    /// --cluster 0-3:cortex-a53:1300. Clusters are ordered by capacity.
    #[clap(short = 'C', long, num_args = 1..)]
    cluster: Vec<String>,

    /// Number of synthetic tasks.
    #[clap(short = 'n', long, default_value = "12")]
    nr_tasks: usize,

    /// Simulated scheduler tick in microseconds.
    #[clap(short = 't', long, default_value = "1000")]
    tick_us: u64,

    /// Report interval in seconds.
    #[clap(short = 'i', long, default_value = "2.0")]
    interval: f64,

    /// Stop after this many seconds. 0 runs until interrupted.
    #[clap(short = 'd', long, default_value = "0")]
    duration: f64,

    /// Cap the fastest domain at this percentage of its maximum frequency.
    #[clap(long, default_value = "100")]
    freq_cap_pct: u32,

    /// Take this CPU offline and back online at every report.
    #[clap(long)]
    hotplug_cpu: Option<usize>,

    /// Load above which a task may move to a faster domain.
    #[clap(short = 'u', long, default_value = "700")]
    up_threshold: u32,

    /// Load below which a task may move to a slower domain.
    #[clap(short = 'D', long, default_value = "512")]
    down_threshold: u32,

    /// Minimum time between two up migrations of a task or onto a CPU, in
    /// run queue clock ticks.
    #[clap(long, default_value = "4096")]
    up_migration_cooldown: u64,

    /// Minimum time between two down migrations, in run queue clock ticks.
    #[clap(long, default_value = "4096")]
    down_migration_cooldown: u64,

    /// Use the static thresholds as they are.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_dynamic_threshold: bool,

    /// Disable first fit packing of small tasks onto the slowest domain.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_packing: bool,

    /// Load at which a CPU of the slowest domain counts as full for
    /// packing.
    #[clap(long, default_value = "650")]
    packing_full_threshold: u32,

    /// Do not treat low priority tasks differently.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_priority_filter: bool,

    /// Priority value from which tasks count as low priority.
    #[clap(long, default_value = "125")]
    priority_filter_cutoff: i32,

    /// Ignore frequency caps when computing available capacity.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_freq_invariance: bool,

    /// Use the classic threshold-only rules and the offload sweep.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    classic: bool,

    /// Disable the forced down sweep of global balance.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_global_balance: bool,

    /// Leave light tasks in place when their pack buddy is idle.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    lazy_balance: bool,

    /// Run ratio, out of 1024, above which a task is not offloaded.
    #[clap(long, default_value = "768")]
    starvation_cutoff: u32,

    /// How many queued tasks to look at when picking a task to move.
    #[clap(long, default_value = "5")]
    max_search_tasks: usize,

    /// Load average period in milliseconds.
    #[clap(long, default_value = "32")]
    load_avg_period_ms: u32,

    /// Idle states with an exit latency above this, in nanoseconds, are
    /// avoided while a migration is in flight.
    #[clap(long, default_value = "100000")]
    keepalive_max_delay_ns: u64,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    fn tunables(&self) -> Tunables {
        Tunables {
            up_threshold: self.up_threshold,
            down_threshold: self.down_threshold,
            up_migration_cooldown: self.up_migration_cooldown,
            down_migration_cooldown: self.down_migration_cooldown,
            dynamic_threshold_enabled: !self.no_dynamic_threshold,
            packing_enabled: !self.no_packing,
            packing_full_threshold: self.packing_full_threshold,
            priority_filter_enabled: !self.no_priority_filter,
            priority_filter_cutoff: self.priority_filter_cutoff,
            freq_invariant_enabled: !self.no_freq_invariance,
            enhanced_mode: !self.classic,
            global_balance_enabled: !self.no_global_balance,
            lazy_balance_enabled: self.lazy_balance,
            starvation_cutoff: self.starvation_cutoff,
            max_search_tasks: self.max_search_tasks,
            load_avg_period_ms: self.load_avg_period_ms,
            keepalive_max_delay_ns: self.keepalive_max_delay_ns,
        }
    }

    fn clusters(&self) -> Result<Vec<ClusterSpec>> {
        if self.cluster.is_empty() {
            return Ok(vec![
                "4-7:cortex-a57:1900".parse()?,
                "0-3:cortex-a53:1300".parse()?,
            ]);
        }
        self.cluster
            .iter()
            .map(|c| {
                c.parse::<ClusterSpec>()
                    .with_context(|| format!("Invalid --cluster {:?}", c))
            })
            .collect()
    }
}

/// Square wave load. The task wakes up at the start of each busy phase.
#[derive(Debug, Clone)]
struct LoadProfile {
    period: u64,
    busy: u64,
    phase: u64,
    peak: u32,
    base: u32,
}

impl LoadProfile {
    /// A spread of profiles from mostly idle to CPU bound.
    fn for_task(idx: usize) -> Self {
        const PEAKS: [u32; 5] = [950, 850, 600, 300, 150];
        let idx = idx as u64;
        let period = 200 + 50 * (idx % 7);
        Self {
            period,
            busy: period * (30 + 10 * (idx % 5)) / 100,
            phase: (idx * 37) % period,
            peak: PEAKS[idx as usize % PEAKS.len()],
            base: PEAKS[idx as usize % PEAKS.len()] / 8,
        }
    }

    /// Load at @tick and whether the task wakes up at it.
    fn at(&self, tick: u64) -> (u32, bool) {
        let pos = (tick + self.phase) % self.period;
        if pos < self.busy {
            (self.peak, pos == 0)
        } else {
            (self.base, false)
        }
    }
}

struct Metrics {
    moved: Counter,
    deferred: Counter,
    abandoned: Counter,
    dispatch_failed: Counter,
    sweeps: Counter,
    up_threshold: Gauge,
    down_threshold: Gauge,
    nr_online: Gauge,
    processing_duration: Histogram,
}

impl Metrics {
    fn new() -> Self {
        Self {
            moved: counter!("hmp_moves_total", "type" => "moved"),
            deferred: counter!("hmp_moves_total", "type" => "deferred"),
            abandoned: counter!("hmp_moves_total", "type" => "abandoned"),
            dispatch_failed: counter!("hmp_moves_total", "type" => "dispatch_failed"),
            sweeps: counter!("hmp_sweeps_total"),

            up_threshold: gauge!("hmp_static_threshold", "side" => "up"),
            down_threshold: gauge!("hmp_static_threshold", "side" => "down"),
            nr_online: gauge!("hmp_nr_online_cpus"),

            processing_duration: histogram!("processing_duration_us"),
        }
    }
}

struct Simulator {
    balancer: HmpBalancer,
    profiles: Vec<LoadProfile>,
    clusters: Vec<ClusterSpec>,
    tick: u64,
    tick_interval: Duration,
    report_interval: Duration,
    duration: Option<Duration>,
    hotplug_cpu: Option<usize>,
    metrics: Metrics,
}

impl Simulator {
    fn init(opts: &Opts) -> Result<Self> {
        if opts.tick_us == 0 {
            bail!("Tick interval must be non-zero");
        }
        if opts.freq_cap_pct == 0 || opts.freq_cap_pct > 100 {
            bail!("Frequency cap {}% is out of range", opts.freq_cap_pct);
        }

        let clusters = opts.clusters()?;
        let topo = Topology::from_clusters(&clusters)?;
        let balancer = HmpBalancer::new(&topo, opts.tunables(), Arc::new(LogSink))?;
        if let Some(cpu) = opts.hotplug_cpu {
            if cpu >= topo.nr_cpus() {
                bail!("Hotplug CPU {} does not exist", cpu);
            }
        }

        let mut sim = Self {
            balancer,
            profiles: (0..opts.nr_tasks).map(LoadProfile::for_task).collect(),
            clusters,
            tick: 0,
            tick_interval: Duration::from_micros(opts.tick_us),
            report_interval: Duration::from_secs_f64(opts.interval),
            duration: (opts.duration > 0.0).then(|| Duration::from_secs_f64(opts.duration)),
            hotplug_cpu: opts.hotplug_cpu,
            metrics: Metrics::new(),
        };
        sim.init_freq(opts.freq_cap_pct)?;
        sim.spawn_tasks()?;
        Ok(sim)
    }

    fn init_freq(&self, freq_cap_pct: u32) -> Result<()> {
        let fastest = self.balancer.dom_group().fastest().id();
        for cluster in self.clusters.iter() {
            let (Some(mhz), Some(cpu)) = (cluster.clock_mhz, cluster.cpus.first()) else {
                continue;
            };
            let const_max = (mhz * 1000) as u32;
            let max = match self.balancer.dom_group().cpu_dom_id(*cpu) {
                Some(id) if id == fastest => const_max / 100 * freq_cap_pct,
                _ => const_max,
            };
            self.balancer
                .cpufreq_policy(*cpu, const_max / 4, max, const_max, false)?;
            self.balancer.cpufreq_transition(*cpu, max)?;
            info!(
                "cpu{} cluster: {}kHz of {}kHz",
                cpu, max, const_max
            );
        }
        Ok(())
    }

    fn spawn_tasks(&self) -> Result<()> {
        let nr_cpus = self.balancer.dom_group().nr_cpus();
        for (idx, profile) in self.profiles.iter().enumerate() {
            let pid = idx as Pid + 1;
            let task = Task::new(pid, &format!("sim-{}", pid), nr_cpus).with_load(profile.base);
            let cpu = self.balancer.wake_up(task, idx % nr_cpus, true)?;
            debug!("pid {} placed on cpu{}", pid, cpu);
        }
        Ok(())
    }

    /// Apply the load profiles for the current tick, rotate the run queues
    /// and wake up the tasks starting a busy phase.
    fn update_loads(&mut self) -> Result<()> {
        let mut wakeups = vec![];
        for cpu in 0..self.balancer.rqs().nr_cpus() {
            let mut rq = self.balancer.rqs().lock(cpu);
            let pids: Vec<Pid> = rq.tasks().map(|t| t.pid).collect();
            for pid in pids {
                let profile = (pid as usize)
                    .checked_sub(1)
                    .and_then(|idx| self.profiles.get(idx));
                let Some(profile) = profile else {
                    continue;
                };
                let (load, waking) = profile.at(self.tick);
                if let Some(task) = rq.task_mut(pid) {
                    task.set_load(load);
                }
                if waking && !rq.is_running(pid) {
                    wakeups.push((cpu, pid));
                }
            }
            rq.update_load();
            rq.schedule();
        }

        for (cpu, pid) in wakeups {
            self.requeue(cpu, pid)?;
        }
        Ok(())
    }

    fn requeue(&self, cpu: usize, pid: Pid) -> Result<()> {
        let Some(task) = self.balancer.dequeue(cpu, pid) else {
            return Ok(());
        };
        let prev_cpu = if self.balancer.dom_group().cpu_online(cpu) {
            cpu
        } else {
            self.balancer.dom_group().first_online().unwrap_or(0)
        };
        self.balancer.wake_up(task, prev_cpu, false)?;
        Ok(())
    }

    fn toggle_hotplug(&self, cpu: usize) -> Result<()> {
        if self.balancer.dom_group().cpu_online(cpu) {
            self.balancer.cpu_offline(cpu)?;
            let pids: Vec<Pid> = self.balancer.rqs().lock(cpu).tasks().map(|t| t.pid).collect();
            let target = self.balancer.dom_group().first_online().unwrap_or(0);
            for pid in pids {
                if let Some(task) = self.balancer.dequeue(cpu, pid) {
                    self.balancer.wake_up(task, target, false)?;
                }
            }
        } else {
            self.balancer.cpu_online(cpu)?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let started_at = Instant::now();
        self.tick += 1;
        self.update_loads()?;
        self.balancer
            .advance_clocks(self.tick_interval.as_nanos() as u64);

        let nr_cpus = self.balancer.dom_group().nr_cpus();
        for cpu in 0..nr_cpus {
            self.balancer.run_stopper(cpu);
        }

        if let Some(cpu) = self.balancer.dom_group().first_online() {
            self.balancer.on_rebalance_tick(cpu);
        }
        for cpu in self.balancer.dom_group().online_mask().iter() {
            if self.balancer.rqs().stats(cpu).nr_running == 0 {
                self.balancer.on_cpu_idle(cpu);
            }
        }

        self.metrics
            .processing_duration
            .record(started_at.elapsed().as_micros() as f64);
        Ok(())
    }

    fn report(&self, stats: &SystemStats) -> Result<()> {
        let counters = &stats.counters;
        self.metrics.moved.increment(counters.nr_moved);
        self.metrics.deferred.increment(counters.nr_deferred);
        self.metrics.abandoned.increment(counters.nr_abandoned);
        self.metrics
            .dispatch_failed
            .increment(counters.nr_dispatch_failed);
        self.metrics.sweeps.increment(counters.nr_sweeps);
        self.metrics.up_threshold.set(stats.up_threshold as f64);
        self.metrics.down_threshold.set(stats.down_threshold as f64);
        self.metrics
            .nr_online
            .set(self.balancer.dom_group().nr_online() as f64);

        for dom in stats.doms.iter() {
            histogram!("load_avg", "dom" => dom.id.to_string()).record(*dom.load_avg);
        }

        let mut buf = vec![];
        stats.format(&mut buf)?;
        info!("tick {}", self.tick);
        for line in String::from_utf8_lossy(&buf).lines() {
            info!("{}", line);
        }
        Ok(())
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let started_at = Instant::now();
        let mut next_tick_at = started_at + self.tick_interval;
        let mut next_report_at = started_at + self.report_interval;

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if self
                .duration
                .is_some_and(|d| now.duration_since(started_at) >= d)
            {
                break;
            }

            if now >= next_tick_at {
                self.step()?;
                next_tick_at += self.tick_interval;
                if next_tick_at < now {
                    next_tick_at = now + self.tick_interval;
                }
            }

            if now >= next_report_at {
                self.report(&self.balancer.system_stats())?;
                if let Some(cpu) = self.hotplug_cpu {
                    self.toggle_hotplug(cpu)?;
                }
                next_report_at += self.report_interval;
                if next_report_at < now {
                    next_report_at = now + self.report_interval;
                }
            }

            std::thread::sleep(
                next_report_at
                    .min(next_tick_at)
                    .saturating_duration_since(Instant::now()),
            );
        }

        self.report(&self.balancer.system_stats())?;
        info!("Stopped after {} ticks", self.tick);
        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let mut sim = Simulator::init(&opts)?;
    sim.run(shutdown)
}
