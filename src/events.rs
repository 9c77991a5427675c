// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Observability events.
//!
//! The engine reports what it decides through an `EventSink`. Sinks only
//! observe; nothing they do feeds back into a decision.
use std::sync::Mutex;
use std::sync::PoisonError;

use log::debug;
use log::trace;
use metrics::counter;
use metrics::gauge;

use crate::cluster::ClusterStats;
use crate::eligibility::MigrationStatus;
use crate::rq::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationKind {
    ForceUp,
    ForceDown,
    IdlePull,
    Offload,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::ForceUp => "force_up",
            MigrationKind::ForceDown => "force_down",
            MigrationKind::IdlePull => "idle_pull",
            MigrationKind::Offload => "offload",
        }
    }

    /// Whether the move goes towards a faster domain.
    pub fn is_up(&self) -> bool {
        matches!(self, MigrationKind::ForceUp | MigrationKind::IdlePull)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HmpEvent {
    Migrate {
        pid: Pid,
        dest_cpu: usize,
        kind: MigrationKind,
    },
    DynamicThreshold {
        pid: Pid,
        threshold: u32,
        status: MigrationStatus,
        src_cpu: usize,
        dst_cpu: usize,
        load: u32,
        big: ClusterStats,
        little: ClusterStats,
    },
    Load {
        big_load_avg: u32,
        little_load_avg: u32,
    },
    Stats {
        nr_force_up: u64,
        nr_force_down: u64,
    },
    OffloadAbort {
        cpu: usize,
        value: u64,
        reason: &'static str,
    },
    OffloadSucceed {
        cpu: usize,
        dest_cpu: usize,
    },
    MigrateForceRunning {
        pid: Pid,
        running: bool,
    },
    MigrateIdleRunning {
        pid: Pid,
        running: bool,
    },
    SelectTaskRq {
        pid: Pid,
        step: u32,
        prev_cpu: usize,
        new_cpu: usize,
        load: u32,
    },
    DispatchFailed {
        cpu: usize,
    },
    MigrationAbandoned {
        cpu: usize,
        pid: Pid,
        reason: &'static str,
    },
}

impl HmpEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HmpEvent::Migrate { .. } => "migrate",
            HmpEvent::DynamicThreshold { .. } => "dynamic_threshold",
            HmpEvent::Load { .. } => "load",
            HmpEvent::Stats { .. } => "stats",
            HmpEvent::OffloadAbort { .. } => "offload_abort",
            HmpEvent::OffloadSucceed { .. } => "offload_succeed",
            HmpEvent::MigrateForceRunning { .. } => "migrate_force_running",
            HmpEvent::MigrateIdleRunning { .. } => "migrate_idle_running",
            HmpEvent::SelectTaskRq { .. } => "select_task_rq",
            HmpEvent::DispatchFailed { .. } => "dispatch_failed",
            HmpEvent::MigrationAbandoned { .. } => "migration_abandoned",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &HmpEvent);
}

/// Logs every event and keeps the metrics counters up to date.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &HmpEvent) {
        counter!("hmp_events_total", "event" => event.name()).increment(1);

        match event {
            HmpEvent::Migrate {
                pid,
                dest_cpu,
                kind,
            } => {
                counter!("hmp_migrations_total", "kind" => kind.as_str()).increment(1);
                debug!("migrate pid={} dest={} kind={}", pid, dest_cpu, kind.as_str());
            }
            HmpEvent::DynamicThreshold {
                pid,
                threshold,
                status,
                src_cpu,
                dst_cpu,
                load,
                big,
                little,
            } => {
                if status.is_up() {
                    gauge!("hmp_threshold", "side" => "up").set(*threshold as f64);
                } else {
                    gauge!("hmp_threshold", "side" => "down").set(*threshold as f64);
                }
                trace!(
                    "threshold pid={} thr={} status={:#x} {}->{} load={} B(ncpu={} ntask={} acap={}) L(ncpu={} ntask={} acap={})",
                    pid,
                    threshold,
                    status.bits(),
                    src_cpu,
                    dst_cpu,
                    load,
                    big.ncpu,
                    big.ntask,
                    big.acap,
                    little.ncpu,
                    little.ntask,
                    little.acap
                );
            }
            HmpEvent::Load {
                big_load_avg,
                little_load_avg,
            } => {
                gauge!("hmp_load_avg", "cluster" => "big").set(*big_load_avg as f64);
                gauge!("hmp_load_avg", "cluster" => "little").set(*little_load_avg as f64);
                trace!("load big={} little={}", big_load_avg, little_load_avg);
            }
            HmpEvent::Stats {
                nr_force_up,
                nr_force_down,
            } => trace!("stats force_up={} force_down={}", nr_force_up, nr_force_down),
            HmpEvent::OffloadAbort { cpu, value, reason } => {
                counter!("hmp_offload_abort_total", "reason" => *reason).increment(1);
                trace!("offload abort cpu={} value={} reason={}", cpu, value, reason);
            }
            HmpEvent::OffloadSucceed { cpu, dest_cpu } => {
                debug!("offload cpu={} dest={}", cpu, dest_cpu)
            }
            HmpEvent::MigrateForceRunning { pid, running } => {
                debug!("force migration pid={} running={}", pid, running)
            }
            HmpEvent::MigrateIdleRunning { pid, running } => {
                debug!("idle pull pid={} running={}", pid, running)
            }
            HmpEvent::SelectTaskRq {
                pid,
                step,
                prev_cpu,
                new_cpu,
                load,
            } => trace!(
                "select_task_rq pid={} step={} prev={} new={} load={}",
                pid,
                step,
                prev_cpu,
                new_cpu,
                load
            ),
            HmpEvent::DispatchFailed { cpu } => {
                debug!("stopper dispatch on cpu {} failed", cpu)
            }
            HmpEvent::MigrationAbandoned { cpu, pid, reason } => {
                counter!("hmp_abandoned_total", "reason" => *reason).increment(1);
                debug!("migration of pid {} from cpu {} abandoned: {}", pid, cpu, reason);
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<HmpEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HmpEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&HmpEvent) -> bool,
    {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|ev| pred(ev))
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &HmpEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
