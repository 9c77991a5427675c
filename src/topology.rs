// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # HMP topology description
//!
//! The static input of the engine: which CPUs exist and how they group into
//! capacity classes. Two ways of building one are supported:
//!
//! 1. From per-CPU core descriptions (core type and clock). The nominal
//!    capacity of each CPU is derived from a relative efficiency table and
//!    CPUs with equal capacity are grouped together, fastest class first. If
//!    every CPU ends up with the same capacity, all of them form a single
//!    domain.
//!
//! 2. From explicit clusters, e.g. `--cluster 4-7:cortex-a57:1900
//!    --cluster 0-3:cortex-a53:1300`. The grouping is taken as given and the
//!    clusters are ordered by capacity.
//!
//! Capacities are normalized so that the fastest CPU has a capacity of
//! 1024.
use std::cmp::Reverse;
use std::str::FromStr;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use sorted_vec::SortedVec;

use crate::cpumask::Cpumask;

pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u32 = 1 << SCHED_CAPACITY_SHIFT;

/// Efficiency used for core types missing from the table.
const DEFAULT_EFFICIENCY: u64 = SCHED_CAPACITY_SCALE as u64;
const DEFAULT_CLOCK_MHZ: u64 = 1000;

/// Relative efficiency of each known core type. The raw capacity of a CPU
/// is its clock in MHz-ish units (Hz >> 20) multiplied by this value.
const TABLE_EFFICIENCY: &[(&str, u64)] = &[("cortex-a57", 3891), ("cortex-a53", 2048)];

pub fn core_efficiency(core: &str) -> u64 {
    let core = core.strip_prefix("arm,").unwrap_or(core);
    let core = if core.starts_with("cortex-") {
        core.to_string()
    } else {
        format!("cortex-{}", core)
    };
    TABLE_EFFICIENCY
        .iter()
        .find(|(name, _)| *name == core)
        .map(|(_, eff)| *eff)
        .unwrap_or(DEFAULT_EFFICIENCY)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuDesc {
    pub id: usize,
    pub efficiency: u64,
    pub clock_hz: u64,
}

impl CpuDesc {
    pub fn new(id: usize, core: &str, clock_mhz: u64) -> Self {
        Self {
            id,
            efficiency: core_efficiency(core),
            clock_hz: clock_mhz * 1_000_000,
        }
    }

    fn raw_capacity(&self) -> u64 {
        (self.clock_hz >> 20) * self.efficiency
    }
}

/// One `--cluster` argument: `<cpulist>[:<core>[:<mhz>]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub cpus: Vec<usize>,
    pub core: Option<String>,
    pub clock_mhz: Option<u64>,
}

impl FromStr for ClusterSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let cpulist = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("Empty cluster description"))?;
        let cpus = crate::cpumask::read_cpulist(cpulist)?;
        let core = parts.next().map(|c| c.to_string());
        let clock_mhz = match parts.next() {
            Some(mhz) => Some(
                mhz.parse::<u64>()
                    .with_context(|| format!("Invalid clock {:?} in cluster {:?}", mhz, s))?,
            ),
            None => None,
        };
        if parts.next().is_some() {
            bail!("Trailing fields in cluster {:?}", s);
        }
        Ok(Self {
            cpus,
            core,
            clock_mhz,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    nr_cpus: usize,
    cpu_capacity: Vec<u32>,
    partition: Vec<Cpumask>,
}

impl Topology {
    /// All @nr_cpus CPUs are equal. This is a single domain system.
    pub fn uniform(nr_cpus: usize) -> Result<Self> {
        if nr_cpus == 0 {
            bail!("Topology needs at least one CPU");
        }
        Ok(Self {
            nr_cpus,
            cpu_capacity: vec![SCHED_CAPACITY_SCALE; nr_cpus],
            partition: vec![Cpumask::full(nr_cpus)],
        })
    }

    /// Derive capacity classes from per-CPU descriptions. CPU ids must be
    /// dense starting at 0.
    pub fn from_cpus(cpus: &[CpuDesc]) -> Result<Self> {
        let nr_cpus = cpus.len();
        if nr_cpus == 0 {
            bail!("Topology needs at least one CPU");
        }
        let mut seen = Cpumask::new(nr_cpus);
        for cpu in cpus.iter() {
            seen.set_cpu(cpu.id)
                .with_context(|| format!("CPU ids must be dense, found {}", cpu.id))?;
        }
        if !seen.is_full() {
            bail!("Duplicate CPU ids in topology description");
        }

        let cpu_capacity = normalize(cpus.iter().map(|c| (c.id, c.raw_capacity())), nr_cpus)?;

        // One class per distinct capacity, fastest first.
        let mut classes = SortedVec::from_unsorted(
            cpu_capacity.iter().map(|cap| Reverse(*cap)).collect::<Vec<_>>(),
        )
        .into_vec();
        classes.dedup();

        let partition = classes
            .iter()
            .map(|Reverse(cap)| {
                Cpumask::from_cpus(
                    (0..nr_cpus).filter(|cpu| cpu_capacity[*cpu] == *cap),
                    nr_cpus,
                )
            })
            .collect::<Vec<_>>();

        debug!(
            "Derived {} capacity classes from {} CPUs",
            partition.len(),
            nr_cpus
        );

        Ok(Self {
            nr_cpus,
            cpu_capacity,
            partition,
        })
    }

    /// Build a topology from explicit clusters. Clusters must be disjoint
    /// and together cover CPUs 0..N.
    pub fn from_clusters(clusters: &[ClusterSpec]) -> Result<Self> {
        if clusters.is_empty() {
            bail!("No clusters specified");
        }
        let nr_cpus = clusters
            .iter()
            .flat_map(|c| c.cpus.iter())
            .max()
            .map(|max| max + 1)
            .ok_or_else(|| anyhow!("Clusters have no CPUs"))?;

        let mut seen = Cpumask::new(nr_cpus);
        let mut raw = vec![];
        let mut masks = vec![];
        for (idx, cluster) in clusters.iter().enumerate() {
            if cluster.cpus.is_empty() {
                bail!("Cluster {} has no CPUs", idx);
            }
            let core = cluster.core.as_deref().unwrap_or("unknown");
            let mhz = cluster.clock_mhz.unwrap_or(DEFAULT_CLOCK_MHZ);
            let mut mask = Cpumask::new(nr_cpus);
            for cpu in cluster.cpus.iter() {
                if seen.test_cpu(*cpu) {
                    bail!("CPU {} belongs to more than one cluster", cpu);
                }
                seen.set_cpu(*cpu)?;
                mask.set_cpu(*cpu)?;
                raw.push((*cpu, CpuDesc::new(*cpu, core, mhz).raw_capacity()));
            }
            masks.push(mask);
        }
        if !seen.is_full() {
            bail!(
                "CPUs {} are not covered by any cluster",
                seen.not()
            );
        }

        let cpu_capacity = normalize(raw.into_iter(), nr_cpus)?;

        // Stable sort keeps the given order between equal-capacity clusters.
        let mut partition = masks;
        partition.sort_by_key(|mask| {
            Reverse(mask.first().map(|cpu| cpu_capacity[cpu]).unwrap_or(0))
        });

        Ok(Self {
            nr_cpus,
            cpu_capacity,
            partition,
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Nominal capacity of @cpu on the 0..=1024 scale.
    pub fn cpu_capacity(&self, cpu: usize) -> u32 {
        self.cpu_capacity.get(cpu).copied().unwrap_or(0)
    }

    /// CPU sets ordered from the fastest to the slowest class.
    pub fn partition(&self) -> &[Cpumask] {
        &self.partition
    }
}

fn normalize<I>(raw: I, nr_cpus: usize) -> Result<Vec<u32>>
where
    I: Iterator<Item = (usize, u64)>,
{
    let raw: Vec<(usize, u64)> = raw.collect();
    let max_raw = raw.iter().map(|(_, cap)| *cap).max().unwrap_or(0);
    if max_raw == 0 {
        bail!("All CPUs have zero raw capacity");
    }

    let mut caps = vec![0; nr_cpus];
    for (cpu, cap) in raw {
        caps[cpu] = ((cap << SCHED_CAPACITY_SHIFT) / max_raw) as u32;
    }
    Ok(caps)
}
