// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # HMP capacity domains
//!
//! A `DomainGroup` is the runtime view of the topology: an ordered list of
//! capacity domains, fastest first, together with the set of CPUs currently
//! online and the frequency scale of each CPU.
//!
//! Domain ids are positions in that list. The domain faster than domain N is
//! N - 1 and the slower one N + 1, so walking towards the fast or the slow
//! end never needs a search. The possible CPUs of each domain are fixed at
//! construction; only the online set changes, under its own lock.
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Result;
use log::info;

use crate::cpumask::Cpumask;
use crate::freq::FreqScale;
use crate::topology::Topology;
use crate::topology::SCHED_CAPACITY_SCALE;

#[derive(Debug, Clone)]
pub struct CapacityDomain {
    id: usize,
    cpus: Cpumask,
    capacity: u32,
}

impl CapacityDomain {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Every CPU which may ever be part of this domain.
    pub fn cpus(&self) -> &Cpumask {
        &self.cpus
    }

    /// Nominal capacity shared by the CPUs of the domain.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[derive(Debug)]
pub struct DomainGroup {
    nr_cpus: usize,
    doms: Vec<CapacityDomain>,
    cpu_dom: Vec<Option<usize>>,
    cpu_capacity: Vec<u32>,
    online: RwLock<Cpumask>,
    freq: FreqScale,
}

impl DomainGroup {
    pub fn new(topo: &Topology, online: &Cpumask) -> Result<Self> {
        let nr_cpus = topo.nr_cpus();
        if online.len() != nr_cpus {
            bail!(
                "Online mask covers {} CPUs, topology has {}",
                online.len(),
                nr_cpus
            );
        }

        let mut cpu_dom = vec![None; nr_cpus];
        let mut doms = vec![];
        for (id, cpus) in topo.partition().iter().enumerate() {
            let Some(first) = cpus.first() else {
                bail!("Capacity domain {} is empty", id);
            };
            for cpu in cpus.iter() {
                if cpu_dom[cpu].is_some() {
                    bail!("CPU {} belongs to more than one domain", cpu);
                }
                cpu_dom[cpu] = Some(id);
            }
            doms.push(CapacityDomain {
                id,
                cpus: cpus.clone(),
                capacity: topo.cpu_capacity(first),
            });
        }
        if let Some(cpu) = cpu_dom.iter().position(|dom| dom.is_none()) {
            bail!("CPU {} is not in any domain", cpu);
        }

        for dom in doms.iter() {
            info!(
                "DOM[{:02}] cpus={} capacity={}",
                dom.id, dom.cpus, dom.capacity
            );
        }

        Ok(Self {
            nr_cpus,
            doms,
            cpu_dom,
            cpu_capacity: (0..nr_cpus).map(|cpu| topo.cpu_capacity(cpu)).collect(),
            online: RwLock::new(online.clone()),
            freq: FreqScale::new(nr_cpus),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn nr_doms(&self) -> usize {
        self.doms.len()
    }

    pub fn doms(&self) -> &[CapacityDomain] {
        &self.doms
    }

    pub fn dom(&self, id: usize) -> Option<&CapacityDomain> {
        self.doms.get(id)
    }

    /// With a single capacity class there is nothing to migrate between.
    pub fn arch_is_smp(&self) -> bool {
        self.doms.len() <= 1
    }

    pub fn cpu_dom_id(&self, cpu: usize) -> Option<usize> {
        self.cpu_dom.get(cpu).copied().flatten()
    }

    pub fn domain_of(&self, cpu: usize) -> Option<&CapacityDomain> {
        self.cpu_dom_id(cpu).and_then(|id| self.doms.get(id))
    }

    pub fn fastest(&self) -> &CapacityDomain {
        &self.doms[0]
    }

    pub fn slowest(&self) -> &CapacityDomain {
        &self.doms[self.doms.len() - 1]
    }

    pub fn is_fastest(&self, cpu: usize) -> bool {
        self.cpu_dom_id(cpu) == Some(0)
    }

    pub fn is_slowest(&self, cpu: usize) -> bool {
        self.cpu_dom_id(cpu) == Some(self.doms.len() - 1)
    }

    /// The domain one step faster than the one holding @cpu.
    pub fn faster_domain(&self, cpu: usize) -> Result<&CapacityDomain> {
        match self.cpu_dom_id(cpu) {
            None => bail!("CPU {} is not in any domain", cpu),
            Some(0) => bail!("CPU {} is already in the fastest domain", cpu),
            Some(id) => Ok(&self.doms[id - 1]),
        }
    }

    /// The domain one step slower than the one holding @cpu.
    pub fn slower_domain(&self, cpu: usize) -> Result<&CapacityDomain> {
        match self.cpu_dom_id(cpu) {
            None => bail!("CPU {} is not in any domain", cpu),
            Some(id) if id + 1 >= self.doms.len() => {
                bail!("CPU {} is already in the slowest domain", cpu)
            }
            Some(id) => Ok(&self.doms[id + 1]),
        }
    }

    fn online_read(&self) -> RwLockReadGuard<'_, Cpumask> {
        self.online.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn online_mask(&self) -> Cpumask {
        self.online_read().clone()
    }

    pub fn cpu_online(&self, cpu: usize) -> bool {
        self.online_read().test_cpu(cpu)
    }

    pub fn nr_online(&self) -> usize {
        self.online_read().weight()
    }

    /// Lowest online CPU. Its clock is the time base for every migration
    /// timestamp.
    pub fn first_online(&self) -> Option<usize> {
        self.online_read().first()
    }

    /// Online CPUs of domain @dom_id.
    pub fn online_cpus(&self, dom_id: usize) -> Cpumask {
        match self.doms.get(dom_id) {
            Some(dom) => dom.cpus.and(&self.online_read()),
            None => Cpumask::new(self.nr_cpus),
        }
    }

    /// Flip @cpu's online state. Returns whether anything changed.
    pub fn set_cpu_online(&self, cpu: usize, online: bool) -> Result<bool> {
        let mut mask = self.online.write().unwrap_or_else(PoisonError::into_inner);
        let was = mask.test_cpu(cpu);
        if online {
            mask.set_cpu(cpu)?;
        } else {
            mask.clear_cpu(cpu)?;
        }
        Ok(was != online)
    }

    /// Nominal capacity of @cpu, not adjusted for frequency.
    pub fn nominal_capacity(&self, cpu: usize) -> u32 {
        self.cpu_capacity.get(cpu).copied().unwrap_or(0)
    }

    /// Capacity of @cpu at its current frequency. The scale reads as full
    /// when frequency invariance is off.
    pub fn capacity_of(&self, cpu: usize) -> u32 {
        let cap = (self.nominal_capacity(cpu) as u64 * self.freq.curr_scale(cpu) as u64) >> 10;
        cap.min(SCHED_CAPACITY_SCALE as u64) as u32
    }

    pub fn freq(&self) -> &FreqScale {
        &self.freq
    }
}
