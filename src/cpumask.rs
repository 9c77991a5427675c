// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # HMP Cpumask
//!
//! A fixed-width set of CPU ids backed by a `BitVec` of u64's.
//!
//! Every mask carries the number of CPU ids it can hold. Masks used by the
//! engine are always created with the number of possible CPUs of the
//! topology they describe, so binary operations between them are well
//! defined.
//!
//!```
//!     use scx_hmp::cpumask::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     assert!(!mask.test_cpu(0));
//!     mask.set_cpu(0).unwrap();
//!     assert!(mask.test_cpu(0));
//!
//!     let big = Cpumask::from_cpulist("4-7", 8).unwrap();
//!     assert_eq!(big.weight(), 4);
//!     assert!(!big.intersects(&mask));
//!```
//!
//! Hexadecimal strings and the special values "none" and "all" are accepted
//! as well:
//!
//!```
//!     use scx_hmp::cpumask::Cpumask;
//!     let mask = Cpumask::from_str("0xf0", 8).unwrap();
//!     assert_eq!(mask.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
//!     assert!(Cpumask::from_str("all", 8).unwrap().is_full());
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold @nr_cpus CPU ids.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every one of the @nr_cpus CPU ids set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask object from a hexadecimal string.
    pub fn from_str(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => return Ok(Self::full(nr_cpus)),
            _ => {}
        }

        let hex_str = cpumask
            .strip_prefix("0x")
            .unwrap_or(cpumask)
            .replace('_', "");
        if hex_str.is_empty() {
            bail!("Empty cpumask string");
        }

        let mut mask = Self::new(nr_cpus);
        for (index, digit) in hex_str.chars().rev().enumerate() {
            let mut v = digit
                .to_digit(16)
                .with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 4 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        concat!(
                            "Found cpu ({}) in cpumask ({}) which is larger",
                            " than the number of cpus ({})"
                        ),
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }
        Ok(mask)
    }

    /// Build a Cpumask from a cpulist such as "0-3,6".
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)
                .with_context(|| format!("Invalid cpulist {cpulist:?}"))?;
        }
        Ok(mask)
    }

    /// Build a Cpumask from an iterator of CPU ids. Ids that do not fit are
    /// ignored.
    pub fn from_cpus<I>(cpus: I, nr_cpus: usize) -> Cpumask
    where
        I: IntoIterator<Item = usize>,
    {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            let _ = mask.set_cpu(cpu);
        }
        mask
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the size of the mask, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Return true if the Cpumask has all bits set, false otherwise.
    pub fn is_full(&self) -> bool {
        self.mask.all()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Lowest CPU id set in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the negation of the current Cpumask.
    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    /// Whether the two masks share at least one CPU.
    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.iter().any(|cpu| other.test_cpu(cpu))
    }

    /// Whether every CPU of @self is also in @other.
    pub fn is_subset_of(&self, other: &Cpumask) -> bool {
        self.iter().all(|cpu| other.test_cpu(cpu))
    }

    /// Iterate over each element of a Cpumask, and return the indices with bits
    /// set.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',').map(str::trim) {
        let (min, max) = match group.split_once('-') {
            Some((lo, hi)) => (
                lo.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {}", group))?,
                hi.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {}", group))?,
            ),
            None => {
                let cpu = group
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {}", group))?;
                (cpu, cpu)
            }
        };
        if min > max {
            bail!("Inverted range in cpulist {}", group);
        }
        cpu_ids.extend(min..=max);
    }
    Ok(cpu_ids)
}
