// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_hmp
//!
//! Task placement and migration across the capacity domains of a
//! heterogeneous (big.LITTLE) multiprocessor.
//!
//! CPUs are grouped into capacity domains, fastest first. Each task's load
//! is compared against thresholds derived from both sides of a domain
//! boundary to decide whether it should move to a faster domain or be
//! pushed down to a slower one. Moves of running tasks are handed to the
//! source CPU's stopper and carried out at its next safe point.
//!
//! `HmpBalancer` is the entry point. The scheduler core it plugs into is
//! modelled by `rq::RunQueues`.
#[macro_use]
extern crate static_assertions;

pub mod cpumask;
pub mod topology;
pub mod domain;
pub mod freq;
pub mod tunables;
pub mod rq;
pub mod cluster;
pub mod threshold;
pub mod eligibility;
pub mod select;
pub mod stopper;
pub mod executor;
pub mod balancer;
pub mod events;
pub mod stats;

pub use balancer::HmpBalancer;
pub use cpumask::Cpumask;
pub use events::EventSink;
pub use events::HmpEvent;
pub use events::LogSink;
pub use rq::Task;
pub use topology::ClusterSpec;
pub use topology::Topology;
pub use tunables::Tunables;

// Loads live on a 0..=1023 scale below the capacity scale, and the
// variable scale conversion splits deltas into 32 bit halves.
const_assert!(tunables::HMP_MAX_LOAD < tunables::NICE_0_LOAD);
const_assert_eq!(tunables::NICE_0_LOAD, topology::SCHED_CAPACITY_SCALE);
const_assert!(tunables::HMP_VARIABLE_SCALE_SHIFT < 32);
