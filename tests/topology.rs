// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Domain partition properties over a range of layouts.
use scx_hmp::domain::DomainGroup;
use scx_hmp::topology::CpuDesc;
use scx_hmp::Cpumask;
use scx_hmp::Topology;

mod common;

fn check_partition(topo: &Topology) {
    let nr_cpus = topo.nr_cpus();
    let dg = DomainGroup::new(topo, &Cpumask::full(nr_cpus)).unwrap();

    for cpu in 0..nr_cpus {
        let owners = dg
            .doms()
            .iter()
            .filter(|dom| dom.cpus().test_cpu(cpu))
            .count();
        assert_eq!(owners, 1, "cpu{} is in {} domains", cpu, owners);
        assert_eq!(dg.domain_of(cpu).map(|d| d.cpus().test_cpu(cpu)), Some(true));
    }

    for pair in dg.doms().windows(2) {
        assert!(
            pair[0].capacity() >= pair[1].capacity(),
            "DOM[{}] cap {} before DOM[{}] cap {}",
            pair[0].id(),
            pair[0].capacity(),
            pair[1].id(),
            pair[1].capacity()
        );
    }
    assert_eq!(dg.arch_is_smp(), dg.nr_doms() == 1);
}

#[test]
fn test_partitions_from_clusters() {
    for layout in [
        common::BIG_LITTLE,
        common::THREE_TIER,
        &["0-3:cortex-a53:1300", "4-7:cortex-a57:1900"][..],
        &["4-7:cortex-a57:1900", "0-3:cortex-a53:1300"][..],
        &["0,2,4:a57:1900", "1,3,5:a53:1300"][..],
        &["0-7"][..],
    ] {
        check_partition(&common::topology(layout));
    }
}

#[test]
fn test_partitions_from_cpus() {
    let cores = ["a53", "a57", "a72", "a53"];
    let clocks = [800, 1300, 1900, 2400];
    for nr_cpus in 1..=8 {
        for seed in 0..4 {
            let cpus: Vec<CpuDesc> = (0..nr_cpus)
                .map(|id| {
                    CpuDesc::new(
                        id,
                        cores[(id + seed) % cores.len()],
                        clocks[(id * 3 + seed) % clocks.len()],
                    )
                })
                .collect();
            check_partition(&Topology::from_cpus(&cpus).unwrap());
        }
    }
}

#[test]
fn test_uniform_is_smp() {
    let topo = Topology::uniform(4).unwrap();
    let dg = DomainGroup::new(&topo, &Cpumask::full(4)).unwrap();
    assert!(dg.arch_is_smp());
    assert!(dg.faster_domain(0).is_err());
    assert!(dg.slower_domain(3).is_err());
    assert!(Topology::uniform(0).is_err());
}

#[test]
fn test_neighbour_domains() {
    let topo = common::topology(common::THREE_TIER);
    let dg = DomainGroup::new(&topo, &Cpumask::full(6)).unwrap();
    assert_eq!(dg.faster_domain(0).unwrap().id(), 1);
    assert_eq!(dg.faster_domain(2).unwrap().id(), 0);
    assert_eq!(dg.slower_domain(4).unwrap().id(), 1);
    assert!(dg.faster_domain(5).is_err());
    assert!(dg.slower_domain(1).is_err());
}
