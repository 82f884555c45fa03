// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread pinning against the host's real CPUs.

use numa_membench::affinity::{
    current_affinity, pin_current_thread, pin_current_thread_to_node, unpin_current_thread,
    AffinityGuard,
};
use numa_membench::topology::online_cpus;
use numa_membench::SystemTopology;

fn topology() -> SystemTopology {
    SystemTopology::discover()
        .or_else(|_| SystemTopology::flat(online_cpus()))
        .expect("at least one cpu")
}

#[test]
fn pin_unpin_is_idempotent() {
    let _r = env_logger::try_init();
    let initial = current_affinity();
    let cpu = initial[initial.len() - 1];

    assert!(pin_current_thread(cpu));
    assert_eq!(current_affinity(), vec![cpu]);
    assert!(unpin_current_thread());
    let once = current_affinity();

    assert!(pin_current_thread(cpu));
    assert!(unpin_current_thread());
    assert!(pin_current_thread(cpu));
    assert!(unpin_current_thread());
    assert_eq!(current_affinity(), once);

    for cpu in initial {
        assert!(once.contains(&cpu));
    }
}

#[test]
fn out_of_range_cpu_is_refused() {
    let before = current_affinity();
    assert!(!pin_current_thread(usize::MAX / 2));
    assert_eq!(current_affinity(), before);
}

#[test]
fn node_rank_lookup_stays_on_node() {
    let topology = topology();
    for node in 0..topology.num_nodes() {
        let cpus = topology.cpus_on_node(node);
        for rank in 0..cpus.len() {
            let cpu = topology.cpu_id_for_node_rank(node, rank).unwrap();
            assert!(cpus.contains(&cpu));
            assert_eq!(topology.node_of_cpu(cpu), Some(node));
            // Same answer every time.
            assert_eq!(topology.cpu_id_for_node_rank(node, rank), Some(cpu));
        }
        assert_eq!(topology.cpu_id_for_node_rank(node, cpus.len()), None);
    }
}

#[test]
fn pin_to_node_uses_first_cpu() {
    let topology = topology();
    let allowed = current_affinity();
    let first = topology.cpu_id_for_node_rank(0, 0).unwrap();
    if allowed.contains(&first) {
        assert!(pin_current_thread_to_node(&topology, 0));
        assert_eq!(current_affinity(), vec![first]);
    }
    assert!(unpin_current_thread());
    assert!(!pin_current_thread_to_node(&topology, topology.num_nodes()));
}

#[test]
fn guard_releases_on_panic() {
    let allowed = current_affinity();
    let cpu = allowed[0];
    let r = std::panic::catch_unwind(|| {
        let _g = AffinityGuard::pin(Some(cpu));
        panic!("timed section failed");
    });
    assert!(r.is_err());
    let after = current_affinity();
    for cpu in allowed {
        assert!(after.contains(&cpu));
    }
}
