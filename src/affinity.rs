// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pinning of the calling thread to CPUs and NUMA nodes.
//!
//! Binding failures are never fatal: a run with imperfect placement still
//! produces (noisier) data. All functions here report success as a `bool`
//! and log a warning when the OS refuses.

use log::*;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::topology::{self, Cpu, Node, SystemTopology};

/// Restricts the calling thread to exactly `cpu`.
///
/// Returns `false` (and leaves the affinity untouched) if the CPU does not
/// exist or the OS refuses.
pub fn pin_current_thread(cpu: Cpu) -> bool {
    let mut cpu_set = CpuSet::new();
    if let Err(e) = cpu_set.set(cpu) {
        warn!("Can't pin thread to cpu {}: {}", cpu, e);
        return false;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            trace!("Pinned thread {:?} to cpu {}", std::thread::current().id(), cpu);
            true
        }
        Err(e) => {
            warn!("Can't pin thread to cpu {}: {}", cpu, e);
            false
        }
    }
}

/// Allows the calling thread to run on every online CPU again.
pub fn unpin_current_thread() -> bool {
    let mut cpu_set = CpuSet::new();
    for cpu in topology::online_cpus() {
        // CPUs beyond what a `CpuSet` can hold are left out.
        let _ = cpu_set.set(cpu);
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => true,
        Err(e) => {
            warn!("Can't unpin thread: {}", e);
            false
        }
    }
}

/// Pins the calling thread to the first CPU of `node`.
///
/// Cross-node memory locality is what we care about, so any CPU of the node
/// is representative.
pub fn pin_current_thread_to_node(topology: &SystemTopology, node: Node) -> bool {
    match topology.cpu_id_for_node_rank(node, 0) {
        Some(cpu) => pin_current_thread(cpu),
        None => {
            warn!("NUMA node {} has no CPUs, can't pin thread to it", node);
            false
        }
    }
}

/// The CPUs the calling thread may currently run on.
pub fn current_affinity() -> Vec<Cpu> {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(cpu_set) => (0..CpuSet::count())
            .filter(|cpu| cpu_set.is_set(*cpu).unwrap_or(false))
            .collect(),
        Err(e) => {
            warn!("Can't read thread affinity: {}", e);
            Vec::new()
        }
    }
}

/// Keeps the calling thread pinned while alive.
///
/// Dropping the guard unpins the thread again, also if pinning failed or the
/// timed section unwinds.
#[derive(Debug)]
pub struct AffinityGuard {
    cpu: Option<Cpu>,
    pinned: bool,
}

impl AffinityGuard {
    /// Pins to `cpu`; `None` means there was no CPU to pin to.
    pub fn pin(cpu: Option<Cpu>) -> AffinityGuard {
        let pinned = cpu.map(pin_current_thread).unwrap_or(false);
        AffinityGuard { cpu, pinned }
    }

    pub fn cpu(&self) -> Option<Cpu> {
        self.cpu
    }

    /// Did the binding succeed?
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if !unpin_current_thread() {
            warn!("Thread stays bound to cpu {:?} after timed section", self.cpu);
        }
    }
}

/// Raises the scheduling priority of the calling thread while alive.
///
/// Needs `CAP_SYS_NICE` (or root); without it [`PriorityGuard::boost`]
/// returns `None`. The previous nice value is restored on drop.
#[derive(Debug)]
pub struct PriorityGuard {
    previous: i32,
}

/// Highest priority a nice value can express.
const BOOSTED_NICE: i32 = -20;

impl PriorityGuard {
    pub fn boost() -> Option<PriorityGuard> {
        // who = 0: on Linux this is the calling thread.
        let previous = unsafe { nix::libc::getpriority(nix::libc::PRIO_PROCESS, 0) };
        let rc = unsafe { nix::libc::setpriority(nix::libc::PRIO_PROCESS, 0, BOOSTED_NICE) };
        if rc != 0 {
            debug!(
                "Can't boost scheduling priority: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        Some(PriorityGuard { previous })
    }
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        let rc = unsafe { nix::libc::setpriority(nix::libc::PRIO_PROCESS, 0, self.previous) };
        if rc != 0 {
            warn!(
                "Can't revert scheduling priority to {}: {}",
                self.previous,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pin_to_cpu_out_of_range() {
        let _r = env_logger::try_init();
        let before = current_affinity();
        assert!(!pin_current_thread(CpuSet::count() + 7));
        assert_eq!(current_affinity(), before);
    }

    #[test]
    fn guard_unpins_on_drop() {
        let allowed = current_affinity();
        let cpu = allowed[0];
        {
            let guard = AffinityGuard::pin(Some(cpu));
            assert!(guard.is_pinned());
            assert_eq!(current_affinity(), vec![cpu]);
        }
        let after = current_affinity();
        for cpu in allowed {
            assert!(after.contains(&cpu));
        }
    }

    #[test]
    fn guard_without_cpu() {
        let guard = AffinityGuard::pin(None);
        assert!(!guard.is_pinned());
        assert_eq!(guard.cpu(), None);
    }
}
