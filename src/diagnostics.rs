// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Self-test of the facilities every benchmark depends on.

use std::thread;
use std::time::Duration;

use log::*;
use serde::Serialize;

use crate::affinity::{current_affinity, pin_current_thread, unpin_current_thread};
use crate::error::Result;
use crate::timer::{Timer, TimerBackend};
use crate::topology::{Cpu, SystemTopology};

/// Sleep used to cross-check a calibrated timer.
const TIMER_CHECK_SLEEP: Duration = Duration::from_millis(100);

/// Discovers the machine and logs what was found.
pub fn query_system_topology() -> Result<SystemTopology> {
    let topology = SystemTopology::discover()?;
    for node in 0..topology.num_nodes() {
        debug!("node {}: cpus {:?}", node, topology.cpus_on_node(node));
    }
    Ok(topology)
}

/// Outcome of [`test_timer_calibration`].
#[derive(Debug, Clone, Serialize)]
pub struct TimerReport {
    pub backend: TimerBackend,
    pub ticks_per_second: u64,
    pub ns_per_tick: f64,
    /// Length of the reference sleep.
    pub expected_ns: f64,
    /// What the timer measured for it.
    pub measured_ns: f64,
}

impl TimerReport {
    /// Relative deviation of the measurement from the reference.
    pub fn deviation(&self) -> f64 {
        (self.measured_ns - self.expected_ns) / self.expected_ns
    }
}

/// Calibrates a timer on `backend` and measures a known sleep with it.
pub fn test_timer_calibration(backend: TimerBackend) -> Result<TimerReport> {
    let timer = Timer::new(backend)?;
    let t0 = timer.start();
    thread::sleep(TIMER_CHECK_SLEEP);
    let t1 = timer.stop();

    let report = TimerReport {
        backend,
        ticks_per_second: timer.ticks_per_second(),
        ns_per_tick: timer.ns_per_tick(),
        expected_ns: TIMER_CHECK_SLEEP.as_nanos() as f64,
        measured_ns: timer.ticks_to_ns(t1.saturating_sub(t0)),
    };
    info!(
        "{} timer: {} Hz, slept {:.0} ns, measured {:.0} ns ({:+.2}%)",
        backend,
        report.ticks_per_second,
        report.expected_ns,
        report.measured_ns,
        report.deviation() * 100.0
    );
    Ok(report)
}

/// Result of binding to one CPU.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct AffinityProbe {
    pub cpu: Cpu,
    /// The thread ran exclusively on `cpu` after pinning.
    pub locked: bool,
    /// Unpinning succeeded afterwards.
    pub unlocked: bool,
}

/// Pins the calling thread to every online CPU in turn, and unpins it again.
pub fn test_thread_affinity_sweep(topology: &SystemTopology) -> Vec<AffinityProbe> {
    topology
        .online_cpus()
        .iter()
        .map(|&cpu| {
            let locked = pin_current_thread(cpu) && current_affinity() == [cpu];
            let unlocked = unpin_current_thread();
            if !locked {
                warn!("Affinity sweep: can't lock to cpu {}", cpu);
            }
            AffinityProbe {
                cpu,
                locked,
                unlocked,
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::online_cpus;

    #[test]
    fn os_timer_self_test() {
        let _r = env_logger::try_init();
        let report = test_timer_calibration(TimerBackend::OsCounter).unwrap();
        assert!(report.measured_ns >= 0.9 * report.expected_ns);
        assert!(report.deviation() > -0.1);
    }

    #[test]
    fn sweep_locks_allowed_cpus() {
        let allowed = current_affinity();
        let topology = SystemTopology::discover()
            .or_else(|_| SystemTopology::flat(online_cpus()))
            .unwrap();
        let probes = test_thread_affinity_sweep(&topology);
        assert_eq!(probes.len(), topology.online_cpus().len());
        for p in probes {
            assert!(p.unlocked, "cpu {}", p.cpu);
            if allowed.contains(&p.cpu) {
                assert!(p.locked, "cpu {}", p.cpu);
            }
        }
        let after = current_affinity();
        for cpu in allowed {
            assert!(after.contains(&cpu));
        }
    }
}
