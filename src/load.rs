// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Threads that impose memory traffic while a measurement runs.
//!
//! Workers are spawned per iteration inside a scope, pinned, and held at a
//! start gate until all of them are ready. The measuring closure runs once
//! the gate opens; afterwards workers are stopped through a shared flag (or
//! stop on their own after a fixed number of passes) and joined before
//! [`LoadWorkerPool::run_alongside`] returns, so no worker outlives the
//! iteration that started it.

use core::hint::black_box;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::thread;
use crossbeam_utils::{Backoff, CachePadded};
use log::*;

use crate::affinity::AffinityGuard;
use crate::error::{BenchError, Result};
use crate::kernel::AccessPlan;
use crate::region::{MemoryRegion, RegionView};
use crate::results::{Binding, BYTES_PER_MB};
use crate::timer::Timer;
use crate::topology::{Cpu, Node, SystemTopology};

/// When a worker stops issuing passes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StopCondition {
    /// Run until the measurement is done (at least one pass).
    Flag,
    /// Run exactly this many passes.
    Passes(u64),
}

/// What a worker did during one iteration.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct WorkerReport {
    pub(crate) bytes: u64,
    pub(crate) ticks: u64,
    pub(crate) binding: Binding,
}

impl WorkerReport {
    /// Throughput of this worker in MB/s.
    pub(crate) fn mbps(&self, timer: &Timer) -> f64 {
        if self.ticks == 0 {
            return 0.0;
        }
        self.bytes as f64 / BYTES_PER_MB / timer.ticks_to_secs(self.ticks)
    }
}

/// Placement and memory slice of one worker.
#[derive(Debug, Clone)]
struct LoadWorker {
    offset: usize,
    len: usize,
    cpu: Option<Cpu>,
}

const GATE_CLOSED: u8 = 0;
const GATE_OPEN: u8 = 1;
const GATE_ABORTED: u8 = 2;

/// Holds workers back until every one of them is spawned and pinned.
struct StartGate {
    ready: CachePadded<AtomicUsize>,
    state: CachePadded<AtomicU8>,
}

impl StartGate {
    fn new() -> StartGate {
        StartGate {
            ready: CachePadded::new(AtomicUsize::new(0)),
            state: CachePadded::new(AtomicU8::new(GATE_CLOSED)),
        }
    }

    fn arrive(&self) {
        self.ready.fetch_add(1, Ordering::AcqRel);
    }

    /// Blocks until `n` workers arrived.
    fn wait_for(&self, n: usize) {
        let backoff = Backoff::new();
        while self.ready.load(Ordering::Acquire) < n {
            backoff.snooze();
        }
    }

    fn set(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    /// Returns `false` if the run was aborted before the gate opened.
    fn pass(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.state.load(Ordering::Acquire) {
                GATE_OPEN => return true,
                GATE_ABORTED => return false,
                _ => backoff.snooze(),
            }
        }
    }
}

/// Raises the stop flag when dropped, also if the measurement unwinds.
struct StopOnDrop<'a>(&'a AtomicBool);

impl<'a> Drop for StopOnDrop<'a> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A fixed set of load threads for one benchmark instance.
#[derive(Debug, Clone)]
pub struct LoadWorkerPool {
    workers: Vec<LoadWorker>,
    plan: AccessPlan,
    /// CPU of the measuring thread.
    measurer: Option<Cpu>,
}

impl LoadWorkerPool {
    /// One worker per `(offset, len)` slice. Worker `k` runs on the CPU of
    /// rank `k + 1` of `node`, wrapping around, so rank 0 stays free for the
    /// measuring thread. Workers that still end up on `measurer` (a node
    /// with a single CPU, or more workers than CPUs) are reported.
    pub(crate) fn new(
        topology: &SystemTopology,
        node: Node,
        slices: &[(usize, usize)],
        plan: AccessPlan,
        measurer: Option<Cpu>,
    ) -> LoadWorkerPool {
        let node_cpus = topology.cpus_on_node(node).len();
        let workers: Vec<LoadWorker> = slices
            .iter()
            .enumerate()
            .map(|(k, &(offset, len))| {
                let cpu = if node_cpus == 0 {
                    None
                } else {
                    topology.cpu_id_for_node_rank(node, (k + 1) % node_cpus)
                };
                LoadWorker { offset, len, cpu }
            })
            .collect();
        debug!(
            "Load pool on node {}: {} workers on cpus {:?}",
            node,
            workers.len(),
            workers.iter().map(|w| w.cpu).collect::<Vec<_>>()
        );
        let pool = LoadWorkerPool {
            workers,
            plan,
            measurer,
        };
        let shared = pool.sharing_measurer();
        if shared > 0 {
            warn!(
                "{} load worker(s) share cpu {:?} with the measuring thread, results include time slicing",
                shared, measurer
            );
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of workers placed on the measuring thread's CPU.
    pub fn sharing_measurer(&self) -> usize {
        match self.measurer {
            Some(cpu) => self.workers.iter().filter(|w| w.cpu == Some(cpu)).count(),
            None => 0,
        }
    }

    /// CPUs the workers are placed on (`None` if the node has no CPUs).
    pub fn placement(&self) -> Vec<Option<Cpu>> {
        self.workers.iter().map(|w| w.cpu).collect()
    }

    /// Starts all workers on their slices of `region`, runs `measure` once
    /// they are all running, then stops and joins them.
    pub(crate) fn run_alongside<R, F>(
        &self,
        region: &MemoryRegion,
        timer: &Timer,
        stop: StopCondition,
        measure: F,
    ) -> Result<(R, Vec<WorkerReport>)>
    where
        F: FnOnce() -> R,
    {
        let stop_flag = CachePadded::new(AtomicBool::new(false));
        let gate = StartGate::new();

        let outcome = thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.workers.len());
            for (idx, w) in self.workers.iter().enumerate() {
                let view = region.view(w.offset, w.len);
                let (cpu, plan, gate, stop_flag) = (w.cpu, &self.plan, &gate, &*stop_flag);
                let spawned = s
                    .builder()
                    .name(format!("load-{}", idx))
                    .spawn(move |_| worker_loop(idx, cpu, view, plan, timer, gate, stop_flag, stop));
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        gate.set(GATE_ABORTED);
                        for h in handles {
                            let _ = h.join();
                        }
                        return Err(BenchError::WorkerFailed(format!(
                            "can't spawn load worker {}: {}",
                            idx, e
                        )));
                    }
                }
            }

            gate.wait_for(handles.len());
            let result = {
                let _stop = StopOnDrop(&*stop_flag);
                gate.set(GATE_OPEN);
                panic::catch_unwind(AssertUnwindSafe(measure))
            };

            let mut reports = Vec::with_capacity(handles.len());
            for (idx, h) in handles.into_iter().enumerate() {
                match h.join() {
                    Ok(report) => reports.push(report),
                    Err(_) => {
                        return Err(BenchError::WorkerFailed(format!(
                            "load worker {} panicked",
                            idx
                        )))
                    }
                }
            }
            match result {
                Ok(result) => Ok((result, reports)),
                Err(_) => Err(BenchError::WorkerFailed(String::from(
                    "measurement panicked while load workers were running",
                ))),
            }
        });

        match outcome {
            Ok(r) => r,
            Err(_) => Err(BenchError::WorkerFailed(String::from(
                "load worker panicked",
            ))),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    idx: usize,
    cpu: Option<Cpu>,
    view: RegionView<'_>,
    plan: &AccessPlan,
    timer: &Timer,
    gate: &StartGate,
    stop_flag: &AtomicBool,
    stop: StopCondition,
) -> WorkerReport {
    let guard = AffinityGuard::pin(cpu);
    gate.arrive();
    if !gate.pass() {
        return WorkerReport {
            bytes: 0,
            ticks: 0,
            binding: Binding::new(cpu, guard.is_pinned()),
        };
    }
    trace!("load-{} started on cpu {:?}", idx, cpu);

    let touched = (view.len() / plan.chunk.bytes() * plan.chunk.bytes()) as u64;
    let mut sink = 0u64;
    let mut passes = 0u64;
    let t0 = timer.start();
    loop {
        // Safety: views are chunk aligned and in bounds of the region.
        unsafe { plan.pass(view.as_mut_ptr(), view.len(), &mut sink) };
        passes += 1;
        let done = match stop {
            StopCondition::Flag => stop_flag.load(Ordering::Acquire),
            StopCondition::Passes(n) => passes >= n,
        };
        if done {
            break;
        }
    }
    let t1 = timer.stop();
    black_box(sink);

    trace!("load-{} stopped after {} passes", idx, passes);
    WorkerReport {
        bytes: passes * touched,
        ticks: t1.saturating_sub(t0),
        binding: Binding::new(cpu, guard.is_pinned()),
    }
}
