// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The benchmark state machine.
//!
//! A [`Benchmark`] owns its memory region and configuration and runs all of
//! its iterations exactly once. What happens inside a timed section is up to
//! the [`Workload`]: [`Latency`] chases pointers (optionally under load),
//! [`Throughput`] streams through the region from one or more threads.

use std::fmt;

use log::*;

use crate::affinity::{AffinityGuard, PriorityGuard};
use crate::config::BenchmarkConfig;
use crate::error::{BenchError, Result};
use crate::power::{PowerReader, PowerSample};
use crate::region::MemoryRegion;
use crate::results::{Aggregate, Binding, Measurement, MetricUnit, ResultSet};
use crate::timer::Timer;
use crate::topology::{Cpu, SystemTopology};

mod latency;
mod throughput;

pub use latency::Latency;
pub use throughput::Throughput;

pub type LatencyBenchmark<'t> = Benchmark<'t, Latency>;
pub type ThroughputBenchmark<'t> = Benchmark<'t, Throughput>;

/// Life cycle of a [`Benchmark`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BenchmarkState {
    Constructed,
    /// Access pattern and placement are set up.
    Configured,
    /// Executing the given iteration.
    Running(u32),
    Completed,
    /// An iteration failed; the results recorded so far are kept.
    Aborted,
}

impl fmt::Display for BenchmarkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BenchmarkState::Constructed => write!(f, "constructed"),
            BenchmarkState::Configured => write!(f, "configured"),
            BenchmarkState::Running(i) => write!(f, "running iteration {}", i),
            BenchmarkState::Completed => write!(f, "completed"),
            BenchmarkState::Aborted => write!(f, "aborted"),
        }
    }
}

/// What a timed section can see of its benchmark.
pub struct IterationContext<'a> {
    pub(crate) region: &'a MemoryRegion,
    pub(crate) timer: &'a Timer,
    pub(crate) passes: u64,
    /// Where the measuring thread runs, and whether binding it worked.
    pub(crate) binding: Binding,
}

/// The measuring thread runs on the first CPU of the CPU node.
pub(crate) fn measuring_cpu(config: &BenchmarkConfig, topology: &SystemTopology) -> Option<Cpu> {
    topology.cpu_id_for_node_rank(config.cpu_node(), 0)
}

/// The access kernel and metric of a benchmark variant.
pub trait Workload: Sized {
    /// Unit of the per-iteration metric.
    const UNIT: MetricUnit;

    /// Lays out the access pattern in `region`. Called once, before the
    /// first iteration.
    fn prepare(
        config: &BenchmarkConfig,
        region: &MemoryRegion,
        topology: &SystemTopology,
    ) -> Result<Self>;

    /// Does this workload report a load metric per iteration?
    fn with_load(&self) -> bool;

    /// Runs one timed section of `ctx.passes` passes.
    fn run_iteration(&mut self, ctx: &IterationContext) -> Result<Measurement>;
}

/// One benchmark instance: a memory region, its configuration, and the
/// results of running it.
pub struct Benchmark<'t, W: Workload> {
    config: BenchmarkConfig,
    topology: &'t SystemTopology,
    timer: &'t Timer,
    region: MemoryRegion,
    power_readers: Vec<Box<dyn PowerReader>>,
    workload: Option<W>,
    passes: u64,
    state: BenchmarkState,
    results: ResultSet,
}

impl<'t, W: Workload> Benchmark<'t, W> {
    /// Allocates `len_bytes` on the memory node of `config`.
    pub fn new(
        config: BenchmarkConfig,
        len_bytes: usize,
        topology: &'t SystemTopology,
        timer: &'t Timer,
    ) -> Result<Benchmark<'t, W>> {
        for (what, node) in [("cpu", config.cpu_node()), ("worker", config.worker_node())] {
            if node >= topology.num_nodes() {
                return Err(BenchError::InvalidConfig(format!(
                    "{} node {} does not exist ({} nodes)",
                    what,
                    node,
                    topology.num_nodes()
                )));
            }
        }

        let region = MemoryRegion::allocate(len_bytes, config.mem_node(), topology)?;
        let passes = config.pass_policy().passes_for(len_bytes);
        debug!(
            "{}: {} bytes on node {}, cpu node {}, {} passes per iteration",
            config.name(),
            len_bytes,
            config.mem_node(),
            config.cpu_node(),
            passes
        );

        Ok(Benchmark {
            config,
            topology,
            timer,
            region,
            power_readers: Vec::new(),
            workload: None,
            passes,
            state: BenchmarkState::Constructed,
            results: ResultSet::new(W::UNIT, false),
        })
    }

    /// Samples `reader` during every timed section.
    pub fn add_power_reader(&mut self, reader: Box<dyn PowerReader>) -> &mut Self {
        self.power_readers.push(reader);
        self
    }

    /// Prepares the access pattern. Done implicitly by [`Benchmark::run`].
    pub fn configure(&mut self) -> Result<()> {
        match self.state {
            BenchmarkState::Constructed => {}
            BenchmarkState::Configured => return Ok(()),
            _ => return Err(BenchError::AlreadyRun),
        }
        let workload = W::prepare(&self.config, &self.region, self.topology)?;
        self.results = ResultSet::new(W::UNIT, workload.with_load());
        self.workload = Some(workload);
        self.state = BenchmarkState::Configured;
        Ok(())
    }

    /// Runs every iteration. A benchmark can only run once; a second call
    /// fails with [`BenchError::AlreadyRun`].
    pub fn run(&mut self) -> Result<&ResultSet> {
        match self.state {
            BenchmarkState::Constructed => self.configure()?,
            BenchmarkState::Configured => {}
            _ => return Err(BenchError::AlreadyRun),
        }

        for i in 0..self.config.iterations() {
            self.state = BenchmarkState::Running(i);
            if let Err(e) = self.run_iteration(i) {
                error!("{}: iteration {} failed: {}", self.config.name(), i, e);
                self.state = BenchmarkState::Aborted;
                return Err(e);
            }
        }
        self.state = BenchmarkState::Completed;

        if let Ok(agg) = self.results.finalize() {
            info!(
                "{}: {} iterations, mean {:.3} {} (min {:.3}, max {:.3})",
                self.config.name(),
                agg.iterations,
                agg.mean,
                agg.unit,
                agg.min,
                agg.max
            );
        }
        Ok(&self.results)
    }

    fn run_iteration(&mut self, iteration: u32) -> Result<()> {
        let workload = self.workload.as_mut().ok_or(BenchError::InvalidConfig(
            String::from("benchmark is not configured"),
        ))?;

        let _priority = if self.config.boost_priority() {
            PriorityGuard::boost()
        } else {
            None
        };
        let affinity = AffinityGuard::pin(measuring_cpu(&self.config, self.topology));
        if !affinity.is_pinned() {
            warn!(
                "{}: iteration {} runs unpinned, expect noisy results",
                self.config.name(),
                iteration
            );
        }

        let started: Vec<bool> = self
            .power_readers
            .iter_mut()
            .map(|r| r.start_sampling())
            .collect();

        let ctx = IterationContext {
            region: &self.region,
            timer: self.timer,
            passes: self.passes,
            binding: Binding::new(affinity.cpu(), affinity.is_pinned()),
        };
        let measurement = workload.run_iteration(&ctx);

        let power: Vec<PowerSample> = self
            .power_readers
            .iter_mut()
            .zip(started)
            .map(|(r, started)| {
                let stopped = r.stop_sampling();
                let watts = if started && stopped {
                    Some(r.average_power())
                } else {
                    warn!("Power reader {} failed to sample iteration {}", r.name(), iteration);
                    None
                };
                PowerSample::new(r.name(), watts)
            })
            .collect();
        drop(affinity);

        self.results.record(iteration as usize, measurement?, power)
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn state(&self) -> BenchmarkState {
        self.state
    }

    /// Passes over the region per iteration.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn workload(&self) -> Option<&W> {
        self.workload.as_ref()
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn finalize(&self) -> Result<Aggregate> {
        self.results.finalize()
    }

    /// See [`ResultSet::load_metric_on_iter`].
    pub fn load_metric_on_iter(&self, iteration: usize) -> Result<f64> {
        self.results.load_metric_on_iter(iteration)
    }

    /// See [`ResultSet::avg_load_metric`].
    pub fn avg_load_metric(&self) -> Result<f64> {
        self.results.avg_load_metric()
    }
}

impl<'t, W: Workload> fmt::Debug for Benchmark<'t, W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Benchmark")
            .field("config", &self.config)
            .field("region", &self.region)
            .field("passes", &self.passes)
            .field("state", &self.state)
            .field("power_readers", &self.power_readers.len())
            .finish()
    }
}
