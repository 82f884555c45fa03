// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Memory throughput.
//!
//! The region is split into one partition per thread. The measuring thread
//! works on the first one, pool workers on the rest; all run the same number
//! of passes with independent (pipelinable) accesses.

use core::hint::black_box;

use log::*;

use super::latency::seeded_rng;
use super::{measuring_cpu, IterationContext, Workload};
use crate::config::BenchmarkConfig;
use crate::error::{BenchError, Result};
use crate::kernel::AccessPlan;
use crate::load::{LoadWorkerPool, StopCondition, WorkerReport};
use crate::region::{partition, MemoryRegion};
use crate::results::{Measurement, MetricUnit, BYTES_PER_MB};
use crate::topology::SystemTopology;

/// Streaming workload of a [`super::ThroughputBenchmark`].
#[derive(Debug)]
pub struct Throughput {
    /// `(offset, len)` of the measuring thread's partition.
    own: (usize, usize),
    plan: AccessPlan,
    pool: LoadWorkerPool,
}

impl Throughput {
    /// Threads streaming through the region, the measuring one included.
    pub fn threads(&self) -> usize {
        self.pool.len() + 1
    }
}

impl Workload for Throughput {
    const UNIT: MetricUnit = MetricUnit::MegabytesPerSecond;

    fn prepare(
        config: &BenchmarkConfig,
        region: &MemoryRegion,
        topology: &SystemTopology,
    ) -> Result<Throughput> {
        let chunk = config.chunk_size();
        let threads = config.worker_threads().max(1);
        let parts = partition(region.len(), threads, chunk.bytes()).ok_or_else(|| {
            BenchError::InvalidConfig(format!(
                "{} bytes can't be split into {} partitions of {} chunks",
                region.len(),
                threads,
                chunk
            ))
        })?;

        let plan = AccessPlan::new(
            config.pattern(),
            chunk,
            config.rw_mode(),
            config.stride_bytes(),
            parts[0].1 / chunk.bytes(),
            &mut seeded_rng(config),
        );
        let pool = LoadWorkerPool::new(
            topology,
            config.worker_node(),
            &parts[1..],
            plan.clone(),
            measuring_cpu(config, topology),
        );
        debug!(
            "{}: {} threads, {} bytes each, {} {} {}",
            config.name(),
            threads,
            parts[0].1,
            config.pattern(),
            config.rw_mode(),
            chunk
        );

        Ok(Throughput {
            own: parts[0],
            plan,
            pool,
        })
    }

    fn with_load(&self) -> bool {
        false
    }

    fn run_iteration(&mut self, ctx: &IterationContext) -> Result<Measurement> {
        let timer = ctx.timer;
        let passes = ctx.passes;
        let view = ctx.region.view(self.own.0, self.own.1);
        let chunk = self.plan.chunk.bytes();
        let touched = (view.len() / chunk * chunk) as u64;
        let plan = &self.plan;

        let stream = || {
            let mut sink = 0u64;
            let t0 = timer.start();
            for _ in 0..passes {
                // Safety: partitions are chunk aligned and in bounds.
                unsafe { plan.pass(view.as_mut_ptr(), view.len(), &mut sink) };
            }
            let t1 = timer.stop();
            black_box(sink);
            WorkerReport {
                bytes: passes * touched,
                ticks: t1.saturating_sub(t0),
                binding: ctx.binding,
            }
        };

        let (own, workers) =
            self.pool
                .run_alongside(ctx.region, timer, StopCondition::Passes(passes), stream)?;

        let all: Vec<&WorkerReport> = core::iter::once(&own).chain(workers.iter()).collect();
        let elapsed_ticks = all.iter().map(|r| r.ticks).max().unwrap_or(0);
        let bytes: u64 = all.iter().map(|r| r.bytes).sum();
        let secs = timer.ticks_to_secs(elapsed_ticks);
        let metric = if secs > 0.0 {
            bytes as f64 / BYTES_PER_MB / secs
        } else {
            0.0
        };

        Ok(Measurement {
            elapsed_ticks,
            elapsed_ns: timer.ticks_to_ns(elapsed_ticks),
            metric,
            load_metric: None,
            measurer: own.binding,
            workers: workers.iter().map(|r| r.binding).collect(),
        })
    }
}
