// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Loaded and unloaded memory latency.
//!
//! The measuring thread follows a ring of pointers laid out in the region
//! according to the configured pattern. Each load depends on the previous
//! one, so the time per step is the access latency. Load workers (if any)
//! run throughput passes next to it for the duration of the chase.

use core::hint::black_box;
use core::mem::size_of;

use log::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::{measuring_cpu, IterationContext, Workload};
use crate::config::{BenchmarkConfig, LoadRegion};
use crate::error::{BenchError, Result};
use crate::kernel::{self, AccessPlan};
use crate::load::{LoadWorkerPool, StopCondition};
use crate::pattern::{random_order, sequential_order, Pattern, RwMode};
use crate::region::{partition, MemoryRegion};
use crate::results::{Measurement, MetricUnit};
use crate::topology::SystemTopology;

pub(crate) fn seeded_rng(config: &BenchmarkConfig) -> SmallRng {
    match config.random_seed() {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    }
}

/// Pointer-chase workload of a [`super::LatencyBenchmark`].
#[derive(Debug)]
pub struct Latency {
    /// Offset of the first ring slot in the region.
    start: usize,
    /// Slots in the ring, i.e. loads per pass.
    slots: usize,
    pool: Option<LoadWorkerPool>,
}

impl Latency {
    /// Loads per pass of the chase.
    pub fn chain_len(&self) -> usize {
        self.slots
    }

    pub fn load_workers(&self) -> Option<&LoadWorkerPool> {
        self.pool.as_ref()
    }
}

impl Workload for Latency {
    const UNIT: MetricUnit = MetricUnit::NanosPerAccess;

    fn prepare(
        config: &BenchmarkConfig,
        region: &MemoryRegion,
        topology: &SystemTopology,
    ) -> Result<Latency> {
        let chunk = config.chunk_size();
        let slot_bytes = chunk.bytes();
        if slot_bytes < size_of::<usize>() {
            return Err(BenchError::InvalidConfig(format!(
                "a {} chunk can't hold a pointer",
                chunk
            )));
        }
        let workers = config.worker_threads();
        let whole = (0, region.len() / slot_bytes * slot_bytes);

        let (chase, load_slices) = match (workers, config.load_region()) {
            (0, _) => (whole, Vec::new()),
            (n, LoadRegion::Partitioned) => {
                let parts = partition(region.len(), n + 1, slot_bytes).ok_or_else(|| {
                    BenchError::InvalidConfig(format!(
                        "{} bytes can't be split among {} load workers",
                        region.len(),
                        n
                    ))
                })?;
                (parts[0], parts[1..].to_vec())
            }
            (n, LoadRegion::Shared) => (whole, vec![whole; n]),
        };

        let slots = chase.1 / slot_bytes;
        if slots == 0 {
            return Err(BenchError::InvalidConfig(format!(
                "region of {} bytes holds no {} slot",
                region.len(),
                chunk
            )));
        }

        let mut rng = seeded_rng(config);
        let order = match config.pattern() {
            Pattern::Sequential => {
                sequential_order(slots, (config.stride_bytes() / slot_bytes as i64) as isize)
            }
            Pattern::Random => random_order(slots, &mut rng),
        };
        let view = region.view(chase.0, chase.1);
        // Safety: the view is chunk aligned and holds `slots` slots.
        unsafe { kernel::link_chain(view.as_mut_ptr(), slot_bytes, &order) };
        let start = chase.0 + order[0] * slot_bytes;

        let pool = if load_slices.is_empty() {
            None
        } else {
            let plan = AccessPlan::new(
                config.pattern(),
                chunk,
                config.rw_mode(),
                config.stride_bytes(),
                load_slices[0].1 / slot_bytes,
                &mut rng,
            );
            let plan = match config.load_region() {
                LoadRegion::Shared => {
                    if config.rw_mode() != RwMode::Read {
                        warn!(
                            "{}: load workers share the chased memory, using reads instead of {}",
                            config.name(),
                            config.rw_mode()
                        );
                    }
                    plan.read_only()
                }
                LoadRegion::Partitioned => plan,
            };
            Some(LoadWorkerPool::new(
                topology,
                config.worker_node(),
                &load_slices,
                plan,
                measuring_cpu(config, topology),
            ))
        };

        debug!(
            "{}: chasing {} slots of {} from offset {}, {} load workers",
            config.name(),
            slots,
            chunk,
            start,
            load_slices.len()
        );
        Ok(Latency { start, slots, pool })
    }

    fn with_load(&self) -> bool {
        self.pool.is_some()
    }

    fn run_iteration(&mut self, ctx: &IterationContext) -> Result<Measurement> {
        let timer = ctx.timer;
        let steps = ctx.passes * self.slots as u64;
        // Safety: `start` is a slot of the ring linked in `prepare`.
        let start = unsafe { ctx.region.as_ptr().add(self.start) } as *const usize;

        let chase = || {
            let t0 = timer.start();
            let end = unsafe { kernel::chase(start, steps) };
            let t1 = timer.stop();
            black_box(end);
            t1.saturating_sub(t0)
        };

        let (elapsed_ticks, load_metric, workers) = match &self.pool {
            None => (chase(), None, Vec::new()),
            Some(pool) => {
                let (ticks, reports) =
                    pool.run_alongside(ctx.region, timer, StopCondition::Flag, chase)?;
                let mbps = reports.iter().map(|r| r.mbps(timer)).sum::<f64>();
                (ticks, Some(mbps), reports.iter().map(|r| r.binding).collect())
            }
        };

        let elapsed_ns = timer.ticks_to_ns(elapsed_ticks);
        Ok(Measurement {
            elapsed_ticks,
            elapsed_ns,
            metric: elapsed_ns / steps as f64,
            load_metric,
            measurer: ctx.binding,
            workers,
        })
    }
}
