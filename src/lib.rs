// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A benchmark engine for memory latency and throughput on NUMA machines.
//!
//! The engine places a memory region on one NUMA node, pins the measuring
//! thread to a CPU of (possibly another) node and times access patterns over
//! the region: a dependent pointer chase for latency, optionally with load
//! workers streaming through memory at the same time, or independent
//! streaming accesses from one or more threads for throughput.
//!
//! # How does it work
//! Discover the machine once, calibrate a timer once, then run as many
//! benchmark instances as needed against them:
//!
//! ```no_run
//! use numa_membench::{BenchmarkConfig, LatencyBenchmark, SystemTopology, Timer, TimerBackend};
//! use numa_membench::{ChunkSize, Pattern};
//!
//! let topology = SystemTopology::discover().expect("NUMA topology");
//! let timer = Timer::new(TimerBackend::default()).expect("working timer");
//!
//! let config = BenchmarkConfig::builder("remote-random")
//!     .iterations(5)
//!     .mem_node(1)
//!     .cpu_node(0)
//!     .pattern(Pattern::Random)
//!     .chunk_size(ChunkSize::Bits64)
//!     .worker_threads(3)
//!     .build()
//!     .expect("valid config");
//!
//! let mut bench = LatencyBenchmark::new(config, 64 << 20, &topology, &timer).unwrap();
//! bench.run().unwrap();
//! let agg = bench.finalize().unwrap();
//! println!("{:.1} {} under {:.0} MB/s load", agg.mean, agg.unit, bench.avg_load_metric().unwrap());
//! ```

pub mod affinity;
pub mod benchmark;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod load;
pub mod passes;
pub mod pattern;
pub mod power;
pub mod region;
pub mod results;
pub mod timer;
pub mod topology;

mod kernel;

pub use crate::benchmark::{
    Benchmark, BenchmarkState, Latency, LatencyBenchmark, Throughput, ThroughputBenchmark, Workload,
};
pub use crate::config::{BenchmarkConfig, ConfigBuilder, LoadRegion, DEFAULT_SEED};
pub use crate::error::{BenchError, Result};
pub use crate::passes::{compute_passes, PassCurve, PassPolicy};
pub use crate::pattern::{ChunkSize, Pattern, RwMode};
pub use crate::power::{PowerReader, PowerSample};
pub use crate::region::MemoryRegion;
pub use crate::results::{Aggregate, Binding, IterationResult, MetricUnit, ResultSet};
pub use crate::timer::{Timer, TimerBackend};
pub use crate::topology::{Cpu, Node, SystemTopology};
