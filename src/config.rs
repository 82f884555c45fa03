// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmark configuration.

use core::num::NonZeroU64;

use serde::Serialize;

use crate::error::{BenchError, Result};
use crate::passes::PassPolicy;
use crate::pattern::{ChunkSize, Pattern, RwMode};
use crate::topology::Node;

/// Seed of random permutations unless a config asks for another one.
pub const DEFAULT_SEED: u64 = 0x6d65_6d62_656e_6368;

/// Where load workers of a latency benchmark put their traffic.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum LoadRegion {
    /// The region is split: the pointer chase runs on the first part, every
    /// worker gets a private part of its own.
    Partitioned,
    /// Every worker walks the whole region, including the chased memory.
    /// Workers are restricted to loads so the pointer chain stays intact.
    Shared,
}

impl Default for LoadRegion {
    fn default() -> Self {
        LoadRegion::Partitioned
    }
}

/// Immutable settings of one benchmark instance.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BenchmarkConfig {
    name: String,
    iterations: u32,
    passes: PassPolicy,
    worker_threads: usize,
    mem_node: Node,
    cpu_node: Node,
    worker_node: Option<Node>,
    pattern: Pattern,
    rw_mode: RwMode,
    chunk_size: ChunkSize,
    stride_bytes: i64,
    load_region: LoadRegion,
    random_seed: Option<u64>,
    boost_priority: bool,
}

impl BenchmarkConfig {
    pub fn builder(name: &str) -> ConfigBuilder {
        ConfigBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn pass_policy(&self) -> PassPolicy {
        self.passes
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Node the benchmark memory is allocated on.
    pub fn mem_node(&self) -> Node {
        self.mem_node
    }

    /// Node the measuring thread runs on.
    pub fn cpu_node(&self) -> Node {
        self.cpu_node
    }

    /// Node the load workers run on; the CPU node unless overridden.
    pub fn worker_node(&self) -> Node {
        self.worker_node.unwrap_or(self.cpu_node)
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn rw_mode(&self) -> RwMode {
        self.rw_mode
    }

    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    /// Distance between consecutive sequential accesses. Negative strides
    /// walk the region backwards.
    pub fn stride_bytes(&self) -> i64 {
        self.stride_bytes
    }

    pub fn load_region(&self) -> LoadRegion {
        self.load_region
    }

    /// `None` if permutations are drawn from OS entropy.
    pub fn random_seed(&self) -> Option<u64> {
        self.random_seed
    }

    pub fn boost_priority(&self) -> bool {
        self.boost_priority
    }
}

/// Builds a [`BenchmarkConfig`].
///
/// Defaults: one iteration, calibrated passes, no workers, everything on
/// node 0, sequential 64-bit reads with a stride of one chunk, random
/// permutations from [`DEFAULT_SEED`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: BenchmarkConfig,
    /// Resolved against the chunk size in `build`.
    stride_bytes: Option<i64>,
}

impl ConfigBuilder {
    fn new(name: &str) -> ConfigBuilder {
        ConfigBuilder {
            config: BenchmarkConfig {
                name: String::from(name),
                iterations: 1,
                passes: PassPolicy::default(),
                worker_threads: 0,
                mem_node: 0,
                cpu_node: 0,
                worker_node: None,
                pattern: Pattern::Sequential,
                rw_mode: RwMode::Read,
                chunk_size: ChunkSize::Bits64,
                stride_bytes: ChunkSize::Bits64.bytes() as i64,
                load_region: LoadRegion::default(),
                random_seed: Some(DEFAULT_SEED),
                boost_priority: false,
            },
            stride_bytes: None,
        }
    }

    pub fn iterations(&mut self, n: u32) -> &mut Self {
        self.config.iterations = n;
        self
    }

    /// Run exactly `n` passes per iteration.
    pub fn passes(&mut self, n: NonZeroU64) -> &mut Self {
        self.config.passes = PassPolicy::Fixed(n);
        self
    }

    pub fn pass_policy(&mut self, policy: PassPolicy) -> &mut Self {
        self.config.passes = policy;
        self
    }

    pub fn worker_threads(&mut self, n: usize) -> &mut Self {
        self.config.worker_threads = n;
        self
    }

    pub fn mem_node(&mut self, node: Node) -> &mut Self {
        self.config.mem_node = node;
        self
    }

    pub fn cpu_node(&mut self, node: Node) -> &mut Self {
        self.config.cpu_node = node;
        self
    }

    pub fn worker_node(&mut self, node: Node) -> &mut Self {
        self.config.worker_node = Some(node);
        self
    }

    pub fn pattern(&mut self, pattern: Pattern) -> &mut Self {
        self.config.pattern = pattern;
        self
    }

    pub fn rw_mode(&mut self, rw: RwMode) -> &mut Self {
        self.config.rw_mode = rw;
        self
    }

    pub fn chunk_size(&mut self, chunk: ChunkSize) -> &mut Self {
        self.config.chunk_size = chunk;
        self
    }

    /// Defaults to one chunk, whatever the chunk size ends up being.
    pub fn stride_bytes(&mut self, stride: i64) -> &mut Self {
        self.stride_bytes = Some(stride);
        self
    }

    pub fn load_region(&mut self, mode: LoadRegion) -> &mut Self {
        self.config.load_region = mode;
        self
    }

    /// Seed for random permutations.
    pub fn random_seed(&mut self, seed: u64) -> &mut Self {
        self.config.random_seed = Some(seed);
        self
    }

    /// Draw random permutations from OS entropy, so every run differs.
    pub fn randomize(&mut self) -> &mut Self {
        self.config.random_seed = None;
        self
    }

    /// Run timed sections at the highest scheduling priority (if permitted).
    pub fn boost_priority(&mut self, boost: bool) -> &mut Self {
        self.config.boost_priority = boost;
        self
    }

    /// Checks the settings and returns the finished configuration.
    pub fn build(&self) -> Result<BenchmarkConfig> {
        let mut c = self.config.clone();
        c.stride_bytes = self
            .stride_bytes
            .unwrap_or(c.chunk_size.bytes() as i64);
        if c.iterations == 0 {
            return Err(BenchError::InvalidConfig(String::from(
                "at least one iteration is required",
            )));
        }
        if c.stride_bytes == 0 {
            return Err(BenchError::InvalidConfig(String::from("stride must not be zero")));
        }
        if c.stride_bytes % c.chunk_size.bytes() as i64 != 0 {
            return Err(BenchError::InvalidConfig(format!(
                "stride of {} bytes is not a multiple of the {} chunk",
                c.stride_bytes, c.chunk_size
            )));
        }
        Ok(c)
    }
}
