// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors that can be encountered while discovering the machine or running a
//! benchmark.

use core::fmt;

use crate::topology::Node;

/// Errors that can be encountered by interacting with the benchmark engine.
///
/// Startup failures ([`BenchError::TopologyQuery`],
/// [`BenchError::TimerUnavailable`]) are fatal for the process, everything
/// else is scoped to the benchmark instance that reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchError {
    /// The NUMA/CPU facilities of the OS could not be queried.
    TopologyQuery(String),
    /// No working tick counter for the requested backend.
    TimerUnavailable(String),
    /// Could not set up the memory region of a benchmark.
    Allocation {
        bytes: usize,
        node: Node,
        reason: String,
    },
    /// Configuration is inconsistent (zero iterations, bad stride, ...).
    InvalidConfig(String),
    /// An aggregate was requested before any iteration was recorded.
    NoData,
    /// Asked for an iteration that was never recorded.
    IterationOutOfRange { iteration: usize, recorded: usize },
    /// Asked for a load metric of a benchmark that ran without load workers.
    NoLoadWorkers,
    /// A benchmark instance executes its iterations exactly once.
    AlreadyRun,
    /// A worker thread could not be spawned or panicked.
    WorkerFailed(String),
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BenchError::TopologyQuery(why) => write!(f, "unable to query system topology: {}", why),
            BenchError::TimerUnavailable(why) => write!(f, "timer unavailable: {}", why),
            BenchError::Allocation {
                bytes,
                node,
                reason,
            } => write!(
                f,
                "unable to allocate {} bytes on NUMA node {}: {}",
                bytes, node, reason
            ),
            BenchError::InvalidConfig(why) => write!(f, "invalid benchmark configuration: {}", why),
            BenchError::NoData => write!(f, "no iterations recorded"),
            BenchError::IterationOutOfRange {
                iteration,
                recorded,
            } => write!(
                f,
                "iteration {} out of range ({} recorded)",
                iteration, recorded
            ),
            BenchError::NoLoadWorkers => write!(f, "benchmark ran without load workers"),
            BenchError::AlreadyRun => write!(f, "benchmark has already been run"),
            BenchError::WorkerFailed(why) => write!(f, "worker thread failed: {}", why),
        }
    }
}

impl std::error::Error for BenchError {}

impl From<nix::Error> for BenchError {
    fn from(e: nix::Error) -> Self {
        BenchError::TopologyQuery(e.desc().to_string())
    }
}

pub type Result<T> = core::result::Result<T, BenchError>;
