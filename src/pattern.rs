// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Access patterns over a memory region.
//!
//! A region is viewed as an array of equally sized, chunk-aligned slots.
//! A pass visits every slot exactly once, either in (strided) address order
//! or in a pseudo-random order.

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

/// Order in which the slots of a region are visited.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum Pattern {
    Sequential,
    Random,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Pattern::Sequential => write!(f, "sequential"),
            Pattern::Random => write!(f, "random"),
        }
    }
}

/// Kind of memory operation issued per slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum RwMode {
    Read,
    Write,
    /// Alternates between reads and writes, starting with a read.
    Mixed,
}

impl RwMode {
    /// Is the `nth` access of a pass a store?
    #[inline(always)]
    pub fn is_write(self, nth: usize) -> bool {
        match self {
            RwMode::Read => false,
            RwMode::Write => true,
            RwMode::Mixed => nth & 1 == 1,
        }
    }
}

impl fmt::Display for RwMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RwMode::Read => write!(f, "read"),
            RwMode::Write => write!(f, "write"),
            RwMode::Mixed => write!(f, "read/write"),
        }
    }
}

/// Width of a single memory operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum ChunkSize {
    Bits32,
    Bits64,
    Bits128,
    Bits256,
    Bits512,
}

impl ChunkSize {
    pub const ALL: [ChunkSize; 5] = [
        ChunkSize::Bits32,
        ChunkSize::Bits64,
        ChunkSize::Bits128,
        ChunkSize::Bits256,
        ChunkSize::Bits512,
    ];

    pub fn from_bits(bits: u32) -> Option<ChunkSize> {
        ChunkSize::ALL.iter().copied().find(|c| c.bits() == bits)
    }

    pub const fn bits(self) -> u32 {
        match self {
            ChunkSize::Bits32 => 32,
            ChunkSize::Bits64 => 64,
            ChunkSize::Bits128 => 128,
            ChunkSize::Bits256 => 256,
            ChunkSize::Bits512 => 512,
        }
    }

    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }
}

impl fmt::Display for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Maps forward position `j` to a slot: unchanged for a positive `stride`,
/// mirrored from the end of the region (`slots - 1 - j`) for a negative one.
#[inline(always)]
pub(crate) fn strided_slot(slots: usize, stride: isize, j: usize) -> usize {
    if stride > 0 {
        j
    } else {
        slots - 1 - j
    }
}

/// The visiting order of a strided walk over `slots` slots.
///
/// A stride of `k` walks `0, k, 2k, ...`, then `1, k+1, ...` and so on, so
/// the pass still covers every slot once. Negative strides walk the same way
/// from the end of the region.
pub fn sequential_order(slots: usize, stride: isize) -> Vec<usize> {
    assert!(stride != 0, "stride must not be zero");
    let k = stride.unsigned_abs();
    let mut order = Vec::with_capacity(slots);
    for start in 0..k.min(slots) {
        let mut j = start;
        while j < slots {
            order.push(strided_slot(slots, stride, j));
            j += k;
        }
    }
    order
}

/// A uniformly random permutation of `0..slots`.
pub fn random_order<R: Rng + ?Sized>(slots: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..slots).collect();
    order.shuffle(rng);
    order
}

/// Turns a visiting order into a successor table.
///
/// `next[order[i]] == order[i + 1]` and the last slot links back to the
/// first, so following `next` from any slot walks one cycle through all
/// slots of `order`.
pub fn successor_table(order: &[usize]) -> Vec<usize> {
    let mut next = vec![0; order.len()];
    for (i, &slot) in order.iter().enumerate() {
        next[slot] = order[(i + 1) % order.len()];
    }
    next
}
