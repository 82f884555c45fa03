// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The memory access loops that are timed.
//!
//! All accesses go through `read_volatile`/`write_volatile` so the compiler
//! can neither drop nor merge them. Loaded values are folded into a sink that
//! the caller hands to [`core::hint::black_box`] after the timed section.

use core::mem::size_of;
use core::ptr;
use std::sync::Arc;

use rand::Rng;
use static_assertions::const_assert_eq;

use crate::pattern::{random_order, strided_slot, ChunkSize, Pattern, RwMode};

/// One memory operation of a given width.
pub(crate) trait Word: Copy + Send + 'static {
    const CHUNK: ChunkSize;

    /// A value to store, derived from a counter.
    fn fill(seed: u64) -> Self;

    /// Mixes the loaded value into `acc`.
    fn fold(self, acc: u64) -> u64;
}

#[derive(Debug, Copy, Clone)]
#[repr(C, align(16))]
pub(crate) struct W128([u64; 2]);

#[derive(Debug, Copy, Clone)]
#[repr(C, align(32))]
pub(crate) struct W256([u64; 4]);

#[derive(Debug, Copy, Clone)]
#[repr(C, align(64))]
pub(crate) struct W512([u64; 8]);

const_assert_eq!(size_of::<W128>(), 16);
const_assert_eq!(size_of::<W256>(), 32);
const_assert_eq!(size_of::<W512>(), 64);

impl Word for u32 {
    const CHUNK: ChunkSize = ChunkSize::Bits32;

    #[inline(always)]
    fn fill(seed: u64) -> Self {
        seed as u32
    }

    #[inline(always)]
    fn fold(self, acc: u64) -> u64 {
        acc ^ self as u64
    }
}

impl Word for u64 {
    const CHUNK: ChunkSize = ChunkSize::Bits64;

    #[inline(always)]
    fn fill(seed: u64) -> Self {
        seed
    }

    #[inline(always)]
    fn fold(self, acc: u64) -> u64 {
        acc ^ self
    }
}

macro_rules! wide_word {
    ($ty:ident, $chunk:expr, $lanes:expr) => {
        impl Word for $ty {
            const CHUNK: ChunkSize = $chunk;

            #[inline(always)]
            fn fill(seed: u64) -> Self {
                $ty([seed; $lanes])
            }

            #[inline(always)]
            fn fold(self, acc: u64) -> u64 {
                self.0.iter().fold(acc, |a, w| a ^ w)
            }
        }
    };
}

wide_word!(W128, ChunkSize::Bits128, 2);
wide_word!(W256, ChunkSize::Bits256, 4);
wide_word!(W512, ChunkSize::Bits512, 8);

/// Visits `slots` words starting at `base` in strided order (see
/// [`crate::pattern::sequential_order`]); `stride` is in words.
///
/// # Safety
/// `base` must be aligned for `W` and valid for `slots` words.
#[inline(never)]
pub(crate) unsafe fn strided_pass<W: Word>(
    base: *mut u8,
    slots: usize,
    stride: isize,
    rw: RwMode,
    sink: &mut u64,
) {
    let words = base as *mut W;
    let k = stride.unsigned_abs();
    let mut acc = *sink;
    let mut nth = 0;
    for start in 0..k.min(slots) {
        let mut j = start;
        while j < slots {
            let at = words.add(strided_slot(slots, stride, j));
            if rw.is_write(nth) {
                ptr::write_volatile(at, W::fill(nth as u64));
            } else {
                acc = ptr::read_volatile(at).fold(acc);
            }
            nth += 1;
            j += k;
        }
    }
    *sink = acc;
}

/// Visits the words at `base` in the given `order`.
///
/// # Safety
/// `base` must be aligned for `W` and every index in `order` must be in
/// bounds of the memory behind it.
#[inline(never)]
pub(crate) unsafe fn permuted_pass<W: Word>(
    base: *mut u8,
    order: &[usize],
    rw: RwMode,
    sink: &mut u64,
) {
    let words = base as *mut W;
    let mut acc = *sink;
    for (nth, &slot) in order.iter().enumerate() {
        let at = words.add(slot);
        if rw.is_write(nth) {
            ptr::write_volatile(at, W::fill(nth as u64));
        } else {
            acc = ptr::read_volatile(at).fold(acc);
        }
    }
    *sink = acc;
}

/// Writes a ring of absolute pointers into the slots of `base`: the slot at
/// `order[i]` points to the slot at `order[i + 1]`, the last one back to the
/// first. Returns the address of the first slot of the ring.
///
/// # Safety
/// `slot_bytes` must be at least `size_of::<usize>()` and a multiple of its
/// alignment, `base` aligned for `usize` and valid for
/// `order.len() * slot_bytes` bytes.
pub(crate) unsafe fn link_chain(base: *mut u8, slot_bytes: usize, order: &[usize]) -> *const usize {
    debug_assert!(slot_bytes >= size_of::<usize>());
    let slot = |i: usize| base.add(i * slot_bytes) as *mut usize;
    for (i, &from) in order.iter().enumerate() {
        let to = order[(i + 1) % order.len()];
        ptr::write_volatile(slot(from), slot(to) as usize);
    }
    slot(order[0])
}

/// Follows `steps` links of a ring built by [`link_chain`], starting at
/// `start`. Every load's address is the value of the previous load.
///
/// # Safety
/// `start` must be part of a ring created by [`link_chain`] whose memory is
/// still alive.
#[inline(never)]
pub(crate) unsafe fn chase(start: *const usize, steps: u64) -> *const usize {
    let mut p = start;
    let mut left = steps;
    while left >= 8 {
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        p = ptr::read_volatile(p) as *const usize;
        left -= 8;
    }
    while left > 0 {
        p = ptr::read_volatile(p) as *const usize;
        left -= 1;
    }
    p
}

/// How a pass walks the slots of its memory.
#[derive(Debug, Clone)]
pub(crate) enum Traversal {
    /// Address order, `stride` words apart; negative walks backwards.
    Strided(isize),
    /// A fixed permutation of slot indices, shared by all threads of a run.
    Permuted(Arc<[usize]>),
}

/// Everything a thread needs to run throughput passes over its memory.
#[derive(Debug, Clone)]
pub(crate) struct AccessPlan {
    pub(crate) chunk: ChunkSize,
    pub(crate) rw: RwMode,
    pub(crate) traversal: Traversal,
}

impl AccessPlan {
    /// Plan for memory of `slots` chunks. Random permutations are drawn
    /// from `rng`.
    pub(crate) fn new<R: Rng + ?Sized>(
        pattern: Pattern,
        chunk: ChunkSize,
        rw: RwMode,
        stride_bytes: i64,
        slots: usize,
        rng: &mut R,
    ) -> AccessPlan {
        let traversal = match pattern {
            Pattern::Sequential => Traversal::Strided((stride_bytes / chunk.bytes() as i64) as isize),
            Pattern::Random => Traversal::Permuted(random_order(slots, rng).into()),
        };
        AccessPlan {
            chunk,
            rw,
            traversal,
        }
    }

    /// The same plan, but only issuing loads.
    pub(crate) fn read_only(&self) -> AccessPlan {
        AccessPlan {
            rw: RwMode::Read,
            ..self.clone()
        }
    }

    /// Runs one pass over `len` bytes at `base`.
    ///
    /// # Safety
    /// `base` must be aligned to the chunk size and valid for `len` bytes.
    /// A permuted plan must have been created for `len / chunk` slots.
    pub(crate) unsafe fn pass(&self, base: *mut u8, len: usize, sink: &mut u64) {
        match self.chunk {
            ChunkSize::Bits32 => self.pass_words::<u32>(base, len, sink),
            ChunkSize::Bits64 => self.pass_words::<u64>(base, len, sink),
            ChunkSize::Bits128 => self.pass_words::<W128>(base, len, sink),
            ChunkSize::Bits256 => self.pass_words::<W256>(base, len, sink),
            ChunkSize::Bits512 => self.pass_words::<W512>(base, len, sink),
        }
    }

    #[inline(always)]
    unsafe fn pass_words<W: Word>(&self, base: *mut u8, len: usize, sink: &mut u64) {
        let slots = len / W::CHUNK.bytes();
        match &self.traversal {
            Traversal::Strided(stride) => strided_pass::<W>(base, slots, *stride, self.rw, sink),
            Traversal::Permuted(order) => {
                debug_assert_eq!(order.len(), slots);
                permuted_pass::<W>(base, order, self.rw, sink)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pattern::{random_order, sequential_order};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn strided_writes_every_word() {
        let mut buf = vec![0u64; 64];
        let mut sink = 0;
        for stride in [1, 3, -1, -7] {
            buf.iter_mut().for_each(|w| *w = 0);
            unsafe { strided_pass::<u64>(buf.as_mut_ptr() as *mut u8, 64, stride, RwMode::Write, &mut sink) };
            // Values are the access counter, so they reveal the order.
            let order = sequential_order(64, stride);
            for (nth, slot) in order.into_iter().enumerate() {
                assert_eq!(buf[slot], nth as u64, "stride {}", stride);
            }
        }
    }

    #[test]
    fn strided_reads_fold_everything() {
        let mut buf: Vec<u32> = (1..=16).collect();
        let mut sink = 0;
        unsafe { strided_pass::<u32>(buf.as_mut_ptr() as *mut u8, 16, 4, RwMode::Read, &mut sink) };
        let expected = (1..=16u64).fold(0, |a, w| a ^ w);
        assert_eq!(sink, expected);
    }

    #[test]
    fn permuted_mixed() {
        let mut buf = vec![W128([0; 2]); 8];
        let order = [3, 1, 7, 0, 2, 6, 4, 5];
        let mut sink = 0;
        unsafe { permuted_pass::<W128>(buf.as_mut_ptr() as *mut u8, &order, RwMode::Mixed, &mut sink) };
        for (nth, &slot) in order.iter().enumerate() {
            let expected = if nth % 2 == 1 { nth as u64 } else { 0 };
            assert_eq!(buf[slot].0, [expected; 2]);
        }
    }

    #[test]
    fn chase_follows_the_ring() {
        let slots = 256;
        let slot_bytes = 64;
        let mut buf = vec![W512([0; 8]); slots];
        let base = buf.as_mut_ptr() as *mut u8;
        let order = random_order(slots, &mut SmallRng::seed_from_u64(3));
        let start = unsafe { link_chain(base, slot_bytes, &order) };
        assert_eq!(start as usize, base as usize + order[0] * slot_bytes);

        let one = unsafe { chase(start, 1) };
        assert_eq!(one as usize, base as usize + order[1] * slot_bytes);
        let eleven = unsafe { chase(start, 11) };
        assert_eq!(eleven as usize, base as usize + order[11] * slot_bytes);
        // A full lap ends where it started.
        let lap = unsafe { chase(start, slots as u64 * 3) };
        assert_eq!(lap, start);
    }

    #[test]
    fn plan_dispatches_on_chunk() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut buf = vec![W256([0; 4]); 32];
        let len = buf.len() * 32;
        let plan = AccessPlan::new(Pattern::Random, ChunkSize::Bits256, RwMode::Write, 32, 32, &mut rng);
        let mut sink = 0;
        unsafe { plan.pass(buf.as_mut_ptr() as *mut u8, len, &mut sink) };
        // Every slot got written, the first with counter 0.
        let written = buf.iter().filter(|w| w.0[0] != 0).count();
        assert_eq!(written, 31);

        let plan = AccessPlan::new(Pattern::Sequential, ChunkSize::Bits64, RwMode::Mixed, -16, 0, &mut rng);
        assert!(matches!(plan.traversal, Traversal::Strided(-2)));
        assert_eq!(plan.read_only().rw, RwMode::Read);
    }
}
