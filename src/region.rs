// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmark memory, placed on a specific NUMA node.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use log::*;
use nix::libc::{self, c_int, c_ulong, c_void};
use static_assertions::const_assert;

use crate::error::{BenchError, Result};
use crate::pattern::ChunkSize;
use crate::topology::{Node, SystemTopology};

/// `mbind(2)` policy that restricts allocations to the given nodes.
const MPOL_BIND: c_int = 2;

/// Regions are page aligned, which satisfies every chunk size.
const MIN_REGION_ALIGN: usize = 4096;
const_assert!(ChunkSize::Bits512.bytes() <= MIN_REGION_ALIGN);

/// A contiguous, anonymous mapping whose pages live on one NUMA node.
///
/// The benchmark owning the region is the only one accessing it. The
/// mapping is released when the region is dropped.
#[derive(Debug)]
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    len: usize,
    node: Node,
    node_bound: bool,
}

// The region is plain memory; threads access it through disjoint (or
// read-only) `RegionView`s handed out by the owning benchmark.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Maps `len` bytes and binds them to `node`.
    ///
    /// All pages are touched before returning so that they are backed by
    /// physical memory of the node before any measurement starts. If the
    /// kernel refuses the binding the region still works, but
    /// [`MemoryRegion::is_node_bound`] returns `false`.
    pub fn allocate(len: usize, node: Node, topology: &SystemTopology) -> Result<MemoryRegion> {
        let fail = |reason: String| BenchError::Allocation {
            bytes: len,
            node,
            reason,
        };
        if len == 0 {
            return Err(fail(String::from("empty region")));
        }
        if node >= topology.num_nodes() {
            return Err(fail(format!(
                "node out of range (machine has {} nodes)",
                topology.num_nodes()
            )));
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(fail(format!("mmap: {}", std::io::Error::last_os_error())));
        }
        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| fail(String::from("mmap returned null")))?;

        let node_bound = bind_to_node(addr, len, node);
        if !node_bound {
            warn!(
                "Can't bind {} bytes to NUMA node {}: {}; placement falls back to first touch",
                len,
                node,
                std::io::Error::last_os_error()
            );
        }

        // Fault in every page so it gets placed now, not during a timed section.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        debug!(
            "Allocated {} bytes at {:p} on node {} (bound: {})",
            len, addr, node, node_bound
        );

        Ok(MemoryRegion {
            ptr,
            len,
            node,
            node_bound,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node(&self) -> Node {
        self.node
    }

    /// Did the kernel accept the NUMA binding?
    pub fn is_node_bound(&self) -> bool {
        self.node_bound
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// `[offset, offset + len)` of this region.
    pub(crate) fn view(&self, offset: usize, len: usize) -> RegionView<'_> {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len),
            "view {}+{} exceeds region of {} bytes",
            offset,
            len,
            self.len
        );
        RegionView {
            ptr: unsafe { self.ptr.as_ptr().add(offset) },
            len,
            _region: PhantomData,
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len) };
        if rc != 0 {
            warn!(
                "munmap of {} bytes failed: {}",
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

fn bind_to_node(addr: *mut c_void, len: usize, node: Node) -> bool {
    let bits = c_ulong::BITS as usize;
    let node = node as usize;
    let mut mask: Vec<c_ulong> = vec![0; node / bits + 1];
    mask[node / bits] |= 1 << (node % bits);
    let max_node = (mask.len() * bits) as c_ulong;

    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len as c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            max_node,
            0 as c_int,
        )
    };
    rc == 0
}

/// Splits `len` bytes into `parts` equally sized pieces, each a multiple of
/// `align` bytes. Returns `(offset, len)` pairs; `None` if a piece would be
/// empty.
pub(crate) fn partition(len: usize, parts: usize, align: usize) -> Option<Vec<(usize, usize)>> {
    if parts == 0 || align == 0 {
        return None;
    }
    let part = (len / parts) / align * align;
    if part == 0 {
        return None;
    }
    Some((0..parts).map(|i| (i * part, part)).collect())
}

/// A borrowed window into a [`MemoryRegion`] that can be sent to a worker.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RegionView<'r> {
    ptr: *mut u8,
    len: usize,
    _region: PhantomData<&'r MemoryRegion>,
}

// Views are either disjoint or only read from concurrently.
unsafe impl<'r> Send for RegionView<'r> {}

impl<'r> RegionView<'r> {
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn topology() -> SystemTopology {
        SystemTopology::discover().unwrap_or_else(|_| {
            SystemTopology::flat(crate::topology::online_cpus()).expect("at least one cpu")
        })
    }

    #[test]
    fn allocate_and_touch() {
        let t = topology();
        let region = MemoryRegion::allocate(1 << 20, 0, &t).expect("can allocate 1 MiB");
        assert_eq!(region.len(), 1 << 20);
        assert_eq!(region.node(), 0);
        assert_eq!(region.as_ptr() as usize % MIN_REGION_ALIGN, 0);
        let view = region.view(0, region.len());
        let bytes = unsafe { std::slice::from_raw_parts(view.as_mut_ptr(), view.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn allocate_on_missing_node() {
        let t = topology();
        let r = MemoryRegion::allocate(4096, t.num_nodes(), &t);
        assert!(matches!(r, Err(BenchError::Allocation { .. })));
    }

    #[test]
    fn allocate_empty() {
        let t = topology();
        assert!(MemoryRegion::allocate(0, 0, &t).is_err());
    }

    #[test]
    fn partitions() {
        assert_eq!(partition(100, 1, 8), Some(vec![(0, 96)]));
        assert_eq!(partition(1024, 4, 64), Some(vec![(0, 256), (256, 256), (512, 256), (768, 256)]));
        assert_eq!(partition(1000, 3, 64), Some(vec![(0, 320), (320, 320), (640, 320)]));
        assert_eq!(partition(100, 4, 64), None);
        assert_eq!(partition(100, 0, 64), None);
    }

    #[test]
    #[should_panic(expected = "exceeds region")]
    fn view_out_of_bounds() {
        let t = topology();
        let region = MemoryRegion::allocate(4096, 0, &t).unwrap();
        let _ = region.view(4000, 200);
    }
}
