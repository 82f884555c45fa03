// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Discovers the NUMA and CPU layout of the machine.
//!
//! The topology is queried once at startup (see [`SystemTopology::discover`])
//! and then handed by reference to everything that needs to place threads or
//! memory. It is never mutated afterwards.
//!
//! On Linux the information comes from sysfs (`/sys/devices/system/{node,cpu}`)
//! and procfs (`/proc/cpuinfo`, `/proc/meminfo`). The parsers for those files
//! are exposed so they can be fed with captured output.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use log::*;
use nix::unistd::{sysconf, SysconfVar};
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, space0};
use nom::combinator::{all_consuming, map_res, opt};
use nom::multi::separated_list1;
use nom::sequence::{preceded, tuple};
use nom::IResult;
use serde::Serialize;

use crate::error::{BenchError, Result};

pub type Node = u32;
pub type Cpu = usize;

/// Used if `sysconf` can't tell us the page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

fn number(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

/// `a` or `a-b`
fn cpu_range(input: &str) -> IResult<&str, (usize, usize)> {
    let (input, first) = number(input)?;
    let (input, last) = opt(preceded(char('-'), number))(input)?;
    Ok((input, (first, last.unwrap_or(first))))
}

/// `key<ws>:<ws>value` as found in `/proc/cpuinfo` and `/proc/meminfo`.
fn keyed_number<'a>(key: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, usize> {
    preceded(tuple((tag(key), space0, char(':'), space0)), number)
}

/// Parses a kernel cpu list (e.g., `0-3,8,10-11`) into sorted, unique ids.
///
/// The same format is used for CPU lists and NUMA node lists. An empty
/// string is an empty list (memory-only nodes have no CPUs).
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>> {
    let list = list.trim();
    if list.is_empty() {
        return Ok(Vec::new());
    }

    let ranges = match all_consuming(separated_list1(char(','), cpu_range))(list) {
        Ok((_, ranges)) => ranges,
        Err(e) => {
            return Err(BenchError::TopologyQuery(format!(
                "malformed cpu list {:?}: {:?}",
                list, e
            )))
        }
    };

    let mut ids = Vec::new();
    for (first, last) in ranges {
        if last < first {
            return Err(BenchError::TopologyQuery(format!(
                "descending range {}-{} in cpu list",
                first, last
            )));
        }
        ids.extend(first..=last);
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// The package and core identifiers reported in `/proc/cpuinfo`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    package_ids: BTreeSet<usize>,
    core_ids: BTreeSet<usize>,
    processors: usize,
}

impl CpuInfo {
    pub fn parse(cpuinfo: &str) -> CpuInfo {
        let mut info = CpuInfo::default();
        for line in cpuinfo.lines() {
            if let Ok((_, id)) = keyed_number("physical id")(line) {
                info.package_ids.insert(id);
            } else if let Ok((_, id)) = keyed_number("core id")(line) {
                info.core_ids.insert(id);
            } else if keyed_number("processor")(line).is_ok() {
                info.processors += 1;
            }
        }
        info
    }

    /// Number of distinct physical packages (sockets).
    pub fn packages(&self) -> usize {
        self.package_ids.len()
    }

    /// Number of physical cores.
    ///
    /// Core ids are only unique within a package, so this is
    /// `unique core ids * packages`. That is a heuristic: it assumes every
    /// package has the same number of cores with the same numbering.
    pub fn physical_cores(&self) -> usize {
        self.core_ids.len() * self.packages().max(1)
    }

    /// Number of `processor` entries (logical CPUs) seen.
    pub fn processors(&self) -> usize {
        self.processors
    }
}

/// Extracts `Hugepagesize` (in bytes) from `/proc/meminfo`.
pub fn parse_huge_page_size(meminfo: &str) -> Option<usize> {
    meminfo.lines().find_map(|line| {
        let (rest, kb) = keyed_number("Hugepagesize")(line).ok()?;
        match rest.trim() {
            "kB" => Some(kb * 1024),
            _ => None,
        }
    })
}

fn read_sysfs(root: &Path, file: &str) -> Result<String> {
    let path = root.join(file);
    fs::read_to_string(&path)
        .map_err(|e| BenchError::TopologyQuery(format!("can't read {}: {}", path.display(), e)))
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Counts distinct data/unified caches per level (L1..L4).
///
/// Two CPUs share a cache if they report the same `shared_cpu_list` for the
/// same level. Returns `None` if the kernel does not export cache info.
fn count_caches(root: &Path, cpus: &[Cpu]) -> Option<[u32; 4]> {
    let mut seen: BTreeSet<(u32, String)> = BTreeSet::new();

    for cpu in cpus {
        let dir = root.join(format!("sys/devices/system/cpu/cpu{}/cache", cpu));
        for index in 0usize.. {
            let idx = dir.join(format!("index{}", index));
            if !idx.is_dir() {
                break;
            }
            let level = read_trimmed(&idx.join("level")).and_then(|l| l.parse::<u32>().ok());
            let kind = read_trimmed(&idx.join("type"));
            let shared = read_trimmed(&idx.join("shared_cpu_list"));
            if let (Some(level), Some(kind), Some(shared)) = (level, kind, shared) {
                if kind != "Instruction" && (1..=4).contains(&level) {
                    seen.insert((level, shared));
                }
            }
        }
    }

    if seen.is_empty() {
        return None;
    }
    let mut counts = [0u32; 4];
    for (level, _) in seen {
        counts[(level - 1) as usize] += 1;
    }
    Some(counts)
}

/// Returns the ids of all online logical CPUs.
///
/// Falls back to `0..sysconf(_SC_NPROCESSORS_ONLN)` if sysfs is not there.
pub fn online_cpus() -> Vec<Cpu> {
    match read_sysfs(Path::new("/"), "sys/devices/system/cpu/online").and_then(|s| parse_cpulist(&s)) {
        Ok(cpus) if !cpus.is_empty() => cpus,
        _ => sysconf_cpus(),
    }
}

/// `0..n` for the online CPU count reported by `sysconf`, at least one CPU.
fn sysconf_cpus() -> Vec<Cpu> {
    let n = match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
        Ok(Some(n)) if n > 0 => n as usize,
        _ => 1,
    };
    (0..n).collect()
}

fn regular_page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// NUMA and CPU layout of the machine.
///
/// All counts are at least one (except the L4 cache count, most machines
/// don't have one). Node `n` owns the CPUs in `cpus_on_node(n)`, sorted in
/// ascending order, so a (node, rank) pair always resolves to the same CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemTopology {
    node_cpus: Vec<Vec<Cpu>>,
    online_cpus: Vec<Cpu>,
    num_packages: u32,
    num_physical_cpus: u32,
    caches: [u32; 4],
    page_size: usize,
    large_page_size: usize,
}

impl SystemTopology {
    /// Queries the running system.
    pub fn discover() -> Result<SystemTopology> {
        let topology = SystemTopology::from_root(Path::new("/"))?;
        info!(
            "Discovered {} NUMA node(s), {} package(s), {}/{} physical/logical CPUs, L1-L4 caches {:?}, pages {}/{} B",
            topology.num_nodes(),
            topology.num_packages(),
            topology.num_physical_cpus(),
            topology.num_logical_cpus(),
            topology.caches,
            topology.page_size(),
            topology.large_page_size(),
        );
        Ok(topology)
    }

    /// Reads sysfs/procfs relative to `root` instead of `/`.
    pub fn from_root(root: &Path) -> Result<SystemTopology> {
        let nodes = read_sysfs(root, "sys/devices/system/node/online").map_err(|e| {
            BenchError::TopologyQuery(format!("NUMA facility not available ({})", e))
        })?;
        let nodes = parse_cpulist(&nodes)?;
        let max_node = *nodes
            .last()
            .ok_or_else(|| BenchError::TopologyQuery(String::from("no online NUMA node")))?;

        let mut node_cpus = vec![Vec::new(); max_node + 1];
        for node in nodes {
            let list = read_sysfs(root, &format!("sys/devices/system/node/node{}/cpulist", node))?;
            node_cpus[node] = parse_cpulist(&list)?;
            trace!("cpus for node={} are {:?}", node, node_cpus[node]);
        }

        let online = match read_sysfs(root, "sys/devices/system/cpu/online") {
            Ok(list) => parse_cpulist(&list)?,
            Err(_) => {
                let mut all: Vec<Cpu> = node_cpus.iter().flatten().copied().collect();
                all.sort_unstable();
                all
            }
        };

        let cpuinfo = fs::read_to_string(root.join("proc/cpuinfo"))
            .map(|s| CpuInfo::parse(&s))
            .unwrap_or_default();
        let caches = count_caches(root, &online);
        let page_size = regular_page_size();
        let large_page_size = fs::read_to_string(root.join("proc/meminfo"))
            .ok()
            .and_then(|s| parse_huge_page_size(&s))
            .unwrap_or(page_size);

        SystemTopology::assemble(node_cpus, online, &cpuinfo, caches, page_size, large_page_size)
    }

    /// A single-node topology over `cpus`, for machines without NUMA support.
    pub fn flat(cpus: Vec<Cpu>) -> Result<SystemTopology> {
        let page_size = regular_page_size();
        SystemTopology::assemble(
            vec![cpus.clone()],
            cpus,
            &CpuInfo::default(),
            None,
            page_size,
            page_size,
        )
    }

    pub(crate) fn assemble(
        node_cpus: Vec<Vec<Cpu>>,
        mut online_cpus: Vec<Cpu>,
        cpuinfo: &CpuInfo,
        caches: Option<[u32; 4]>,
        page_size: usize,
        large_page_size: usize,
    ) -> Result<SystemTopology> {
        if node_cpus.is_empty() || node_cpus.iter().all(|cpus| cpus.is_empty()) {
            return Err(BenchError::TopologyQuery(String::from(
                "no NUMA node with CPUs",
            )));
        }
        online_cpus.sort_unstable();
        online_cpus.dedup();
        if online_cpus.is_empty() {
            return Err(BenchError::TopologyQuery(String::from("no online CPUs")));
        }

        let logical = online_cpus.len();
        let num_packages = cpuinfo.packages().max(1);
        let num_physical_cpus = match cpuinfo.physical_cores() {
            0 => logical,
            n => n.min(logical),
        };
        let caches = caches.unwrap_or_else(|| {
            debug!("No cache information exported, guessing cache counts");
            [
                num_physical_cpus as u32,
                num_physical_cpus as u32,
                num_packages as u32,
                0,
            ]
        });

        Ok(SystemTopology {
            node_cpus,
            online_cpus,
            num_packages: num_packages as u32,
            num_physical_cpus: num_physical_cpus as u32,
            caches,
            page_size: page_size.max(1),
            large_page_size: large_page_size.max(page_size).max(1),
        })
    }

    pub fn num_nodes(&self) -> u32 {
        self.node_cpus.len() as u32
    }

    pub fn num_packages(&self) -> u32 {
        self.num_packages
    }

    pub fn num_physical_cpus(&self) -> u32 {
        self.num_physical_cpus
    }

    pub fn num_logical_cpus(&self) -> u32 {
        self.online_cpus.len() as u32
    }

    /// Number of caches at `level` (1 to 4).
    pub fn caches(&self, level: usize) -> Option<u32> {
        match level {
            1..=4 => Some(self.caches[level - 1]),
            _ => None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn large_page_size(&self) -> usize {
        self.large_page_size
    }

    pub fn online_cpus(&self) -> &[Cpu] {
        &self.online_cpus
    }

    /// CPUs of `node` in ascending order (empty for unknown or CPU-less nodes).
    pub fn cpus_on_node(&self, node: Node) -> &[Cpu] {
        self.node_cpus
            .get(node as usize)
            .map(|cpus| cpus.as_slice())
            .unwrap_or(&[])
    }

    /// The `rank`-th CPU of `node`, `None` if the node has fewer CPUs.
    pub fn cpu_id_for_node_rank(&self, node: Node, rank: usize) -> Option<Cpu> {
        self.cpus_on_node(node).get(rank).copied()
    }

    pub fn node_of_cpu(&self, cpu: Cpu) -> Option<Node> {
        self.node_cpus
            .iter()
            .position(|cpus| cpus.binary_search(&cpu).is_ok())
            .map(|n| n as Node)
    }
}
