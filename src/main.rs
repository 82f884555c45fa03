// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command line driver for the benchmark engine.

use std::num::NonZeroU64;
use std::path::Path;
use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use log::*;

use numa_membench::diagnostics;
use numa_membench::{
    Benchmark, BenchmarkConfig, ChunkSize, LatencyBenchmark, LoadRegion, Node, PassCurve,
    PassPolicy, Pattern, RwMode, SystemTopology, ThroughputBenchmark, Timer, TimerBackend,
    Workload,
};

fn main() {
    env_logger::init();

    let matches = App::new("NUMA memory benchmark")
        .version(crate_version!())
        .about("Measures loaded/unloaded memory latency and throughput across NUMA nodes")
        .arg(
            Arg::with_name("self-test")
                .long("self-test")
                .help("Check topology discovery, timer calibration and thread pinning, then exit"),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .takes_value(true)
                .possible_values(&["latency", "throughput"])
                .default_value("latency")
                .help("What to measure"),
        )
        .arg(
            Arg::with_name("size")
                .short("s")
                .long("size")
                .takes_value(true)
                .value_name("KB")
                .default_value("262144")
                .help("Working set size in KiB"),
        )
        .arg(
            Arg::with_name("iterations")
                .short("i")
                .long("iterations")
                .takes_value(true)
                .default_value("5"),
        )
        .arg(
            Arg::with_name("threads")
                .short("j")
                .long("threads")
                .takes_value(true)
                .default_value("0")
                .help("Load workers (latency) or streaming threads (throughput)"),
        )
        .arg(
            Arg::with_name("mem-node")
                .short("m")
                .long("mem-node")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("cpu-node")
                .short("c")
                .long("cpu-node")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("worker-node")
                .long("worker-node")
                .takes_value(true)
                .help("Node of the load workers (defaults to the cpu node)"),
        )
        .arg(
            Arg::with_name("matrix")
                .long("matrix")
                .help("Run every (cpu node, memory node) combination"),
        )
        .arg(
            Arg::with_name("pattern")
                .short("p")
                .long("pattern")
                .takes_value(true)
                .possible_values(&["sequential", "random"])
                .default_value("random"),
        )
        .arg(
            Arg::with_name("rw")
                .long("rw")
                .takes_value(true)
                .possible_values(&["read", "write", "mixed"])
                .default_value("read"),
        )
        .arg(
            Arg::with_name("chunk")
                .long("chunk")
                .takes_value(true)
                .possible_values(&["32", "64", "128", "256", "512"])
                .default_value("64")
                .help("Access width in bits"),
        )
        .arg(
            Arg::with_name("stride")
                .long("stride")
                .takes_value(true)
                .allow_hyphen_values(true)
                .help("Stride in bytes for sequential patterns (negative walks backwards)"),
        )
        .arg(
            Arg::with_name("passes")
                .long("passes")
                .takes_value(true)
                .help("Fixed passes per iteration instead of calibrating them"),
        )
        .arg(
            Arg::with_name("curve")
                .long("curve")
                .takes_value(true)
                .possible_values(&["inverse", "inverse-square"])
                .default_value("inverse"),
        )
        .arg(
            Arg::with_name("shared-load")
                .long("shared-load")
                .help("Load workers share the chased memory instead of using own partitions"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .help("Seed of random permutations (a fixed default otherwise)"),
        )
        .arg(
            Arg::with_name("random-seed")
                .long("random-seed")
                .conflicts_with("seed")
                .help("Draw random permutations from OS entropy, so runs differ"),
        )
        .arg(
            Arg::with_name("boost")
                .long("boost")
                .help("Raise scheduling priority during timed sections"),
        )
        .arg(
            Arg::with_name("timer")
                .long("timer")
                .takes_value(true)
                .possible_values(&["cycle", "os"]),
        )
        .arg(
            Arg::with_name("csv")
                .long("csv")
                .takes_value(true)
                .value_name("FILE")
                .help("Append per-iteration results to FILE"),
        )
        .get_matches();

    let backend = match matches.value_of("timer") {
        Some("cycle") => TimerBackend::CycleCounter,
        Some("os") => TimerBackend::OsCounter,
        _ => TimerBackend::default(),
    };

    if matches.is_present("self-test") {
        process::exit(if self_test(backend) { 0 } else { 1 });
    }

    let topology = SystemTopology::discover().unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });
    let timer = Timer::new(backend).unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });

    let size_kb = value_t!(matches, "size", usize).unwrap_or_else(|e| e.exit());
    let size_bytes = kib_to_bytes(size_kb).unwrap_or_else(|| {
        error!("--size {} KiB does not fit the address space", size_kb);
        process::exit(1);
    });
    let cpu_node = value_t!(matches, "cpu-node", Node).unwrap_or_else(|e| e.exit());
    let mem_node = value_t!(matches, "mem-node", Node).unwrap_or_else(|e| e.exit());
    let placements: Vec<(Node, Node)> = if matches.is_present("matrix") {
        let n = topology.num_nodes();
        (0..n).flat_map(|c| (0..n).map(move |m| (c, m))).collect()
    } else {
        vec![(cpu_node, mem_node)]
    };

    let mut failed = 0;
    for (cpu_node, mem_node) in placements {
        let config = match build_config(&matches, cpu_node, mem_node) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        };
        let ok = match matches.value_of("mode") {
            Some("throughput") => {
                run::<_>(ThroughputBenchmark::new(config, size_bytes, &topology, &timer), &matches)
            }
            _ => run::<_>(LatencyBenchmark::new(config, size_bytes, &topology, &timer), &matches),
        };
        if !ok {
            failed += 1;
        }
    }
    if failed > 0 {
        process::exit(1);
    }
}

/// `None` if the size overflows `usize`.
fn kib_to_bytes(kb: usize) -> Option<usize> {
    kb.checked_mul(1024)
}

fn build_config(
    matches: &ArgMatches,
    cpu_node: Node,
    mem_node: Node,
) -> numa_membench::Result<BenchmarkConfig> {
    let chunk_bits = value_t!(matches, "chunk", u32).unwrap_or_else(|e| e.exit());
    let chunk = ChunkSize::from_bits(chunk_bits).unwrap_or(ChunkSize::Bits64);
    let name = format!(
        "{}-cpu{}-mem{}",
        matches.value_of("mode").unwrap_or("latency"),
        cpu_node,
        mem_node
    );

    let mut builder = BenchmarkConfig::builder(&name);
    builder
        .iterations(value_t!(matches, "iterations", u32).unwrap_or_else(|e| e.exit()))
        .worker_threads(value_t!(matches, "threads", usize).unwrap_or_else(|e| e.exit()))
        .cpu_node(cpu_node)
        .mem_node(mem_node)
        .chunk_size(chunk)
        .boost_priority(matches.is_present("boost"))
        .pattern(match matches.value_of("pattern") {
            Some("sequential") => Pattern::Sequential,
            _ => Pattern::Random,
        })
        .rw_mode(match matches.value_of("rw") {
            Some("write") => RwMode::Write,
            Some("mixed") => RwMode::Mixed,
            _ => RwMode::Read,
        })
        .pass_policy(PassPolicy::Calibrated(match matches.value_of("curve") {
            Some("inverse-square") => PassCurve::InverseSquare,
            _ => PassCurve::Inverse,
        }));

    if matches.is_present("stride") {
        builder.stride_bytes(value_t!(matches, "stride", i64).unwrap_or_else(|e| e.exit()));
    }
    if matches.is_present("passes") {
        let n = value_t!(matches, "passes", u64).unwrap_or_else(|e| e.exit());
        match NonZeroU64::new(n) {
            Some(n) => {
                builder.passes(n);
            }
            None => warn!("Ignoring --passes 0, calibrating passes instead"),
        }
    }
    if matches.is_present("worker-node") {
        builder.worker_node(value_t!(matches, "worker-node", Node).unwrap_or_else(|e| e.exit()));
    }
    if matches.is_present("seed") {
        builder.random_seed(value_t!(matches, "seed", u64).unwrap_or_else(|e| e.exit()));
    }
    if matches.is_present("random-seed") {
        builder.randomize();
    }
    if matches.is_present("shared-load") {
        builder.load_region(LoadRegion::Shared);
    }
    builder.build()
}

/// Runs one benchmark and prints its results. Returns `false` on failure.
fn run<W: Workload>(bench: numa_membench::Result<Benchmark<W>>, matches: &ArgMatches) -> bool {
    let mut bench = match bench {
        Ok(b) => b,
        Err(e) => {
            error!("{}", e);
            return false;
        }
    };
    if !bench.region().is_node_bound() {
        warn!(
            "{}: memory is not bound to node {}",
            bench.config().name(),
            bench.config().mem_node()
        );
    }
    if let Err(e) = bench.run() {
        error!("{}: {}", bench.config().name(), e);
        return false;
    }

    let name = bench.config().name().to_string();
    for r in bench.results().iterations() {
        let load = bench
            .load_metric_on_iter(r.iteration())
            .map(|l| format!(" load {:10.1} MB/s", l))
            .unwrap_or_default();
        let unpinned: Vec<String> = std::iter::once(("measurer", r.measurer_binding()))
            .chain(r.worker_bindings().iter().map(|b| ("worker", *b)))
            .filter(|(_, b)| !b.is_pinned())
            .map(|(who, b)| format!("{} cpu {:?}", who, b.cpu()))
            .collect();
        let unpinned = if unpinned.is_empty() {
            String::new()
        } else {
            format!(" (unpinned: {})", unpinned.join(", "))
        };
        println!(
            "{:24} iter {:3} {:12.3} {}{}{}",
            name,
            r.iteration(),
            r.metric(),
            bench.results().unit(),
            load,
            unpinned
        );
    }
    if let Ok(agg) = bench.finalize() {
        println!(
            "{:24} mean {:12.3} {} min {:.3} max {:.3} median {:.3}",
            name, agg.mean, agg.unit, agg.min, agg.max, agg.median
        );
    }

    if let Some(path) = matches.value_of("csv") {
        if let Err(e) = bench.results().write_csv(Path::new(path), &name) {
            error!("Can't write results to {}: {}", path, e);
            return false;
        }
    }
    true
}

fn self_test(backend: TimerBackend) -> bool {
    let topology = match diagnostics::query_system_topology() {
        Ok(t) => t,
        Err(e) => {
            error!("{}", e);
            return false;
        }
    };
    println!(
        "nodes {} packages {} physical cpus {} logical cpus {}",
        topology.num_nodes(),
        topology.num_packages(),
        topology.num_physical_cpus(),
        topology.num_logical_cpus()
    );
    println!(
        "caches L1 {} L2 {} L3 {} L4 {}, page {} B, large page {} B",
        topology.caches(1).unwrap_or(0),
        topology.caches(2).unwrap_or(0),
        topology.caches(3).unwrap_or(0),
        topology.caches(4).unwrap_or(0),
        topology.page_size(),
        topology.large_page_size()
    );

    let timer_ok = match diagnostics::test_timer_calibration(backend) {
        Ok(report) => {
            println!(
                "timer {} {} Hz, 100 ms sleep measured as {:.3} ms",
                report.backend,
                report.ticks_per_second,
                report.measured_ns / 1e6
            );
            true
        }
        Err(e) => {
            error!("{}", e);
            false
        }
    };

    let probes = diagnostics::test_thread_affinity_sweep(&topology);
    let locked = probes.iter().filter(|p| p.locked && p.unlocked).count();
    for p in probes.iter().filter(|p| !(p.locked && p.unlocked)) {
        println!("cpu {:4} locked {} unlocked {}", p.cpu, p.locked, p.unlocked);
    }
    println!("affinity {}/{} cpus ok", locked, probes.len());

    timer_ok
}
