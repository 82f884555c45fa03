// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runs latency benchmarks end to end on the host.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use numa_membench::affinity::current_affinity;
use numa_membench::topology::online_cpus;
use numa_membench::{
    BenchError, BenchmarkConfig, BenchmarkState, ChunkSize, LatencyBenchmark, LoadRegion,
    MetricUnit, Pattern, PowerReader, RwMode, SystemTopology, Timer, TimerBackend,
};

const MIB: usize = 1 << 20;

fn topology() -> SystemTopology {
    SystemTopology::discover()
        .or_else(|_| SystemTopology::flat(online_cpus()))
        .expect("at least one cpu")
}

fn timer() -> Timer {
    Timer::calibrated(TimerBackend::OsCounter, Duration::from_millis(50)).expect("os timer")
}

fn passes(n: u64) -> NonZeroU64 {
    NonZeroU64::new(n).unwrap()
}

#[test]
fn sequential_unloaded() {
    let _r = env_logger::try_init();
    let (topology, timer) = (topology(), timer());
    let config = BenchmarkConfig::builder("seq-64")
        .pattern(Pattern::Sequential)
        .chunk_size(ChunkSize::Bits64)
        .stride_bytes(8)
        .iterations(3)
        .worker_threads(0)
        .build()
        .unwrap();

    let mut bench = LatencyBenchmark::new(config, MIB, &topology, &timer).unwrap();
    assert_eq!(bench.state(), BenchmarkState::Constructed);
    assert_eq!(bench.passes(), 64);

    bench.run().unwrap();
    let chain_len = bench.workload().unwrap().chain_len();
    assert_eq!(chain_len, MIB / 8);

    let results = bench.results();
    assert_eq!(results.unit(), MetricUnit::NanosPerAccess);
    assert_eq!(results.len(), 3);
    for (i, r) in results.iterations().iter().enumerate() {
        assert_eq!(r.metric(), r.elapsed_ns() / (bench.passes() * chain_len as u64) as f64);
        assert_eq!(r.iteration(), i);
        assert!(r.elapsed_ticks() > 0);
        assert!(r.metric() > 0.0 && r.metric().is_finite());
        assert!(r.metric() < 10_000.0, "{} ns per access", r.metric());
        assert_eq!(r.load_metric(), None);
    }
    assert_eq!(bench.state(), BenchmarkState::Completed);
    assert_eq!(bench.avg_load_metric(), Err(BenchError::NoLoadWorkers));

    let agg = bench.finalize().unwrap();
    assert_eq!(agg.iterations, 3);
    assert!(agg.min <= agg.median && agg.median <= agg.max);
}

#[test]
fn random_and_reverse() {
    let (topology, timer) = (topology(), timer());
    for (pattern, stride) in [(Pattern::Random, 64), (Pattern::Sequential, -128)] {
        let config = BenchmarkConfig::builder("var")
            .pattern(pattern)
            .chunk_size(ChunkSize::Bits512)
            .stride_bytes(stride)
            .passes(passes(2))
            .random_seed(11)
            .build()
            .unwrap();
        let mut bench = LatencyBenchmark::new(config, MIB, &topology, &timer).unwrap();
        bench.run().unwrap();
        assert_eq!(bench.workload().unwrap().chain_len(), MIB / 64);
        assert!(bench.results().iterations()[0].metric() > 0.0);
    }
}

#[test]
fn loaded_reports_load_metric() {
    let (topology, timer) = (topology(), timer());
    let config = BenchmarkConfig::builder("loaded")
        .pattern(Pattern::Random)
        .rw_mode(RwMode::Write)
        .worker_threads(2)
        .iterations(3)
        .passes(passes(4))
        .random_seed(1)
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(config, 4 * MIB, &topology, &timer).unwrap();
    bench.run().unwrap();

    // The chase gets a third of the region.
    let latency = bench.workload().unwrap();
    assert_eq!(latency.load_workers().map(|p| p.len()), Some(2));
    assert!(latency.chain_len() <= 4 * MIB / 8 / 3);

    let accesses = (bench.passes() * latency.chain_len() as u64) as f64;
    for r in bench.results().iterations() {
        assert_eq!(r.metric(), r.elapsed_ns() / accesses);
        assert_eq!(r.worker_bindings().len(), 2);
    }

    let per_iter: Vec<f64> = (0..3)
        .map(|i| bench.load_metric_on_iter(i).unwrap())
        .collect();
    assert!(per_iter.iter().all(|l| *l > 0.0));
    let avg = bench.avg_load_metric().unwrap();
    let mean = per_iter.iter().sum::<f64>() / 3.0;
    assert!((avg - mean).abs() <= 1e-9 * mean.max(1.0));

    assert!(matches!(
        bench.load_metric_on_iter(3),
        Err(BenchError::IterationOutOfRange { .. })
    ));
}

#[test]
fn shared_load_keeps_chain_intact() {
    let (topology, timer) = (topology(), timer());
    let config = BenchmarkConfig::builder("shared")
        .pattern(Pattern::Random)
        .rw_mode(RwMode::Mixed)
        .load_region(LoadRegion::Shared)
        .worker_threads(2)
        .iterations(2)
        .passes(passes(3))
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(config, MIB, &topology, &timer).unwrap();
    bench.run().unwrap();
    assert_eq!(bench.workload().unwrap().chain_len(), MIB / 8);
    assert!(bench.avg_load_metric().unwrap() > 0.0);
}

#[test]
fn runs_only_once() {
    let (topology, timer) = (topology(), timer());
    let config = BenchmarkConfig::builder("once")
        .passes(passes(1))
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(config, 64 * 1024, &topology, &timer).unwrap();
    bench.configure().unwrap();
    assert_eq!(bench.state(), BenchmarkState::Configured);
    assert!(bench.run().is_ok());
    assert_eq!(bench.run().err(), Some(BenchError::AlreadyRun));
    assert_eq!(bench.configure(), Err(BenchError::AlreadyRun));
    assert_eq!(bench.results().len(), 1);
}

#[test]
fn rejects_unusable_setups() {
    let (topology, timer) = (topology(), timer());

    let missing_node = BenchmarkConfig::builder("far")
        .mem_node(topology.num_nodes())
        .build()
        .unwrap();
    assert!(matches!(
        LatencyBenchmark::new(missing_node, MIB, &topology, &timer),
        Err(BenchError::Allocation { .. })
    ));

    let narrow = BenchmarkConfig::builder("narrow")
        .chunk_size(ChunkSize::Bits32)
        .stride_bytes(4)
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(narrow, MIB, &topology, &timer).unwrap();
    assert!(matches!(bench.run(), Err(BenchError::InvalidConfig(_))));

    let crowded = BenchmarkConfig::builder("crowded")
        .worker_threads(1000)
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(crowded, 4096, &topology, &timer).unwrap();
    assert!(matches!(bench.run(), Err(BenchError::InvalidConfig(_))));
    assert_eq!(bench.finalize(), Err(BenchError::NoData));
}

#[test]
fn reports_each_binding() {
    let timer = timer();
    let allowed = current_affinity();
    // A CPU id no affinity mask can hold.
    let missing = usize::MAX / 2;
    let topology = SystemTopology::flat(vec![allowed[0], missing]).unwrap();

    let config = BenchmarkConfig::builder("bindings")
        .worker_threads(1)
        .iterations(2)
        .passes(passes(2))
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(config, MIB, &topology, &timer).unwrap();
    bench.run().unwrap();

    for r in bench.results().iterations() {
        let measurer = r.measurer_binding();
        assert_eq!(measurer.cpu(), Some(allowed[0]));
        assert!(measurer.is_pinned());

        let workers = r.worker_bindings();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].cpu(), Some(missing));
        assert!(!workers[0].is_pinned());
        assert!(!r.pinned());
        assert!(r.load_metric().unwrap() > 0.0);
    }
}

struct FakeMeter {
    windows: Arc<AtomicUsize>,
    watts: f64,
}

impl PowerReader for FakeMeter {
    fn name(&self) -> &str {
        "fake"
    }

    fn start_sampling(&mut self) -> bool {
        true
    }

    fn stop_sampling(&mut self) -> bool {
        self.windows.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn average_power(&self) -> f64 {
        self.watts
    }
}

#[test]
fn samples_power_every_iteration() {
    let (topology, timer) = (topology(), timer());
    let windows = Arc::new(AtomicUsize::new(0));
    let config = BenchmarkConfig::builder("power")
        .iterations(4)
        .passes(passes(1))
        .build()
        .unwrap();
    let mut bench = LatencyBenchmark::new(config, 256 * 1024, &topology, &timer).unwrap();
    bench.add_power_reader(Box::new(FakeMeter {
        windows: windows.clone(),
        watts: 42.5,
    }));
    bench.run().unwrap();

    assert_eq!(windows.load(Ordering::SeqCst), 4);
    for r in bench.results().iterations() {
        assert_eq!(r.power().len(), 1);
        assert_eq!(r.power()[0].reader(), "fake");
        assert_eq!(r.power()[0].average_watts(), Some(42.5));
    }
    let agg = bench.finalize().unwrap();
    assert_eq!(agg.power[0].average_watts(), Some(42.5));
}

/// Statistical: on an idle machine, memory traffic from other cores makes
/// the chase slower, never faster.
#[test]
#[ignore]
fn loaded_latency_is_not_lower() {
    let (topology, timer) = (topology(), timer());
    let workers = topology.cpus_on_node(0).len().saturating_sub(1).max(1);

    let run = |workers: usize| {
        let config = BenchmarkConfig::builder("stat")
            .pattern(Pattern::Random)
            .worker_threads(workers)
            .load_region(LoadRegion::Shared)
            .iterations(5)
            .random_seed(3)
            .build()
            .unwrap();
        let mut bench = LatencyBenchmark::new(config, 256 * MIB, &topology, &timer).unwrap();
        bench.run().unwrap();
        bench.finalize().unwrap().median
    };

    let unloaded = run(0);
    let loaded = run(workers);
    assert!(
        loaded >= unloaded * 0.95,
        "loaded {} ns vs unloaded {} ns",
        loaded,
        unloaded
    );
}
