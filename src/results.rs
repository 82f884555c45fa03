// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Collection and aggregation of per-iteration measurements.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;

use csv::WriterBuilder;
use log::*;
use serde::Serialize;

use crate::error::{BenchError, Result};
use crate::power::PowerSample;
use crate::topology::Cpu;

/// Bytes in a megabyte as reported in throughput metrics.
pub const BYTES_PER_MB: f64 = (1 << 20) as f64;

/// What the metric of an iteration measures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum MetricUnit {
    /// Latency, nanoseconds per access.
    NanosPerAccess,
    /// Throughput, MiB moved per second.
    MegabytesPerSecond,
}

impl fmt::Display for MetricUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MetricUnit::NanosPerAccess => write!(f, "ns/access"),
            MetricUnit::MegabytesPerSecond => write!(f, "MB/s"),
        }
    }
}

/// Outcome of one attempt to bind a thread to a CPU.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Binding {
    cpu: Option<Cpu>,
    pinned: bool,
}

impl Binding {
    pub(crate) fn new(cpu: Option<Cpu>, pinned: bool) -> Binding {
        Binding { cpu, pinned }
    }

    /// CPU the thread was placed on, `None` if its node had no CPU.
    pub fn cpu(&self) -> Option<Cpu> {
        self.cpu
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Raw outcome of one timed section, before it is sealed into an
/// [`IterationResult`].
#[derive(Debug, Clone)]
pub struct Measurement {
    pub(crate) elapsed_ticks: u64,
    pub(crate) elapsed_ns: f64,
    pub(crate) metric: f64,
    pub(crate) load_metric: Option<f64>,
    /// Binding of the measuring thread.
    pub(crate) measurer: Binding,
    /// Bindings of the other threads, in worker order.
    pub(crate) workers: Vec<Binding>,
}

/// Measurements of one iteration. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationResult {
    iteration: usize,
    elapsed_ticks: u64,
    elapsed_ns: f64,
    metric: f64,
    load_metric: Option<f64>,
    measurer: Binding,
    workers: Vec<Binding>,
    power: Vec<PowerSample>,
}

impl IterationResult {
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn elapsed_ticks(&self) -> u64 {
        self.elapsed_ticks
    }

    pub fn elapsed_ns(&self) -> f64 {
        self.elapsed_ns
    }

    /// Latency (ns/access) or throughput (MB/s), see [`ResultSet::unit`].
    pub fn metric(&self) -> f64 {
        self.metric
    }

    /// Throughput (MB/s) generated by load workers during this iteration.
    pub fn load_metric(&self) -> Option<f64> {
        self.load_metric
    }

    /// Did every thread of the timed section get bound to its CPU?
    pub fn pinned(&self) -> bool {
        self.measurer.pinned && self.workers.iter().all(|w| w.pinned)
    }

    pub fn measurer_binding(&self) -> Binding {
        self.measurer
    }

    /// One binding per load worker (or extra streaming thread).
    pub fn worker_bindings(&self) -> &[Binding] {
        &self.workers
    }

    pub fn power(&self) -> &[PowerSample] {
        &self.power
    }
}

/// Summary over all recorded iterations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub unit: MetricUnit,
    pub iterations: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    /// Mean power per reader over the iterations it sampled successfully.
    pub power: Vec<PowerSample>,
}

/// The ordered iteration results of one benchmark instance.
#[derive(Debug, Clone)]
pub struct ResultSet {
    unit: MetricUnit,
    with_load: bool,
    iterations: Vec<IterationResult>,
}

impl ResultSet {
    pub(crate) fn new(unit: MetricUnit, with_load: bool) -> ResultSet {
        ResultSet {
            unit,
            with_load,
            iterations: Vec::new(),
        }
    }

    pub fn unit(&self) -> MetricUnit {
        self.unit
    }

    /// Appends the result of `iteration`, which must be the next one.
    pub(crate) fn record(
        &mut self,
        iteration: usize,
        m: Measurement,
        power: Vec<PowerSample>,
    ) -> Result<()> {
        if iteration != self.iterations.len() {
            return Err(BenchError::IterationOutOfRange {
                iteration,
                recorded: self.iterations.len(),
            });
        }
        debug!(
            "iteration {}: {} ticks, {:.3} {}{}",
            iteration,
            m.elapsed_ticks,
            m.metric,
            self.unit,
            m.load_metric
                .map(|l| format!(", load {:.1} MB/s", l))
                .unwrap_or_default()
        );
        self.iterations.push(IterationResult {
            iteration,
            elapsed_ticks: m.elapsed_ticks,
            elapsed_ns: m.elapsed_ns,
            metric: m.metric,
            load_metric: m.load_metric,
            measurer: m.measurer,
            workers: m.workers,
            power,
        });
        Ok(())
    }

    /// Iteration results in the order they ran.
    pub fn iterations(&self) -> &[IterationResult] {
        &self.iterations
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    /// Computes the aggregate; fails with [`BenchError::NoData`] before the
    /// first iteration is recorded.
    pub fn finalize(&self) -> Result<Aggregate> {
        if self.iterations.is_empty() {
            return Err(BenchError::NoData);
        }
        let mut metrics: Vec<f64> = self.iterations.iter().map(|r| r.metric).collect();
        metrics.sort_by(|a, b| a.total_cmp(b));
        let n = metrics.len();
        let median = if n % 2 == 1 {
            metrics[n / 2]
        } else {
            (metrics[n / 2 - 1] + metrics[n / 2]) / 2.0
        };

        Ok(Aggregate {
            unit: self.unit,
            iterations: n,
            mean: mean(&metrics).unwrap_or(0.0),
            min: metrics[0],
            max: metrics[n - 1],
            median,
            power: self.power_means(),
        })
    }

    fn power_means(&self) -> Vec<PowerSample> {
        let readers = self.iterations[0].power.iter().map(|s| s.reader());
        readers
            .enumerate()
            .map(|(idx, reader)| {
                let watts: Vec<f64> = self
                    .iterations
                    .iter()
                    .filter_map(|r| r.power.get(idx).and_then(|s| s.average_watts()))
                    .collect();
                PowerSample::new(reader, mean(&watts))
            })
            .collect()
    }

    /// Load throughput during `iteration`.
    pub fn load_metric_on_iter(&self, iteration: usize) -> Result<f64> {
        if !self.with_load {
            return Err(BenchError::NoLoadWorkers);
        }
        self.iterations
            .get(iteration)
            .and_then(|r| r.load_metric)
            .ok_or(BenchError::IterationOutOfRange {
                iteration,
                recorded: self.iterations.len(),
            })
    }

    /// Mean load throughput over all recorded iterations.
    pub fn avg_load_metric(&self) -> Result<f64> {
        if !self.with_load {
            return Err(BenchError::NoLoadWorkers);
        }
        let loads: Vec<f64> = self.iterations.iter().filter_map(|r| r.load_metric).collect();
        mean(&loads).ok_or(BenchError::NoData)
    }

    /// Appends one CSV row per iteration to `path`; the header is only
    /// written when the file is new.
    pub fn write_csv(&self, path: &Path, name: &str) -> csv::Result<()> {
        let write_headers = !path.exists();
        let csv_file = OpenOptions::new().append(true).create(true).open(path)?;
        let mut wtr = WriterBuilder::new()
            .has_headers(write_headers)
            .from_writer(csv_file);

        #[derive(Serialize)]
        struct Record<'a> {
            name: &'a str,
            iteration: usize,
            elapsed_ticks: u64,
            elapsed_ns: f64,
            metric: f64,
            unit: String,
            load_mbps: Option<f64>,
            pinned: bool,
            unpinned_threads: usize,
            avg_power_watts: Option<f64>,
        }

        for r in self.iterations.iter() {
            let unpinned_threads = core::iter::once(&r.measurer)
                .chain(r.workers.iter())
                .filter(|b| !b.pinned)
                .count();
            let watts: Vec<f64> = r.power.iter().filter_map(|s| s.average_watts()).collect();
            wtr.serialize(Record {
                name,
                iteration: r.iteration,
                elapsed_ticks: r.elapsed_ticks,
                elapsed_ns: r.elapsed_ns,
                metric: r.metric,
                unit: self.unit.to_string(),
                load_mbps: r.load_metric,
                pinned: r.pinned(),
                unpinned_threads,
                avg_power_watts: mean(&watts),
            })?;
        }

        wtr.flush()?;
        Ok(())
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn m(metric: f64, load: Option<f64>) -> Measurement {
        Measurement {
            elapsed_ticks: 1000,
            elapsed_ns: 500.0,
            metric,
            load_metric: load,
            measurer: Binding::new(Some(0), true),
            workers: Vec::new(),
        }
    }

    #[test]
    fn finalize_without_data() {
        let rs = ResultSet::new(MetricUnit::NanosPerAccess, false);
        assert_eq!(rs.finalize(), Err(BenchError::NoData));
    }

    #[test]
    fn aggregate() {
        let mut rs = ResultSet::new(MetricUnit::MegabytesPerSecond, false);
        for (i, v) in [4.0, 1.0, 3.0, 2.0].iter().enumerate() {
            rs.record(i, m(*v, None), Vec::new()).unwrap();
        }
        let agg = rs.finalize().unwrap();
        assert_eq!(agg.iterations, 4);
        assert_eq!(agg.mean, 2.5);
        assert_eq!(agg.min, 1.0);
        assert_eq!(agg.max, 4.0);
        assert_eq!(agg.median, 2.5);
        assert!(agg.power.is_empty());
        // Insertion order is preserved.
        assert_eq!(rs.iterations()[0].metric(), 4.0);
    }

    #[test]
    fn records_in_order() {
        let mut rs = ResultSet::new(MetricUnit::NanosPerAccess, false);
        rs.record(0, m(1.0, None), Vec::new()).unwrap();
        assert_eq!(
            rs.record(2, m(1.0, None), Vec::new()),
            Err(BenchError::IterationOutOfRange {
                iteration: 2,
                recorded: 1
            })
        );
    }

    #[test]
    fn load_metrics() {
        let mut rs = ResultSet::new(MetricUnit::NanosPerAccess, true);
        assert_eq!(rs.avg_load_metric(), Err(BenchError::NoData));
        rs.record(0, m(80.0, Some(1000.0)), Vec::new()).unwrap();
        rs.record(1, m(90.0, Some(3000.0)), Vec::new()).unwrap();
        assert_eq!(rs.load_metric_on_iter(1), Ok(3000.0));
        assert_eq!(rs.avg_load_metric(), Ok(2000.0));
        assert!(matches!(
            rs.load_metric_on_iter(2),
            Err(BenchError::IterationOutOfRange { .. })
        ));

        let unloaded = ResultSet::new(MetricUnit::NanosPerAccess, false);
        assert_eq!(unloaded.load_metric_on_iter(0), Err(BenchError::NoLoadWorkers));
        assert_eq!(unloaded.avg_load_metric(), Err(BenchError::NoLoadWorkers));
    }

    #[test]
    fn power_means_skip_failed_windows() {
        let mut rs = ResultSet::new(MetricUnit::NanosPerAccess, false);
        rs.record(0, m(1.0, None), vec![PowerSample::new("pkg", Some(10.0))])
            .unwrap();
        rs.record(1, m(1.0, None), vec![PowerSample::new("pkg", None)])
            .unwrap();
        rs.record(2, m(1.0, None), vec![PowerSample::new("pkg", Some(20.0))])
            .unwrap();
        let agg = rs.finalize().unwrap();
        assert_eq!(agg.power, vec![PowerSample::new("pkg", Some(15.0))]);
    }

    #[test]
    fn bindings_are_kept_apart() {
        let mut rs = ResultSet::new(MetricUnit::NanosPerAccess, true);
        let mut loaded = m(1.0, Some(10.0));
        loaded.workers = vec![Binding::new(Some(1), true), Binding::new(None, false)];
        rs.record(0, loaded, Vec::new()).unwrap();
        rs.record(1, m(1.0, Some(10.0)), Vec::new()).unwrap();

        let r = &rs.iterations()[0];
        assert!(r.measurer_binding().is_pinned());
        assert_eq!(r.worker_bindings()[0].cpu(), Some(1));
        assert!(!r.worker_bindings()[1].is_pinned());
        assert!(!r.pinned());
        assert!(rs.iterations()[1].pinned());
    }

    #[test]
    fn csv_appends() {
        let path = std::env::temp_dir().join(format!("membench-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut rs = ResultSet::new(MetricUnit::NanosPerAccess, false);
        rs.record(0, m(1.5, None), Vec::new()).unwrap();
        rs.record(1, m(2.5, None), Vec::new()).unwrap();
        rs.write_csv(&path, "first").unwrap();
        rs.write_csv(&path, "second").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5, "{}", contents);
        assert!(lines[0].starts_with("name,iteration,"));
        assert!(lines[1].starts_with("first,0,"));
        assert!(lines[4].starts_with("second,1,"));
    }
}
