// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! High-resolution timing of benchmark sections.
//!
//! A [`Timer`] reads ticks from one of two [`TimerBackend`]s and converts
//! them to wall-clock time with a frequency that is calibrated once, when the
//! timer is created. Create one timer at startup and share it by reference.
//!
//! Both backends fence the timed region: `start` serializes before reading
//! the counter so earlier instructions can't leak into the measurement, and
//! `stop` reads the counter once all prior instructions are done and then
//! serializes again so later instructions can't be counted.

use std::sync::atomic::{compiler_fence, fence, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::*;
use nix::time::{clock_gettime, ClockId};
use serde::Serialize;

use crate::error::{BenchError, Result};

/// Default duration of the sleep used to calibrate the tick frequency.
pub const DEFAULT_CALIBRATION_PERIOD: Duration = Duration::from_millis(250);

/// Source of ticks for a [`Timer`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum TimerBackend {
    /// The CPU's cycle/timestamp counter (`rdtsc`/`rdtscp` on x86-64,
    /// `cntvct_el0` on aarch64).
    CycleCounter,
    /// The OS monotonic clock (`CLOCK_MONOTONIC_RAW`).
    OsCounter,
}

impl Default for TimerBackend {
    fn default() -> Self {
        if cycles::AVAILABLE {
            TimerBackend::CycleCounter
        } else {
            TimerBackend::OsCounter
        }
    }
}

impl std::fmt::Display for TimerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            TimerBackend::CycleCounter => write!(f, "cycle-counter"),
            TimerBackend::OsCounter => write!(f, "os-counter"),
        }
    }
}

impl TimerBackend {
    /// Checks whether the backend works on this machine.
    fn probe(self) -> Result<()> {
        match self {
            TimerBackend::CycleCounter => cycles::probe(),
            TimerBackend::OsCounter => clock_gettime(ClockId::CLOCK_MONOTONIC_RAW)
                .map(|_| ())
                .map_err(|e| BenchError::TimerUnavailable(format!("clock_gettime: {}", e))),
        }
    }

    #[inline(always)]
    fn start(self) -> u64 {
        match self {
            TimerBackend::CycleCounter => cycles::start(),
            TimerBackend::OsCounter => {
                fence(Ordering::SeqCst);
                compiler_fence(Ordering::SeqCst);
                os_ticks()
            }
        }
    }

    #[inline(always)]
    fn stop(self) -> u64 {
        match self {
            TimerBackend::CycleCounter => cycles::stop(),
            TimerBackend::OsCounter => {
                compiler_fence(Ordering::SeqCst);
                let t = os_ticks();
                fence(Ordering::SeqCst);
                compiler_fence(Ordering::SeqCst);
                t
            }
        }
    }
}

/// Nanoseconds of the monotonic clock.
#[inline(always)]
fn os_ticks() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC_RAW)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

#[cfg(target_arch = "x86_64")]
mod cycles {
    use core::arch::x86_64::{__cpuid, __rdtscp, _rdtsc};

    use crate::error::{BenchError, Result};

    pub(super) const AVAILABLE: bool = true;

    /// `rdtscp` is reported in CPUID leaf 0x8000_0001, EDX bit 27.
    pub(super) fn probe() -> Result<()> {
        let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_extended < 0x8000_0001 {
            return Err(BenchError::TimerUnavailable(String::from(
                "cpuid has no extended feature leaf",
            )));
        }
        if unsafe { __cpuid(0x8000_0001) }.edx & (1 << 27) == 0 {
            return Err(BenchError::TimerUnavailable(String::from(
                "cpu does not support rdtscp",
            )));
        }
        Ok(())
    }

    #[inline(always)]
    pub(super) fn start() -> u64 {
        unsafe {
            let _ = __cpuid(0);
            _rdtsc()
        }
    }

    #[inline(always)]
    pub(super) fn stop() -> u64 {
        let mut aux = 0u32;
        unsafe {
            let tick = __rdtscp(&mut aux);
            let _ = __cpuid(0);
            tick
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod cycles {
    use core::arch::asm;

    use crate::error::Result;

    pub(super) const AVAILABLE: bool = true;

    pub(super) fn probe() -> Result<()> {
        Ok(())
    }

    #[inline(always)]
    pub(super) fn start() -> u64 {
        let tick: u64;
        unsafe {
            asm!("isb", "mrs {t}, cntvct_el0", t = out(reg) tick, options(nomem, nostack));
        }
        tick
    }

    #[inline(always)]
    pub(super) fn stop() -> u64 {
        let tick: u64;
        unsafe {
            asm!("mrs {t}, cntvct_el0", "isb", t = out(reg) tick, options(nomem, nostack));
        }
        tick
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod cycles {
    use crate::error::{BenchError, Result};

    pub(super) const AVAILABLE: bool = false;

    pub(super) fn probe() -> Result<()> {
        Err(BenchError::TimerUnavailable(String::from(
            "no cycle counter on this architecture",
        )))
    }

    #[inline(always)]
    pub(super) fn start() -> u64 {
        0
    }

    #[inline(always)]
    pub(super) fn stop() -> u64 {
        0
    }
}

/// A calibrated tick counter.
#[derive(Debug, Clone)]
pub struct Timer {
    backend: TimerBackend,
    ticks_per_sec: u64,
    ns_per_tick: f64,
}

impl Timer {
    /// Creates a timer and calibrates it with [`DEFAULT_CALIBRATION_PERIOD`].
    pub fn new(backend: TimerBackend) -> Result<Timer> {
        Timer::calibrated(backend, DEFAULT_CALIBRATION_PERIOD)
    }

    /// Creates a timer by counting the ticks that pass during a sleep of
    /// `period` and relating them to the elapsed wall-clock time.
    pub fn calibrated(backend: TimerBackend, period: Duration) -> Result<Timer> {
        backend.probe()?;

        let wall = Instant::now();
        let t0 = backend.start();
        thread::sleep(period);
        let t1 = backend.stop();
        let elapsed_ns = wall.elapsed().as_nanos();

        if t1 <= t0 || elapsed_ns == 0 {
            return Err(BenchError::TimerUnavailable(format!(
                "{} did not advance during calibration ({} -> {})",
                backend, t0, t1
            )));
        }
        let ticks_per_sec = ((t1 - t0) as u128 * 1_000_000_000 / elapsed_ns) as u64;
        if ticks_per_sec == 0 {
            return Err(BenchError::TimerUnavailable(format!(
                "{} runs slower than 1 Hz",
                backend
            )));
        }

        let timer = Timer {
            backend,
            ticks_per_sec,
            ns_per_tick: 1e9 / ticks_per_sec as f64,
        };
        info!(
            "Calibrated {} timer: {} Hz ({:.3} ns per tick)",
            backend, timer.ticks_per_sec, timer.ns_per_tick
        );
        Ok(timer)
    }

    pub fn backend(&self) -> TimerBackend {
        self.backend
    }

    /// Begins a timed section.
    #[inline(always)]
    pub fn start(&self) -> u64 {
        self.backend.start()
    }

    /// Ends a timed section.
    #[inline(always)]
    pub fn stop(&self) -> u64 {
        self.backend.stop()
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_sec
    }

    pub fn ns_per_tick(&self) -> f64 {
        self.ns_per_tick
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> f64 {
        ticks as f64 * 1e9 / self.ticks_per_sec as f64
    }

    pub fn ticks_to_secs(&self, ticks: u64) -> f64 {
        ticks as f64 / self.ticks_per_sec as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn os_counter_runs_at_nanoseconds() {
        let timer = Timer::calibrated(TimerBackend::OsCounter, Duration::from_millis(50))
            .expect("monotonic clock");
        // The OS counter ticks in ns, allow for generous scheduling noise.
        assert!(timer.ticks_per_second() > 500_000_000);
        assert!(timer.ticks_per_second() < 2_000_000_000);
    }

    #[test]
    fn start_stop_advances() {
        let timer = Timer::new(TimerBackend::default()).expect("default backend works");
        let t0 = timer.start();
        thread::sleep(Duration::from_millis(5));
        let t1 = timer.stop();
        assert!(t1 > t0);
        let ns = timer.ticks_to_ns(t1 - t0);
        assert!(ns >= 4_000_000.0, "slept 5ms but measured {}ns", ns);
    }

    #[test]
    fn conversion() {
        let timer = Timer {
            backend: TimerBackend::OsCounter,
            ticks_per_sec: 2_000_000_000,
            ns_per_tick: 0.5,
        };
        assert_eq!(timer.ticks_to_ns(2_000), 1_000.0);
        assert_eq!(timer.ticks_to_secs(4_000_000_000), 2.0);
    }
}
