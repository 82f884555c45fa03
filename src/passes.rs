// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! How many passes over a working set make up one benchmark iteration.
//!
//! Small working sets are traversed many times so an iteration lasts long
//! enough to be measured, large ones fewer times so the run time stays
//! bounded.

use core::num::NonZeroU64;

use serde::Serialize;

/// Numerator (in KiB) of [`PassCurve::Inverse`].
pub const INVERSE_CURVE_KB: u64 = 65_536;

/// Numerator (in KiB²) of [`PassCurve::InverseSquare`].
pub const INVERSE_SQUARE_CURVE_KB2: u64 = 4 * 2_097_152;

/// Shape of the passes-per-working-set-size function.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum PassCurve {
    /// `passes = 65536 / size_kb`: roughly the same number of bytes is
    /// touched regardless of the working set size.
    Inverse,
    /// `passes = 8388608 / size_kb²`: drops off faster for large sets.
    InverseSquare,
}

impl PassCurve {
    /// Passes for a working set of `working_set_kb` KiB, at least one.
    ///
    /// A working set smaller than 1 KiB is treated as 1 KiB.
    pub fn passes(self, working_set_kb: u64) -> u64 {
        let kb = working_set_kb.max(1);
        let passes = match self {
            PassCurve::Inverse => INVERSE_CURVE_KB / kb,
            PassCurve::InverseSquare => INVERSE_SQUARE_CURVE_KB2 / kb.saturating_mul(kb),
        };
        passes.max(1)
    }
}

/// Number of passes per iteration: either given or derived from the region
/// size.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum PassPolicy {
    Fixed(NonZeroU64),
    Calibrated(PassCurve),
}

impl Default for PassPolicy {
    fn default() -> Self {
        PassPolicy::Calibrated(PassCurve::Inverse)
    }
}

impl PassPolicy {
    /// Passes for a region of `len_bytes`.
    pub fn passes_for(self, len_bytes: usize) -> u64 {
        match self {
            PassPolicy::Fixed(n) => n.get(),
            PassPolicy::Calibrated(curve) => compute_passes(curve, (len_bytes / 1024) as u64),
        }
    }
}

/// See [`PassCurve::passes`].
pub fn compute_passes(curve: PassCurve, working_set_kb: u64) -> u64 {
    curve.passes(working_set_kb)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn never_zero() {
        for curve in [PassCurve::Inverse, PassCurve::InverseSquare] {
            for kb in [0, 1, 3, 4096, 65_536, 65_537, 1 << 20, 1 << 30, u64::MAX] {
                assert!(compute_passes(curve, kb) >= 1, "{:?} {}", curve, kb);
            }
        }
    }

    #[test]
    fn inverse_is_proportional() {
        let small = compute_passes(PassCurve::Inverse, 1024);
        let large = compute_passes(PassCurve::Inverse, 2048);
        assert_eq!(small, 64);
        assert_eq!(large, 32);
        assert_eq!(small, 2 * large);
    }

    #[test]
    fn inverse_square_squares() {
        assert_eq!(compute_passes(PassCurve::InverseSquare, 1), 8_388_608);
        assert_eq!(compute_passes(PassCurve::InverseSquare, 64), 2048);
        assert_eq!(compute_passes(PassCurve::InverseSquare, 128), 512);
        // 4096^2 > 8388608
        assert_eq!(compute_passes(PassCurve::InverseSquare, 4096), 1);
    }

    #[test]
    fn policy() {
        let fixed = PassPolicy::Fixed(NonZeroU64::new(7).unwrap());
        assert_eq!(fixed.passes_for(1 << 30), 7);
        assert_eq!(PassPolicy::default().passes_for(1 << 20), 64);
        assert_eq!(PassPolicy::default().passes_for(100), 65_536);
    }
}
