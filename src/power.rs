// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Power telemetry captured alongside measurements.

use serde::Serialize;

/// A source of power readings (e.g. a RAPL or BMC driver).
///
/// The benchmark calls [`PowerReader::start_sampling`] right before and
/// [`PowerReader::stop_sampling`] right after every timed section, then reads
/// [`PowerReader::average_power`] for that window.
pub trait PowerReader: Send {
    fn name(&self) -> &str;

    /// Returns `false` if sampling could not be started.
    fn start_sampling(&mut self) -> bool;

    /// Returns `false` if sampling could not be stopped cleanly.
    fn stop_sampling(&mut self) -> bool;

    /// Average power in watts over the last sampling window.
    fn average_power(&self) -> f64;
}

/// Average power of one reader during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSample {
    reader: String,
    average_watts: Option<f64>,
}

impl PowerSample {
    pub(crate) fn new(reader: &str, average_watts: Option<f64>) -> PowerSample {
        PowerSample {
            reader: String::from(reader),
            average_watts,
        }
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// `None` if the reader failed to sample this window.
    pub fn average_watts(&self) -> Option<f64> {
        self.average_watts
    }
}
