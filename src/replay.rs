//! Offline replay of recorded IMU logs through the attitude EKF.
//!
//! Logs are JSON (optionally gzip-compressed) of the form
//! `{ "readings": [ { "timestamp", "accel": {..}, "gyro": {..} } ] }`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::Context;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::filters::attitude_ekf::{AttitudeEkf, AttitudeEstimate};
use crate::types::{AccelData, GyroData, ImuSample};

/// Sample period assumed for the first reading of a log [s]
pub const DEFAULT_DT: f64 = 0.01;

#[derive(Clone, Debug, Deserialize)]
pub struct Reading {
    pub timestamp: f64,
    #[serde(default)]
    pub accel: Option<AccelData>,
    #[serde(default)]
    pub gyro: Option<GyroData>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogFile {
    pub readings: Vec<Reading>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplaySummary {
    pub readings: usize,
    /// Readings fed to the filter
    pub samples: usize,
    /// Readings without both sensors or with a non-positive period
    pub skipped: usize,
    pub divergences: usize,
    /// Timestamps at which divergence was reported
    pub divergence_timestamps: Vec<f64>,
    pub max_chi_square: f64,
    pub min_adaptive_gain: f64,
    pub final_estimate: AttitudeEstimate,
}

pub fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let parsed = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        parse_log(GzDecoder::new(file))
    } else {
        parse_log(file)
    };
    parsed.with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_log<R: Read>(reader: R) -> anyhow::Result<LogFile> {
    Ok(serde_json::from_reader(BufReader::new(reader))?)
}

/// Pair accel/gyro readings into filter inputs.
///
/// The period of each sample is the gap to the previous accepted one;
/// `first_dt` covers the first. Returns the samples with their timestamps
/// and the number of readings dropped.
pub fn collect_samples(log: &LogFile, first_dt: f64) -> (Vec<(f64, ImuSample)>, usize) {
    let mut samples = Vec::with_capacity(log.readings.len());
    let mut last_ts: Option<f64> = None;
    let mut skipped = 0;

    for r in &log.readings {
        let (Some(accel), Some(gyro)) = (r.accel.as_ref(), r.gyro.as_ref()) else {
            skipped += 1;
            continue;
        };

        let dt = match last_ts {
            Some(prev) => r.timestamp - prev,
            None => first_dt,
        };
        if !(dt.is_finite() && dt > 0.0) {
            log::debug!("dropping reading at {:.3}: dt = {dt}", r.timestamp);
            skipped += 1;
            continue;
        }

        last_ts = Some(r.timestamp);
        samples.push((r.timestamp, ImuSample::new(accel.vector(), gyro.vector(), dt)));
    }

    (samples, skipped)
}

/// Run every usable reading of `log` through `ekf`.
pub fn replay(ekf: &mut AttitudeEkf, log: &LogFile, first_dt: f64) -> ReplaySummary {
    let (samples, skipped) = collect_samples(log, first_dt);

    let mut divergence_timestamps = Vec::new();
    let mut max_chi_square: f64 = 0.0;
    let mut min_adaptive_gain: f64 = 1.0;

    for (ts, sample) in &samples {
        if ekf.step_sample(sample).is_divergence() {
            divergence_timestamps.push(*ts);
        }
        let stat = ekf.chi_square_stat();
        if stat.measured {
            max_chi_square = max_chi_square.max(stat.chi_square);
            min_adaptive_gain = min_adaptive_gain.min(stat.adaptive_gain);
        }
    }

    if !divergence_timestamps.is_empty() {
        log::info!(
            "replay reported {} divergence(s), first at {:.3}",
            divergence_timestamps.len(),
            divergence_timestamps[0]
        );
    }

    ReplaySummary {
        readings: log.readings.len(),
        samples: samples.len(),
        skipped,
        divergences: divergence_timestamps.len(),
        divergence_timestamps,
        max_chi_square,
        min_adaptive_gain,
        final_estimate: ekf.estimate(),
    }
}
