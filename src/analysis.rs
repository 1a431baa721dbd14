//! Statistics over exported sample data.
//!
//! Everything here is a pure function of the samples it is given; nothing
//! talks to the automation service.
//!
//! Digital edge detection: a sample is high when its value is above
//! [`DIGITAL_HIGH_THRESHOLD`], and an edge is any level change between two
//! consecutive samples. The period is the median of rising-to-rising and
//! falling-to-falling intervals, which keeps a single glitch from skewing the
//! result. If only one rising and one falling edge exist the period is taken
//! as twice their spacing.

use crate::dataset::{channel_samples, TIME_COLUMN_NAME};
use polars::prelude::*;
use serde::Serialize;

/// Values above this count as logic high.
pub const DIGITAL_HIGH_THRESHOLD: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("No signal on channel {channel}: {reason}")]
    NoSignal { channel: u32, reason: &'static str },

    #[error("Channel {channel} is not present in the exported data")]
    ChannelNotFound { channel: u32 },

    #[error("Exported data has no '{0}' column")]
    MissingColumn(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    #[error("Cannot estimate the sample rate: {0}")]
    NotEnoughSamples(&'static str),

    #[error("Failed to read exported data: {0}")]
    Data(#[from] PolarsError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigitalAnalysis {
    pub channel: u32,
    pub frequency_hz: f64,
    pub period_seconds: f64,
    /// Fraction of the observed window spent high, `0.0..=1.0`.
    pub duty_cycle: f64,
    pub rising_edges: usize,
    pub falling_edges: usize,
    pub total_samples: usize,
    pub first_level: u8,
    pub last_level: u8,
    pub window_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalogAnalysis {
    pub channel: u32,
    pub min_volts: f64,
    pub max_volts: f64,
    pub mean_volts: f64,
    pub sample_count: usize,
    pub first_volts: f64,
    pub last_volts: f64,
}

/// Frequency and duty cycle of `channel` in a table with `time` and
/// `channel_<n>` columns.
pub fn analyze_digital(df: &DataFrame, channel: u32) -> Result<DigitalAnalysis, AnalysisError> {
    let (times, values) = channel_samples(df, channel)?;
    digital_statistics(&times, &values, channel)
}

pub fn analyze_analog(df: &DataFrame, channel: u32) -> Result<AnalogAnalysis, AnalysisError> {
    let (_, values) = channel_samples(df, channel)?;
    analog_statistics(&values, channel)
}

/// Sample rate estimated from the spacing of the `time` column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRate {
    pub sample_rate_hz: f64,
    /// Median spacing of consecutive timestamps.
    pub interval_seconds: f64,
    pub total_samples: usize,
}

/// Estimate the sample rate of an exported table as the inverse of the
/// median timestamp spacing. Exports that only list transitions give a
/// lower bound.
pub fn estimate_sample_rate(df: &DataFrame) -> Result<SampleRate, AnalysisError> {
    let times = df
        .column(TIME_COLUMN_NAME)
        .map_err(|_| AnalysisError::MissingColumn(TIME_COLUMN_NAME.to_string()))?
        .cast(&DataType::Float64)?;
    let times: Vec<f64> = times.f64()?.into_iter().flatten().filter(|t| t.is_finite()).collect();

    let mut intervals: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).filter(|dt| *dt > 0.0).collect();
    if intervals.is_empty() {
        return Err(AnalysisError::NotEnoughSamples("fewer than two distinct timestamps"));
    }
    let interval = median(&mut intervals);
    Ok(SampleRate {
        sample_rate_hz: 1.0 / interval,
        interval_seconds: interval,
        total_samples: times.len(),
    })
}

/// Digital statistics over parallel time/value slices.
pub fn digital_statistics(times: &[f64], values: &[f64], channel: u32) -> Result<DigitalAnalysis, AnalysisError> {
    let n = times.len().min(values.len());
    if n < 2 {
        return Err(AnalysisError::NoSignal {
            channel,
            reason: "fewer than two samples",
        });
    }
    let times = &times[..n];
    let levels: Vec<bool> = values[..n].iter().map(|v| *v > DIGITAL_HIGH_THRESHOLD).collect();

    let mut rising = Vec::new();
    let mut falling = Vec::new();
    for (pair, &t) in levels.windows(2).zip(&times[1..]) {
        match (pair[0], pair[1]) {
            (false, true) => rising.push(t),
            (true, false) => falling.push(t),
            _ => {}
        }
    }
    if rising.len() + falling.len() < 2 {
        return Err(AnalysisError::NoSignal {
            channel,
            reason: "fewer than two edges",
        });
    }

    let mut intervals: Vec<f64> = rising
        .windows(2)
        .chain(falling.windows(2))
        .map(|w| w[1] - w[0])
        .collect();
    let period = if intervals.is_empty() {
        2.0 * (rising[0] - falling[0]).abs()
    } else {
        median(&mut intervals)
    };

    let window = times[n - 1] - times[0];
    if period <= 0.0 || window <= 0.0 {
        return Err(AnalysisError::NoSignal {
            channel,
            reason: "timestamps do not advance",
        });
    }

    let high_time: f64 = times
        .windows(2)
        .zip(&levels)
        .filter(|(_, high)| **high)
        .map(|(w, _)| w[1] - w[0])
        .sum();

    Ok(DigitalAnalysis {
        channel,
        frequency_hz: 1.0 / period,
        period_seconds: period,
        duty_cycle: (high_time / window).clamp(0.0, 1.0),
        rising_edges: rising.len(),
        falling_edges: falling.len(),
        total_samples: n,
        first_level: u8::from(levels[0]),
        last_level: u8::from(levels[n - 1]),
        window_seconds: window,
    })
}

pub fn analog_statistics(values: &[f64], channel: u32) -> Result<AnalogAnalysis, AnalysisError> {
    let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
        return Err(AnalysisError::NoSignal {
            channel,
            reason: "no samples",
        });
    };

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    Ok(AnalogAnalysis {
        channel,
        min_volts: min,
        max_volts: max,
        mean_volts: mean,
        sample_count: values.len(),
        first_volts: first,
        last_volts: last,
    })
}

/// Median of a non-empty slice. Reorders the slice.
fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
