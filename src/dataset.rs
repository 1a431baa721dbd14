//! Loading raw exports written by the automation service.
//!
//! A CSV raw export puts `digital.csv` and/or `analog.csv` into the target
//! directory. Both start with a `Time [s]` column followed by one
//! `Channel <n>` column per exported channel. The readers here normalise that
//! into `time` and `channel_<n>` columns of `f64`.

use crate::analysis::{AnalysisError, DIGITAL_HIGH_THRESHOLD};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DIGITAL_EXPORT_FILE: &str = "digital.csv";
pub const ANALOG_EXPORT_FILE: &str = "analog.csv";

pub const TIME_COLUMN_NAME: &str = "time";
const EXPORT_TIME_HEADER: &str = "Time [s]";
const EXPORT_CHANNEL_PREFIX: &str = "Channel ";

/// Column holding samples of `channel` after loading.
pub fn channel_column(channel: u32) -> String {
    format!("channel_{channel}")
}

/// Channel index of an export header like `Channel 3`.
fn parse_channel_header(header: &str) -> Option<u32> {
    header
        .trim()
        .strip_prefix(EXPORT_CHANNEL_PREFIX)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

pub fn digital_export_path(directory: &Path) -> PathBuf {
    directory.join(DIGITAL_EXPORT_FILE)
}

pub fn analog_export_path(directory: &Path) -> PathBuf {
    directory.join(ANALOG_EXPORT_FILE)
}

pub fn read_digital_csv(path: &Path) -> Result<DataFrame, AnalysisError> {
    read_export_csv(path)
}

pub fn read_analog_csv(path: &Path) -> Result<DataFrame, AnalysisError> {
    read_export_csv(path)
}

fn read_export_csv(path: &Path) -> Result<DataFrame, AnalysisError> {
    log::debug!("Reading exported samples from {}", path.display());

    let raw = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let headers: Vec<String> = raw
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let time_header = headers
        .iter()
        .find(|h| h.trim() == EXPORT_TIME_HEADER || h.trim() == TIME_COLUMN_NAME)
        .ok_or_else(|| AnalysisError::MissingColumn(EXPORT_TIME_HEADER.to_string()))?;

    let mut columns = vec![col(time_header.as_str())
        .cast(DataType::Float64)
        .alias(TIME_COLUMN_NAME)];
    columns.extend(headers.iter().filter_map(|header| {
        let channel = parse_channel_header(header)?;
        Some(col(header.as_str()).cast(DataType::Float64).alias(channel_column(channel)))
    }));

    let df = raw.lazy().select(columns).collect()?;
    log::debug!("Loaded {} rows, columns {:?}", df.height(), df.get_column_names());
    Ok(df)
}

/// Inclusive time bounds in seconds. Either side may be left open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
}

impl TimeWindow {
    pub fn new(start_time: Option<f64>, end_time: Option<f64>) -> Self {
        Self { start_time, end_time }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start_time.is_none() && self.end_time.is_none()
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        let invalid = |reason: String| Err(AnalysisError::InvalidWindow(reason));
        for bound in [self.start_time, self.end_time].into_iter().flatten() {
            if !bound.is_finite() {
                return invalid(format!("bound {bound} is not a finite time"));
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return invalid(format!("start_time {start} is after end_time {end}"));
            }
        }
        Ok(())
    }

    /// Rows of `df` whose `time` lies inside the window.
    pub fn select(&self, df: DataFrame) -> Result<DataFrame, AnalysisError> {
        self.validate()?;
        let lower = self.start_time.map(|t| col(TIME_COLUMN_NAME).gt_eq(lit(t)));
        let upper = self.end_time.map(|t| col(TIME_COLUMN_NAME).lt_eq(lit(t)));
        let predicate = match (lower, upper) {
            (Some(lower), Some(upper)) => lower.and(upper),
            (Some(bound), None) | (None, Some(bound)) => bound,
            (None, None) => return Ok(df),
        };
        let selected = df.lazy().filter(predicate).collect()?;
        log::debug!(
            "Time window {:?}..={:?} keeps {} rows",
            self.start_time,
            self.end_time,
            selected.height()
        );
        Ok(selected)
    }
}

/// One exported sample of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample<V> {
    pub time: f64,
    pub value: V,
}

/// Times and values of `channel`, in row order. Rows with a missing or
/// non-finite time or value are skipped.
pub fn channel_samples(df: &DataFrame, channel: u32) -> Result<(Vec<f64>, Vec<f64>), AnalysisError> {
    let name = channel_column(channel);
    let values = df
        .column(&name)
        .map_err(|_| AnalysisError::ChannelNotFound { channel })?
        .cast(&DataType::Float64)?;
    let times = df
        .column(TIME_COLUMN_NAME)
        .map_err(|_| AnalysisError::MissingColumn(TIME_COLUMN_NAME.to_string()))?
        .cast(&DataType::Float64)?;

    let (times, values) = times
        .f64()?
        .into_iter()
        .zip(values.f64()?.into_iter())
        .filter_map(|(t, v)| Some((t?, v?)))
        .filter(|(t, v)| t.is_finite() && v.is_finite())
        .unzip();
    Ok((times, values))
}

/// Logic levels of a digital channel, `1` above [`DIGITAL_HIGH_THRESHOLD`].
pub fn digital_samples(df: &DataFrame, channel: u32) -> Result<Vec<Sample<u8>>, AnalysisError> {
    let (times, values) = channel_samples(df, channel)?;
    Ok(times
        .into_iter()
        .zip(values)
        .map(|(time, v)| Sample {
            time,
            value: u8::from(v > DIGITAL_HIGH_THRESHOLD),
        })
        .collect())
}

pub fn analog_samples(df: &DataFrame, channel: u32) -> Result<Vec<Sample<f64>>, AnalysisError> {
    let (times, values) = channel_samples(df, channel)?;
    Ok(times
        .into_iter()
        .zip(values)
        .map(|(time, value)| Sample { time, value })
        .collect())
}
