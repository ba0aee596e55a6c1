//! Error types shared across the crate
//!
//! Faults are split by how far they reach:
//!   - [`ConfigurationError`] rejects a sweep before anything is sent to an instrument
//!   - [`InstrumentError`] describes one failed write or query. Inside a running sweep most of
//!     these only cost a single field of a single sample; the sweep decides which ones are fatal.
//!   - [`StartError`] and [`BenchError`] are returned by the engine's control surface
//!
//! Run-scoped faults (limit trips, bias channel faults) are not errors at all from the caller's
//! point of view. They end the run and are reported through
//! [`RunOutcome`](crate::sweep::RunOutcome).

use std::{ io, time::Duration };
use thiserror::Error;

use crate::{
    limits::LimitViolation,
    reply::FormatError,
    sweep::{ ChannelFault, ShutdownFailure, SweepState },
};

/// Bad axis, limit, calibration or channel input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError
{
    #[error("invalid sweep axis: {0}")]
    InvalidAxis(String),
    #[error("`{field}` is not a number: {text:?}")]
    NotNumeric { field: &'static str, text: String },
    #[error("`{0}` must be configured before a sweep can start")]
    Missing(&'static str),
    #[error("invalid {axis} ceiling: {value}")]
    InvalidLimit { axis: String, value: f64 },
    #[error("calibration offset `{field}` must be finite, got {value}")]
    InvalidCalibration { field: &'static str, value: f64 },
    #[error("invalid channel assignment: {0}")]
    InvalidChannel(String),
    #[error("invalid settle time `{field}`: {reason}")]
    InvalidTiming { field: &'static str, reason: String },
    #[error("{0}")]
    Unsupported(String),
    #[error("unable to read configuration: {0}")]
    Parse(String),
}

/// A single failed exchange with an instrument
#[derive(Debug, Error)]
pub enum InstrumentError
{
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply. {0}")]
    Malformed(#[from] FormatError),
    #[error("reply is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("instrument refused the command: {0}")]
    Refused(String),
}

/// Reasons [`SweepEngine::start`](crate::sweep::SweepEngine::start) refuses to begin a run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StartError
{
    #[error("a sweep is already active (state {0:?})")]
    AlreadyActive(SweepState),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("no tokio runtime to run the sweep on")]
    NoRuntime,
}

/// Failures of the out-of-band bench operations (single set-point, channel monitor)
#[derive(Debug, Error)]
pub enum BenchError
{
    #[error("the bench is busy with a sweep (state {0:?})")]
    Busy(SweepState),
    #[error("set-point rejected: {0}")]
    LimitRejected(LimitViolation),
    /// A bias channel failed to select or enable. Every channel enabled so far was switched off
    /// again, except those listed in `shutdown_failures`.
    #[error("{fault}")]
    ChannelFault { fault: ChannelFault, shutdown_failures: Vec<ShutdownFailure> },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

/// A record sink could not accept a sample
#[derive(Debug, Error)]
pub enum SinkError
{
    #[error("record receiver has been dropped")]
    Closed,
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}
