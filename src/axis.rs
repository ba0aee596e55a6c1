//! Sweep axis generation
//!
//! An axis is the inclusive arithmetic progression `start, start + step, ...` up to `end`, the way
//! a bench operator types it into a sweep form. Values are computed from their index rather than by
//! repeated addition and rounded to six fractional digits, so `0.1` steps land on `0.3` and not on
//! `0.30000000000000004`.

use std::str::FromStr;

use crate::error::ConfigurationError;

/// Fractional digits kept on every generated value
pub const AXIS_PRECISION: i32 = 6;

/// Upper bound on the number of points in one axis
pub const MAX_AXIS_POINTS: usize = 1_000_000;

/// Smallest step magnitude that still yields distinct values after rounding
pub const MIN_AXIS_STEP: f64 = 1e-6;

fn round_to_precision(value: f64) -> f64
{
    let scale = 10f64.powi(AXIS_PRECISION);
    let rounded = (value * scale).round() / scale;

    // -0.0 would be sent as "-0"
    if rounded == 0.0 { 0.0 } else { rounded }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepAxis
{
    start: f64,
    step: f64,
    end: f64,
}

impl SweepAxis
{
    pub fn new(start: f64, step: f64, end: f64) -> Result<Self, ConfigurationError>
    {
        if !start.is_finite() || !step.is_finite() || !end.is_finite() {
            return Err(ConfigurationError::InvalidAxis(format!(
                "start {}, step {} and end {} must all be finite", start, step, end
            )));
        }

        if step == 0.0 {
            return Err(ConfigurationError::InvalidAxis("step must not be zero".to_string()));
        }

        if step.abs() < MIN_AXIS_STEP {
            return Err(ConfigurationError::InvalidAxis(format!(
                "step {} is finer than the {} resolution of an axis", step, MIN_AXIS_STEP
            )));
        }

        let estimate = ((end - start) / step).floor();
        if estimate >= MAX_AXIS_POINTS as f64 {
            return Err(ConfigurationError::InvalidAxis(format!(
                "{} to {} in steps of {} exceeds {} points", start, end, step, MAX_AXIS_POINTS
            )));
        }

        Ok(Self { start: start, step: step, end: end })
    }

    /// An axis holding exactly one value
    pub fn single(value: f64) -> Result<Self, ConfigurationError>
    {
        Self::new(value, 1.0, value)
    }

    /// Parses the three fields of an axis as typed by an operator
    pub fn from_text(start: &str, step: &str, end: &str) -> Result<Self, ConfigurationError>
    {
        let start = parse_field("start", start)?;
        let step = parse_field("step", step)?;
        let end = parse_field("end", end)?;

        Self::new(start, step, end)
    }

    pub fn start(&self) -> f64
    {
        self.start
    }

    pub fn step(&self) -> f64
    {
        self.step
    }

    pub fn end(&self) -> f64
    {
        self.end
    }

    fn value_at(&self, index: usize) -> f64
    {
        round_to_precision(self.start + index as f64 * self.step)
    }

    fn within_end(&self, value: f64) -> bool
    {
        let end = round_to_precision(self.end);

        if self.step > 0.0 { value <= end } else { value >= end }
    }

    /// The ordered set-points of this axis. `start` is always the first value, even if it already
    /// lies past `end`.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_
    {
        (0..MAX_AXIS_POINTS)
            .map(move |index| (index, self.value_at(index)))
            .take_while(move |(index, value)| *index == 0 || self.within_end(*value))
            .map(|(_, value)| value)
    }

    /// Number of values [`values`](Self::values) yields. Never zero.
    pub fn len(&self) -> usize
    {
        self.values().count()
    }

    pub fn to_vec(&self) -> Vec<f64>
    {
        self.values().collect()
    }
}

impl FromStr for SweepAxis
{
    type Err = ConfigurationError;

    /// Parses `start:step:end`
    fn from_str(text: &str) -> Result<Self, Self::Err>
    {
        let fields: Vec<&str> = text.split(':').collect();

        match fields.as_slice() {
            [start, step, end] => Self::from_text(start, step, end),
            _ => Err(ConfigurationError::InvalidAxis(format!("expected start:step:end, got {:?}", text))),
        }
    }
}

fn parse_field(field: &'static str, text: &str) -> Result<f64, ConfigurationError>
{
    text.trim()
        .parse::<f64>()
        .map_err(|_| ConfigurationError::NotNumeric { field: field, text: text.to_string() })
}

/// Generates the set-points of the axis `(start, step, end)`
pub fn generate(start: f64, step: f64, end: f64) -> Result<Vec<f64>, ConfigurationError>
{
    Ok(SweepAxis::new(start, step, end)?.to_vec())
}
