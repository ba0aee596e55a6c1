//! Safety limiter
//!
//! Two checks guard the device under test:
//!   - [`check_pre_send`] runs before a set-point is written. A rejected value is never sent.
//!   - [`check_post_read`] runs on what the bias source actually measured after settling. This is
//!     the authoritative check: a trip ends the run and switches every output off.
//!
//! Ceilings are magnitudes. A gate ceiling of 5 V accepts anything from -5 V to +5 V, which is what
//! the depletion-mode devices on this bench need. An axis without a ceiling is not limited.

use std::{ collections::BTreeMap, fmt };
use serde::Deserialize;

use crate::error::ConfigurationError;

/// The quantity a ceiling applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LimitAxis
{
    Vgate,
    Vdrain,
    /// Drain current
    Current,
    /// Voltage of a specific bias channel
    ChannelVoltage(u8),
    /// Current of a specific bias channel
    ChannelCurrent(u8),
}

impl fmt::Display for LimitAxis
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Vgate => f.write_str("vgate"),
            Self::Vdrain => f.write_str("vdrain"),
            Self::Current => f.write_str("current"),
            Self::ChannelVoltage(channel) => write!(f, "channel {} voltage", channel),
            Self::ChannelCurrent(channel) => write!(f, "channel {} current", channel),
        }
    }
}

/// A value found outside its ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitViolation
{
    pub axis: LimitAxis,
    pub value: f64,
    pub ceiling: f64,
}

impl fmt::Display for LimitViolation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} {} exceeds the ceiling of {}", self.axis, self.value, self.ceiling)
    }
}

impl std::error::Error for LimitViolation {}

/// Decision on a set-point which has not been sent yet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreSend
{
    Approved,
    Rejected(LimitViolation),
}

/// Decision on a measured value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostRead
{
    Ok,
    LimitExceeded(LimitViolation),
}

/// Ceilings of a single bias channel, independent of the role it plays in a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelLimit
{
    pub max_voltage: Option<f64>,
    /// Also programmed into the supply as the channel's current limit before a run starts
    pub max_current: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitConfig
{
    pub max_vgate: Option<f64>,
    pub max_vdrain: Option<f64>,
    pub max_current: Option<f64>,
    pub channels: BTreeMap<u8, ChannelLimit>,
}

impl LimitConfig
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn max_vgate(mut self, ceiling: f64) -> Self
    {
        self.max_vgate = Some(ceiling);
        self
    }

    pub fn max_vdrain(mut self, ceiling: f64) -> Self
    {
        self.max_vdrain = Some(ceiling);
        self
    }

    pub fn max_current(mut self, ceiling: f64) -> Self
    {
        self.max_current = Some(ceiling);
        self
    }

    pub fn channel(mut self, channel: u8, limit: ChannelLimit) -> Self
    {
        self.channels.insert(channel, limit);
        self
    }

    /// The configured ceiling of an axis, if any
    pub fn ceiling_for(&self, axis: LimitAxis) -> Option<f64>
    {
        match axis {
            LimitAxis::Vgate => self.max_vgate,
            LimitAxis::Vdrain => self.max_vdrain,
            LimitAxis::Current => self.max_current,
            LimitAxis::ChannelVoltage(channel) => self.channels.get(&channel).and_then(|lim| lim.max_voltage),
            LimitAxis::ChannelCurrent(channel) => self.channels.get(&channel).and_then(|lim| lim.max_current),
        }
    }

    /// Checks every configured ceiling is a finite, non-negative number
    pub fn validate(&self) -> Result<(), ConfigurationError>
    {
        let mut ceilings = vec![
            (LimitAxis::Vgate, self.max_vgate),
            (LimitAxis::Vdrain, self.max_vdrain),
            (LimitAxis::Current, self.max_current),
        ];

        for (channel, limit) in &self.channels {
            if *channel == 0 {
                return Err(ConfigurationError::InvalidChannel("channel limits start at channel 1".to_string()));
            }
            ceilings.push((LimitAxis::ChannelVoltage(*channel), limit.max_voltage));
            ceilings.push((LimitAxis::ChannelCurrent(*channel), limit.max_current));
        }

        for (axis, ceiling) in ceilings {
            if let Some(value) = ceiling {
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigurationError::InvalidLimit { axis: axis.to_string(), value: value });
                }
            }
        }

        Ok(())
    }
}

fn violation(axis: LimitAxis, value: f64, limit: Option<f64>) -> Option<LimitViolation>
{
    let ceiling = limit?;

    // NaN compares false against everything, so it is caught explicitly
    if value.is_nan() || value.abs() > ceiling {
        Some(LimitViolation { axis: axis, value: value, ceiling: ceiling })
    }
    else {
        None
    }
}

/// Checks a set-point before it is written to an instrument
pub fn check_pre_send(axis: LimitAxis, value: f64, limit: Option<f64>) -> PreSend
{
    match violation(axis, value, limit) {
        Some(reason) => PreSend::Rejected(reason),
        None => PreSend::Approved,
    }
}

/// Checks a value read back from an instrument
pub fn check_post_read(axis: LimitAxis, measured: f64, limit: Option<f64>) -> PostRead
{
    match violation(axis, measured, limit) {
        Some(reason) => PostRead::LimitExceeded(reason),
        None => PostRead::Ok,
    }
}
