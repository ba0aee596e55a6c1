//! Sweep plan editing and validation
//!
//! A [`SweepPlan`] caches every parameter of a run. Nothing is checked until the plan is compiled
//! against the [`Capabilities`] of a bench, which produces the concrete set-point lists the sweep
//! executes. Compiling has no side effects, so a bad plan never reaches an instrument.

use std::time::Duration;

use crate::{
    axis::SweepAxis,
    calibration::CalibrationProfile,
    error::ConfigurationError,
    limits::LimitConfig,
};

/// What is attached to the bench
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities
{
    pub bias_channels: u8,
    pub rf_source: bool,
    pub power_meter: bool,
}

/// Bias source channels wired to the gate and drain of the device under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAssignment
{
    pub vgate: u8,
    pub vdrain: u8,
}

/// Waits between a commanded change and the measurement that depends on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTiming
{
    pub vgate: Duration,
    pub vdrain: Duration,
    /// After the RF source has been switched back on at a new level
    pub rf_power: Duration,
    /// Between reading the RF source and reading the power meter
    pub meter: Duration,
}

impl Default for SettleTiming
{
    fn default() -> Self
    {
        Self {
            vgate: Duration::from_secs(1),
            vdrain: Duration::from_secs(1),
            rf_power: Duration::from_secs(1),
            meter: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepPlan
{
    vgate: Option<SweepAxis>,
    vdrain: Option<SweepAxis>,
    rf_power: Option<SweepAxis>,
    rf_frequency_hz: Option<f64>,
    channels: Option<ChannelAssignment>,
    limits: Option<LimitConfig>,
    calibration: Option<CalibrationProfile>,
    timing: SettleTiming,
}

impl SweepPlan
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn vgate_axis(mut self, axis: SweepAxis) -> Self
    {
        self.vgate = Some(axis);
        self
    }

    pub fn vdrain_axis(mut self, axis: SweepAxis) -> Self
    {
        self.vdrain = Some(axis);
        self
    }

    /// Outer RF power axis in dBm. Without one, the bias sweep runs once and the RF source (if
    /// any) is left at whatever level it is at.
    pub fn rf_power_axis(mut self, axis: SweepAxis) -> Self
    {
        self.rf_power = Some(axis);
        self
    }

    /// Carrier frequency programmed once before the run starts
    pub fn rf_frequency_hz(mut self, hz: f64) -> Self
    {
        self.rf_frequency_hz = Some(hz);
        self
    }

    pub fn channels(mut self, vgate: u8, vdrain: u8) -> Self
    {
        self.channels = Some(ChannelAssignment { vgate: vgate, vdrain: vdrain });
        self
    }

    pub fn limits(mut self, limits: LimitConfig) -> Self
    {
        self.limits = Some(limits);
        self
    }

    pub fn calibration(mut self, profile: CalibrationProfile) -> Self
    {
        self.calibration = Some(profile);
        self
    }

    pub fn timing(mut self, timing: SettleTiming) -> Self
    {
        self.timing = timing;
        self
    }

    pub fn limit_config(&self) -> Option<&LimitConfig>
    {
        self.limits.as_ref()
    }

    pub fn channel_assignment(&self) -> Option<ChannelAssignment>
    {
        self.channels
    }

    /// Validates the plan against a bench and expands its axes
    pub fn compile(&self, caps: &Capabilities) -> Result<CompiledPlan, ConfigurationError>
    {
        let vgate = self.vgate.ok_or(ConfigurationError::Missing("vgate axis"))?;
        let vdrain = self.vdrain.ok_or(ConfigurationError::Missing("vdrain axis"))?;
        let channels = self.channels.ok_or(ConfigurationError::Missing("channels"))?;
        let limits = self.limits.clone().ok_or(ConfigurationError::Missing("limits"))?;
        let calibration = self.calibration.ok_or(ConfigurationError::Missing("calibration"))?;

        validate_channels(&channels, caps.bias_channels)?;
        limits.validate()?;
        calibration.validate()?;

        for channel in limits.channels.keys() {
            if *channel > caps.bias_channels {
                return Err(ConfigurationError::InvalidChannel(format!(
                    "limit given for channel {} but the bias source has {}", channel, caps.bias_channels
                )));
            }
        }

        if !caps.rf_source && (self.rf_power.is_some() || self.rf_frequency_hz.is_some()) {
            return Err(ConfigurationError::Unsupported(
                "the plan sets RF power or frequency but no RF source is attached".to_string()
            ));
        }

        if let Some(hz) = self.rf_frequency_hz {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(ConfigurationError::InvalidAxis(format!("RF frequency {} Hz", hz)));
            }
        }

        let rf_power = match self.rf_power {
            Some(axis) => axis.values().map(Some).collect(),
            None => vec![None],
        };

        Ok(CompiledPlan {
            vgate: vgate.to_vec(),
            vdrain: vdrain.to_vec(),
            rf_power: rf_power,
            rf_frequency_hz: self.rf_frequency_hz,
            channels: channels,
            limits: limits,
            calibration: calibration,
            timing: self.timing,
        })
    }
}

pub(crate) fn validate_channels(channels: &ChannelAssignment, available: u8) -> Result<(), ConfigurationError>
{
    for (role, channel) in [("vgate", channels.vgate), ("vdrain", channels.vdrain)] {
        if channel == 0 || channel > available {
            return Err(ConfigurationError::InvalidChannel(format!(
                "{} channel {} is outside 1..={}", role, channel, available
            )));
        }
    }

    if channels.vgate == channels.vdrain {
        return Err(ConfigurationError::InvalidChannel(format!(
            "vgate and vdrain cannot share channel {}", channels.vgate
        )));
    }

    Ok(())
}

/// A validated plan with its axes expanded into set-points
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan
{
    pub vgate: Vec<f64>,
    pub vdrain: Vec<f64>,
    /// `None` is a single pass which does not touch the RF source level
    pub rf_power: Vec<Option<f64>>,
    pub rf_frequency_hz: Option<f64>,
    pub channels: ChannelAssignment,
    pub limits: LimitConfig,
    pub calibration: CalibrationProfile,
    pub timing: SettleTiming,
}

impl CompiledPlan
{
    /// Number of records a run of this plan produces if nothing stops it early
    pub fn point_count(&self) -> usize
    {
        self.rf_power.len() * self.vgate.len() * self.vdrain.len()
    }
}
