//! TOML configuration of a sweep
//!
//! ```toml
//! [channels]
//! vgate = 1
//! vdrain = 2
//!
//! [vgate]
//! start = -2.0
//! step = 0.5
//! end = 0.0
//!
//! [vdrain]
//! start = 0.0
//! step = 4.0
//! end = 28.0
//!
//! [rf]
//! frequency_hz = 2.4e9
//! power = { start = -20.0, step = 2.0, end = 0.0 }
//!
//! [limits]
//! max_vgate = 5.0
//! max_vdrain = 32.0
//! max_current = 0.6
//! channels.2 = { max_current = 0.8 }
//!
//! [calibration]
//! input_loss_db = 1.2
//! input_gain_db = 20.0
//! output_loss_db = 30.5
//!
//! [timing]
//! vgate_settle_s = 1.0
//! vdrain_settle_s = 1.0
//! rf_settle_s = 1.0
//! meter_settle_s = 0.5
//!
//! [ports]
//! bias = "/dev/ttyUSB0"
//! rf = "/dev/ttyUSB1"
//! meter = "/dev/ttyACM0"
//! ```

use std::{ collections::BTreeMap, path::Path, str::FromStr, time::Duration };
use serde::Deserialize;

use crate::{
    axis::SweepAxis,
    calibration::CalibrationProfile,
    error::ConfigurationError,
    limits::{ ChannelLimit, LimitConfig },
    plan::{ SettleTiming, SweepPlan },
};

/// Root of a sweep configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig
{
    pub channels: Option<ChannelsConfig>,
    pub vgate: Option<AxisConfig>,
    pub vdrain: Option<AxisConfig>,
    #[serde(default)]
    pub rf: RfConfig,
    pub limits: Option<LimitsConfig>,
    pub calibration: Option<CalibrationProfile>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub ports: PortsConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelsConfig
{
    pub vgate: u8,
    pub vdrain: u8,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisConfig
{
    pub start: f64,
    pub step: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RfConfig
{
    pub frequency_hz: Option<f64>,
    pub power: Option<AxisConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig
{
    pub max_vgate: Option<f64>,
    pub max_vdrain: Option<f64>,
    pub max_current: Option<f64>,
    /// Keyed by channel number. TOML table keys are always strings.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelLimit>,
}

/// Settle times in seconds
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig
{
    pub vgate_settle_s: Option<f64>,
    pub vdrain_settle_s: Option<f64>,
    pub rf_settle_s: Option<f64>,
    pub meter_settle_s: Option<f64>,
}

/// Serial ports of the instruments, used by the `pasweep` runner
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortsConfig
{
    pub bias: Option<String>,
    pub rf: Option<String>,
    pub meter: Option<String>,
    pub baud_rate: Option<u32>,
    /// Reply timeout of every query in milliseconds
    pub timeout_ms: Option<u64>,
    /// Number of channels of the bias supply
    pub bias_channels: Option<u8>,
}

impl SweepConfig
{
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError>
    {
        let content = std::fs::read_to_string(path)
            .map_err(|err| ConfigurationError::Parse(format!("{}: {}", path.display(), err)))?;

        content.parse()
    }

    /// Builds the sweep plan described by this configuration
    ///
    /// Only conversions are checked here. Whether the plan fits a bench is decided by
    /// [`SweepPlan::compile`].
    pub fn to_plan(&self) -> Result<SweepPlan, ConfigurationError>
    {
        let mut plan = SweepPlan::new().timing(self.timing.to_settle_timing()?);

        if let Some(axis) = &self.vgate {
            plan = plan.vgate_axis(axis.to_axis()?);
        }

        if let Some(axis) = &self.vdrain {
            plan = plan.vdrain_axis(axis.to_axis()?);
        }

        if let Some(axis) = &self.rf.power {
            plan = plan.rf_power_axis(axis.to_axis()?);
        }

        if let Some(hz) = self.rf.frequency_hz {
            plan = plan.rf_frequency_hz(hz);
        }

        if let Some(channels) = self.channels {
            plan = plan.channels(channels.vgate, channels.vdrain);
        }

        if let Some(limits) = &self.limits {
            plan = plan.limits(limits.to_limit_config()?);
        }

        if let Some(profile) = self.calibration {
            plan = plan.calibration(profile);
        }

        Ok(plan)
    }
}

impl FromStr for SweepConfig
{
    type Err = ConfigurationError;

    fn from_str(content: &str) -> Result<Self, Self::Err>
    {
        toml::from_str(content).map_err(|err| ConfigurationError::Parse(err.to_string()))
    }
}

impl AxisConfig
{
    pub fn to_axis(&self) -> Result<SweepAxis, ConfigurationError>
    {
        SweepAxis::new(self.start, self.step, self.end)
    }
}

impl LimitsConfig
{
    pub fn to_limit_config(&self) -> Result<LimitConfig, ConfigurationError>
    {
        let mut channels = BTreeMap::new();

        for (key, limit) in &self.channels {
            let channel = key
                .trim()
                .parse::<u8>()
                .map_err(|_| ConfigurationError::InvalidChannel(format!("{:?} is not a channel number", key)))?;
            channels.insert(channel, *limit);
        }

        Ok(LimitConfig {
            max_vgate: self.max_vgate,
            max_vdrain: self.max_vdrain,
            max_current: self.max_current,
            channels: channels,
        })
    }
}

impl TimingConfig
{
    pub fn to_settle_timing(&self) -> Result<SettleTiming, ConfigurationError>
    {
        let defaults = SettleTiming::default();

        Ok(SettleTiming {
            vgate: seconds("vgate_settle_s", self.vgate_settle_s, defaults.vgate)?,
            vdrain: seconds("vdrain_settle_s", self.vdrain_settle_s, defaults.vdrain)?,
            rf_power: seconds("rf_settle_s", self.rf_settle_s, defaults.rf_power)?,
            meter: seconds("meter_settle_s", self.meter_settle_s, defaults.meter)?,
        })
    }
}

fn seconds(field: &'static str, value: Option<f64>, default: Duration) -> Result<Duration, ConfigurationError>
{
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|err| ConfigurationError::InvalidTiming { field: field, reason: err.to_string() }),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::plan::Capabilities;

    const FULL: &str = r#"
        [channels]
        vgate = 1
        vdrain = 2

        [vgate]
        start = 2.0
        step = -1.0
        end = 0.0

        [vdrain]
        start = 0.0
        step = 5.0
        end = 10.0

        [rf]
        frequency_hz = 2.4e9
        power = { start = -20.0, step = 10.0, end = 0.0 }

        [limits]
        max_vgate = 5.0
        max_current = 0.6
        channels.2 = { max_voltage = 32.0, max_current = 0.8 }

        [calibration]
        input_loss_db = 1.5
        output_loss_db = 30.0

        [timing]
        vdrain_settle_s = 0.25

        [ports]
        bias = "/dev/ttyUSB0"
        baud_rate = 115200
    "#;

    #[test]
    fn full_config_compiles()
    {
        let config: SweepConfig = FULL.parse().unwrap();
        let caps = Capabilities { bias_channels: 4, rf_source: true, power_meter: true };
        let compiled = config.to_plan().unwrap().compile(&caps).unwrap();

        assert_eq!(compiled.vgate, vec![2.0, 1.0, 0.0]);
        assert_eq!(compiled.vdrain, vec![0.0, 5.0, 10.0]);
        assert_eq!(compiled.rf_power, vec![Some(-20.0), Some(-10.0), Some(0.0)]);
        assert_eq!(compiled.rf_frequency_hz, Some(2.4e9));
        assert_eq!(compiled.limits.max_current, Some(0.6));
        assert_eq!(compiled.limits.channels[&2].max_voltage, Some(32.0));
        assert_eq!(compiled.calibration.input_gain_db, 0.0);
        assert_eq!(compiled.calibration.output_loss_db, 30.0);
        assert_eq!(compiled.timing.vdrain, Duration::from_millis(250));
        assert_eq!(compiled.timing.meter, Duration::from_millis(500));
        assert_eq!(config.ports.bias.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.ports.baud_rate, Some(115200));
    }

    #[test]
    fn empty_config_is_missing_everything()
    {
        let config: SweepConfig = "".parse().unwrap();
        let caps = Capabilities { bias_channels: 4, rf_source: false, power_meter: false };

        assert_eq!(
            config.to_plan().unwrap().compile(&caps),
            Err(ConfigurationError::Missing("vgate axis"))
        );
    }

    #[test]
    fn non_numeric_value_is_a_parse_error()
    {
        let err = "[vgate]\nstart = \"abc\"\nstep = 1.0\nend = 2.0\n".parse::<SweepConfig>().unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse(_)));
    }

    #[test]
    fn unknown_keys_are_rejected()
    {
        assert!("[limits]\nmax_curent = 0.5\n".parse::<SweepConfig>().is_err());
    }

    #[test]
    fn misspelled_channel_limit_is_rejected()
    {
        let err = "[limits]\nchannels.2 = { max_curent = 0.8 }\n".parse::<SweepConfig>().unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse(_)));
    }

    #[test]
    fn zero_step_is_caught_on_conversion()
    {
        let config: SweepConfig = "[vdrain]\nstart = 0.0\nstep = 0.0\nend = 5.0\n".parse().unwrap();
        assert!(matches!(config.to_plan(), Err(ConfigurationError::InvalidAxis(_))));
    }

    #[test]
    fn bad_channel_key_and_timing()
    {
        let config: SweepConfig = "[limits]\nchannels.gate = { max_current = 0.1 }\n".parse().unwrap();
        assert!(matches!(config.to_plan(), Err(ConfigurationError::InvalidChannel(_))));

        let config: SweepConfig = "[timing]\nmeter_settle_s = -1.0\n".parse().unwrap();
        assert!(matches!(
            config.to_plan(),
            Err(ConfigurationError::InvalidTiming { field: "meter_settle_s", .. })
        ));
    }
}
