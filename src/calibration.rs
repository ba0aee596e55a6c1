//! Calibration model
//!
//! Raw readings are taken at the generator output and at the power meter, neither of which is the
//! device under test. The profile moves them to the device's ports:
//!
//! ```text
//! power_in_actual  = raw_in  - input_loss_db + input_gain_db
//! power_out_actual = raw_out + output_loss_db
//! ```
//!
//! Gain, power-added efficiency and gain compression are derived from the corrected values.

use serde::{ Deserialize, Serialize };

use crate::error::ConfigurationError;

/// PAE reported when the DC power is zero or negative
pub const PAE_UNDEFINED: f64 = -1.0;

/// Fixed dB corrections for the RF measurement path
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationProfile
{
    /// Cable and attenuator loss between generator and device input
    pub input_loss_db: f64,
    /// Gain of any driver amplifier between generator and device input
    pub input_gain_db: f64,
    /// Loss between device output and power meter, added back to the reading
    pub output_loss_db: f64,
}

impl CalibrationProfile
{
    pub fn validate(&self) -> Result<(), ConfigurationError>
    {
        let fields = [
            ("input_loss_db", self.input_loss_db),
            ("input_gain_db", self.input_gain_db),
            ("output_loss_db", self.output_loss_db),
        ];

        for (field, value) in fields {
            if !value.is_finite() {
                return Err(ConfigurationError::InvalidCalibration { field: field, value: value });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedPower
{
    pub power_in_actual_dbm: f64,
    pub power_out_actual_dbm: f64,
}

pub fn correct(raw_in_dbm: f64, raw_out_dbm: f64, profile: &CalibrationProfile) -> CorrectedPower
{
    CorrectedPower {
        power_in_actual_dbm: raw_in_dbm - profile.input_loss_db + profile.input_gain_db,
        power_out_actual_dbm: raw_out_dbm + profile.output_loss_db,
    }
}

/// Inverse of [`correct`]. Returns `(raw_in_dbm, raw_out_dbm)`.
pub fn restore_raw(corrected: &CorrectedPower, profile: &CalibrationProfile) -> (f64, f64)
{
    (
        corrected.power_in_actual_dbm - profile.input_gain_db + profile.input_loss_db,
        corrected.power_out_actual_dbm - profile.output_loss_db,
    )
}

pub fn to_milliwatts(dbm: f64) -> f64
{
    10f64.powf(dbm / 10.0)
}

/// Power-added efficiency in percent
///
/// `(P_out - P_in) / (V_d * I_d)` with RF powers in milliwatts. Returns [`PAE_UNDEFINED`] when the
/// DC power is not positive or the result is not a finite number.
pub fn pae_percent(pout_mw: f64, pin_mw: f64, vd: f64, id: f64) -> f64
{
    let dc_power = vd * id;

    if !(dc_power > 0.0) {
        return PAE_UNDEFINED;
    }

    let pae = (pout_mw / 1000.0 - pin_mw / 1000.0) * 100.0 / dc_power;

    if pae.is_finite() { pae } else { PAE_UNDEFINED }
}

/// Gain compression relative to the first gain of a run
///
/// A fresh tracker is created for every run so that a reference never leaks from one run into the
/// next.
#[derive(Debug, Clone, Default)]
pub struct CompressionTracker
{
    reference_gain_db: Option<f64>,
}

impl CompressionTracker
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn reference(&self) -> Option<f64>
    {
        self.reference_gain_db
    }

    pub fn reset(&mut self)
    {
        self.reference_gain_db = None;
    }

    /// Feeds the gain of a sample. The first gain becomes the reference and has no compression.
    pub fn observe(&mut self, gain_db: f64) -> Option<f64>
    {
        match self.reference_gain_db {
            Some(reference) => Some(reference - gain_db),
            None => {
                self.reference_gain_db = Some(gain_db);
                None
            },
        }
    }
}

/// Everything derived from one sample's raw readings
///
/// A field is `None` when a reading it depends on is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RfMetrics
{
    pub power_in_actual_dbm: Option<f64>,
    pub power_out_actual_dbm: Option<f64>,
    pub power_in_actual_mw: Option<f64>,
    pub power_out_actual_mw: Option<f64>,
    pub gain_db: Option<f64>,
    pub compression_db: Option<f64>,
    pub pae_percent: Option<f64>,
}

fn finite(value: Option<f64>) -> Option<f64>
{
    value.filter(|v| v.is_finite())
}

/// Derives the RF metrics of one sample
///
/// `vd` is the drain voltage set-point and `id` the measured drain current.
pub fn derive(
    raw_in_dbm: Option<f64>,
    raw_out_dbm: Option<f64>,
    vd: f64,
    id: Option<f64>,
    profile: &CalibrationProfile,
    tracker: &mut CompressionTracker,
) -> RfMetrics
{
    let raw_in = finite(raw_in_dbm);
    let raw_out = finite(raw_out_dbm);

    let power_in_actual_dbm = raw_in.map(|raw| raw - profile.input_loss_db + profile.input_gain_db);
    let power_out_actual_dbm = raw_out.map(|raw| raw + profile.output_loss_db);
    let power_in_actual_mw = power_in_actual_dbm.map(to_milliwatts);
    let power_out_actual_mw = power_out_actual_dbm.map(to_milliwatts);

    let gain_db = match (power_in_actual_dbm, power_out_actual_dbm) {
        (Some(pin), Some(pout)) => Some(pout - pin),
        _ => None,
    };

    let compression_db = gain_db.and_then(|gain| tracker.observe(gain));

    let pae = match (power_in_actual_mw, power_out_actual_mw, finite(id)) {
        (Some(pin), Some(pout), Some(id)) => Some(pae_percent(pout, pin, vd, id)),
        _ => None,
    };

    RfMetrics {
        power_in_actual_dbm: power_in_actual_dbm,
        power_out_actual_dbm: power_out_actual_dbm,
        power_in_actual_mw: power_in_actual_mw,
        power_out_actual_mw: power_out_actual_mw,
        gain_db: gain_db,
        compression_db: compression_db,
        pae_percent: pae,
    }
}
