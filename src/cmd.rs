//! Device command definition and serialization
//!
//! All three instrument families speak SCPI, but not the same subset of it. Each family gets a
//! display delegate which knows how to spell the commands it supports. Asking a delegate to spell
//! a command its instrument does not have is a programming error and panics, the same way it would
//! be meaningless to ask a power meter to select a bias channel.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum CmdSet
{
    /// Ask the instrument to identify itself
    ///
    /// Command: `*IDN?`
    Identify,
    /// Direct subsequent set/measure commands at a bias channel
    ///
    /// Command: `INST:NSEL <channel>`
    SelectChannel(u8),
    /// Voltage set-point of the selected channel in volts
    ///
    /// Command: `VOLT <volts>`
    SetVoltage(f64),
    /// Current limit of the selected channel in amperes
    ///
    /// Command: `CURR <amps>`
    SetCurrent(f64),
    /// Switch the output of the selected channel (bias source) or the RF output (signal generator)
    ///
    /// Command: `OUTP <ON|OFF>`
    SetOutput(bool),
    /// Command: `MEAS:CURR?`
    MeasureCurrent,
    /// Command: `MEAS:VOLT?`
    MeasureVoltage,
    /// Carrier frequency in hertz
    ///
    /// Command: `FREQ <hz> Hz`
    SetFrequency(f64),
    /// RF output level in dBm
    ///
    /// Command: `POW <dbm> dBm`
    SetPower(f64),
    /// Command: `FREQ?`
    QueryFrequency,
    /// Command: `POW?`
    QueryPower,
    /// Take a power reading in dBm. The spelling depends on the power meter model.
    MeasurePower,
}

fn display_common(cmd: &CmdSet, f: &mut fmt::Formatter<'_>) -> fmt::Result
{
    match cmd {
        CmdSet::Identify => write!(f, "*IDN?"),
        CmdSet::SetOutput(enabled) => write!(f, "OUTP {}", if *enabled { "ON" } else { "OFF" }),
        other => panic!("`{:?}` is not supported by this instrument", other),
    }
}

/// Multi-channel bias supply (R&S NGP800 series)
pub struct Ngp800Display
{
    cmd: CmdSet,
}

impl fmt::Display for Ngp800Display
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.cmd {
            CmdSet::SelectChannel(channel) => write!(f, "INST:NSEL {}", channel),
            CmdSet::SetVoltage(volts) => write!(f, "VOLT {}", volts),
            CmdSet::SetCurrent(amps) => write!(f, "CURR {}", amps),
            CmdSet::MeasureCurrent => write!(f, "MEAS:CURR?"),
            CmdSet::MeasureVoltage => write!(f, "MEAS:VOLT?"),
            _ => display_common(&self.cmd, f),
        }
    }
}

/// RF signal generator (Keysight N5173B EXG)
pub struct N5173bDisplay
{
    cmd: CmdSet,
}

impl fmt::Display for N5173bDisplay
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.cmd {
            CmdSet::SetFrequency(hz) => write!(f, "FREQ {} Hz", hz),
            CmdSet::SetPower(dbm) => write!(f, "POW {} dBm", dbm),
            CmdSet::QueryFrequency => write!(f, "FREQ?"),
            CmdSet::QueryPower => write!(f, "POW?"),
            _ => display_common(&self.cmd, f),
        }
    }
}

/// R&S NRX power meter base unit
pub struct NrxDisplay
{
    cmd: CmdSet,
}

impl fmt::Display for NrxDisplay
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.cmd {
            CmdSet::MeasurePower => write!(f, "MEAS:POW?"),
            _ => display_common(&self.cmd, f),
        }
    }
}

/// R&S NRP2 power meter
pub struct Nrp2Display
{
    cmd: CmdSet,
}

impl fmt::Display for Nrp2Display
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.cmd {
            CmdSet::MeasurePower => write!(f, "READ?"),
            _ => display_common(&self.cmd, f),
        }
    }
}

pub trait CmdDisplayFactory: fmt::Display + Send
{
    fn display_cmd(cmd: CmdSet) -> Self;
}

impl CmdDisplayFactory for Ngp800Display
{
    fn display_cmd(cmd: CmdSet) -> Self
    {
        Self { cmd: cmd }
    }
}

impl CmdDisplayFactory for N5173bDisplay
{
    fn display_cmd(cmd: CmdSet) -> Self
    {
        Self { cmd: cmd }
    }
}

impl CmdDisplayFactory for NrxDisplay
{
    fn display_cmd(cmd: CmdSet) -> Self
    {
        Self { cmd: cmd }
    }
}

impl CmdDisplayFactory for Nrp2Display
{
    fn display_cmd(cmd: CmdSet) -> Self
    {
        Self { cmd: cmd }
    }
}
