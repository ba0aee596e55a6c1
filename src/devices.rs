//! Device definition and APIs
//!
//! # Purpose
//! This module defines handles to an active I/O stream for each of the three instrument families
//! on the bench:
//!   - [`Ngp800`], a multi-channel DC supply biasing the gate and drain of the device under test
//!   - [`N5173b`], the RF signal generator driving the input of the device under test
//!   - [`PowerMeter`], an NRX or NRP2 power meter reading the output of the device under test
//!
//! The sweep engine does not talk to these handles directly. It consumes the [`BiasSource`],
//! [`RfSource`] and [`PowerSensor`] traits so that a simulated bench (see [`crate::sim`]) or some
//! other instrument can stand in for the real thing.
//!
//! Creating I/O streams is not handled by this library so that you are not restricted to connecting
//! to an instrument via a particular hardware interface. A serial port, a TCP socket to a SCPI raw
//! port or a USBTMC bridge all work as long as they implement tokio's async I/O traits.
//!
//! # Cancel Safety
//! **Queries are not cancel safe,** i.e. they should not be used in a `tokio::select!` call.
//! Cancelling after the write but before the reply would leave the reply in the stream. The
//! executor discards stale input before every query, so the damage is limited to the cancelled
//! reading, but the instrument may still be busy when the next command arrives.

use async_trait::async_trait;
use tokio::io::{ AsyncWriteExt, AsyncReadExt };

use crate::{
    cmd::{ CmdSet, CmdDisplayFactory, Ngp800Display, N5173bDisplay, NrxDisplay, Nrp2Display },
    error::InstrumentError,
    executor::Executor,
    reply::Identity,
};

/// Line ending appended to every command
const LINE_ENDING: &str = "\n";

/// Multi-channel DC source supplying the gate and drain bias
///
/// All set and measure operations act on the channel chosen by the last
/// [`select_channel`](BiasSource::select_channel).
#[async_trait]
pub trait BiasSource: Send
{
    /// Number of independent output channels, numbered from 1
    fn channel_count(&self) -> u8;

    async fn select_channel(&mut self, channel: u8) -> Result<(), InstrumentError>;

    async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError>;

    async fn set_current(&mut self, amps: f64) -> Result<(), InstrumentError>;

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError>;

    async fn measure_current(&mut self) -> Result<f64, InstrumentError>;

    async fn measure_voltage(&mut self) -> Result<f64, InstrumentError>;
}

/// RF signal generator
#[async_trait]
pub trait RfSource: Send
{
    async fn set_frequency(&mut self, hz: f64) -> Result<(), InstrumentError>;

    async fn set_power(&mut self, dbm: f64) -> Result<(), InstrumentError>;

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError>;

    async fn query_frequency(&mut self) -> Result<f64, InstrumentError>;

    /// Output level the generator believes it is producing, in dBm
    async fn query_power(&mut self) -> Result<f64, InstrumentError>;
}

/// RF power meter
#[async_trait]
pub trait PowerSensor: Send
{
    /// Take one power reading in dBm
    async fn measure_power(&mut self) -> Result<f64, InstrumentError>;
}

/// Query string family spoken by a power meter
///
/// Resolved once when the meter is connected. Nothing downstream of [`PowerMeter::connect`] looks
/// at the identification string again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMeterDialect
{
    /// R&S NRX base unit and compatible meters (`MEAS:POW?`)
    Nrx,
    /// R&S NRP2 (`READ?`)
    Nrp2,
}

impl PowerMeterDialect
{
    /// Picks the dialect from an `*IDN?` reply, defaulting to [`Nrx`](Self::Nrx)
    pub fn from_identity(identity: &Identity) -> Self
    {
        if identity.mentions("NRP2") {
            Self::Nrp2
        }
        else {
            Self::Nrx
        }
    }
}

/// A connected R&S NGP800 series power supply
pub struct Ngp800<T>
{
    io_handle: Executor<T, Ngp800Display>,
    channel_count: u8,
}

impl <T> Ngp800<T>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    /// Construct a new device handle from an async I/O stream
    ///
    /// The NGP804 and NGP824 have four channels. Use [`with_channels`](Self::with_channels) for the
    /// two-channel models.
    pub fn with(io_handle: T) -> Self
    {
        Self::with_channels(io_handle, 4)
    }

    pub fn with_channels(io_handle: T, channel_count: u8) -> Self
    {
        Self {
            io_handle: Executor::with(LINE_ENDING, io_handle),
            channel_count: channel_count,
        }
    }

    pub fn set_timeout(&mut self, timeout: std::time::Duration)
    {
        self.io_handle.set_timeout(timeout);
    }

    pub async fn identify(&mut self) -> Result<Identity, InstrumentError>
    {
        identify(&mut self.io_handle).await
    }
}

#[async_trait]
impl <T> BiasSource for Ngp800<T>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    fn channel_count(&self) -> u8
    {
        self.channel_count
    }

    async fn select_channel(&mut self, channel: u8) -> Result<(), InstrumentError>
    {
        if channel == 0 || channel > self.channel_count {
            return Err(InstrumentError::Refused(format!(
                "channel {} does not exist (1..={})", channel, self.channel_count
            )));
        }

        self.io_handle.exec_cmd(CmdSet::SelectChannel(channel)).await
    }

    async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError>
    {
        self.io_handle.exec_cmd(CmdSet::SetVoltage(volts)).await
    }

    async fn set_current(&mut self, amps: f64) -> Result<(), InstrumentError>
    {
        self.io_handle.exec_cmd(CmdSet::SetCurrent(amps)).await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError>
    {
        self.io_handle.exec_cmd(CmdSet::SetOutput(enabled)).await
    }

    async fn measure_current(&mut self) -> Result<f64, InstrumentError>
    {
        self.io_handle.query_f64(CmdSet::MeasureCurrent).await
    }

    async fn measure_voltage(&mut self) -> Result<f64, InstrumentError>
    {
        self.io_handle.query_f64(CmdSet::MeasureVoltage).await
    }
}

/// A connected Keysight N5173B EXG signal generator
pub struct N5173b<T>
{
    io_handle: Executor<T, N5173bDisplay>,
}

impl <T> N5173b<T>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    pub fn with(io_handle: T) -> Self
    {
        Self {
            io_handle: Executor::with(LINE_ENDING, io_handle),
        }
    }

    pub fn set_timeout(&mut self, timeout: std::time::Duration)
    {
        self.io_handle.set_timeout(timeout);
    }

    pub async fn identify(&mut self) -> Result<Identity, InstrumentError>
    {
        identify(&mut self.io_handle).await
    }
}

#[async_trait]
impl <T> RfSource for N5173b<T>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    async fn set_frequency(&mut self, hz: f64) -> Result<(), InstrumentError>
    {
        self.io_handle.exec_cmd(CmdSet::SetFrequency(hz)).await
    }

    async fn set_power(&mut self, dbm: f64) -> Result<(), InstrumentError>
    {
        self.io_handle.exec_cmd(CmdSet::SetPower(dbm)).await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError>
    {
        self.io_handle.exec_cmd(CmdSet::SetOutput(enabled)).await
    }

    async fn query_frequency(&mut self) -> Result<f64, InstrumentError>
    {
        self.io_handle.query_f64(CmdSet::QueryFrequency).await
    }

    async fn query_power(&mut self) -> Result<f64, InstrumentError>
    {
        self.io_handle.query_f64(CmdSet::QueryPower).await
    }
}

enum MeterExecutor<T>
{
    Nrx(Executor<T, NrxDisplay>),
    Nrp2(Executor<T, Nrp2Display>),
}

/// A connected R&S power meter of either supported dialect
pub struct PowerMeter<T>
{
    io_handle: MeterExecutor<T>,
}

impl <T> PowerMeter<T>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    /// Construct a handle for a meter whose dialect is already known
    pub fn with(io_handle: T, dialect: PowerMeterDialect) -> Self
    {
        let io_handle = match dialect {
            PowerMeterDialect::Nrx => MeterExecutor::Nrx(Executor::with(LINE_ENDING, io_handle)),
            PowerMeterDialect::Nrp2 => MeterExecutor::Nrp2(Executor::with(LINE_ENDING, io_handle)),
        };

        Self { io_handle: io_handle }
    }

    /// Identify the meter and construct a handle speaking its dialect
    ///
    /// `*IDN?` is common to both dialects, so the identity query is sent through an NRX executor which is
    /// then torn down and rebuilt for the resolved dialect.
    pub async fn connect(io_handle: T) -> Result<(Self, Identity), InstrumentError>
    {
        let mut ident_exec: Executor<T, NrxDisplay> = Executor::with(LINE_ENDING, io_handle);
        let identity = identify(&mut ident_exec).await?;
        let dialect = PowerMeterDialect::from_identity(&identity);

        log::info!("power meter {} speaks the {:?} dialect", identity, dialect);

        Ok((Self::with(ident_exec.into_inner(), dialect), identity))
    }

    pub fn dialect(&self) -> PowerMeterDialect
    {
        match &self.io_handle {
            MeterExecutor::Nrx(_) => PowerMeterDialect::Nrx,
            MeterExecutor::Nrp2(_) => PowerMeterDialect::Nrp2,
        }
    }

    pub fn set_timeout(&mut self, timeout: std::time::Duration)
    {
        match &mut self.io_handle {
            MeterExecutor::Nrx(exec) => exec.set_timeout(timeout),
            MeterExecutor::Nrp2(exec) => exec.set_timeout(timeout),
        }
    }

    pub async fn identify(&mut self) -> Result<Identity, InstrumentError>
    {
        match &mut self.io_handle {
            MeterExecutor::Nrx(exec) => identify(exec).await,
            MeterExecutor::Nrp2(exec) => identify(exec).await,
        }
    }
}

#[async_trait]
impl <T> PowerSensor for PowerMeter<T>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send
{
    async fn measure_power(&mut self) -> Result<f64, InstrumentError>
    {
        match &mut self.io_handle {
            MeterExecutor::Nrx(exec) => exec.query_f64(CmdSet::MeasurePower).await,
            MeterExecutor::Nrp2(exec) => exec.query_f64(CmdSet::MeasurePower).await,
        }
    }
}

async fn identify<T, D>(exec: &mut Executor<T, D>) -> Result<Identity, InstrumentError>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send,
          D: CmdDisplayFactory
{
    let reply = exec.query(CmdSet::Identify).await?;
    Ok(reply.parse::<Identity>()?)
}
