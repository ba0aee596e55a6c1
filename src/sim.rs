//! Simulated instruments for development and testing
//!
//! The simulated bias source, RF source and power meter keep their state in memory and behave
//! like the real instruments as far as the sweep can tell:
//!   - every command is recorded in a shared [`SimJournal`] using the wire text the real
//!     instrument would have received
//!   - the drain current follows a configurable model of the device under test
//!   - the meter reads the generator level plus a fixed gain, optionally saturating
//!   - faults can be injected per operation
//!
//! Each simulated instrument is a cheap clone around shared state. Keep one clone to inspect and
//! manipulate the instrument while another is driven by the sweep engine.

use std::{
    sync::{ Arc, Mutex, MutexGuard },
    time::Duration,
};
use async_trait::async_trait;

use crate::{
    cmd::{ CmdSet, CmdDisplayFactory, Ngp800Display, N5173bDisplay, NrxDisplay, Nrp2Display },
    devices::{ BiasSource, PowerMeterDialect, PowerSensor, RfSource },
    error::InstrumentError,
    reply::parse_decimal,
    sweep::Bench,
};

/// Reading of a meter with no signal at its input
pub const NOISE_FLOOR_DBM: f64 = -70.0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn respond_after(latency: Duration)
{
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

fn injected(what: &str) -> InstrumentError
{
    InstrumentError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("injected {} fault", what)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimInstrument
{
    Bias,
    Rf,
    Meter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry
{
    pub instrument: SimInstrument,
    pub command: String,
}

/// Ordered log of every command sent to any simulated instrument
#[derive(Debug, Clone, Default)]
pub struct SimJournal
{
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl SimJournal
{
    pub fn new() -> Self
    {
        Self::default()
    }

    fn record<D>(&self, instrument: SimInstrument, cmd: CmdSet)
        where D: CmdDisplayFactory
    {
        lock(&self.entries).push(JournalEntry {
            instrument: instrument,
            command: D::display_cmd(cmd).to_string(),
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry>
    {
        lock(&self.entries).clone()
    }

    /// Commands of one instrument, in order
    pub fn commands(&self, instrument: SimInstrument) -> Vec<String>
    {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.instrument == instrument)
            .map(|entry| entry.command.clone())
            .collect()
    }

    pub fn len(&self) -> usize
    {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool
    {
        lock(&self.entries).is_empty()
    }

    pub fn clear(&self)
    {
        lock(&self.entries).clear();
    }
}

/// Drain current in amperes as a function of gate and drain voltage
pub type CurrentModel = Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>;

/// A simple square-law FET: off below the threshold, linear in drain voltage up to saturation
pub fn square_law_fet(threshold_v: f64, k: f64) -> CurrentModel
{
    Arc::new(move |vgate, vdrain| {
        let overdrive = vgate - threshold_v;
        if overdrive <= 0.0 || vdrain <= 0.0 {
            0.0
        }
        else {
            k * overdrive * overdrive * (vdrain / (vdrain + 1.0))
        }
    })
}

/// Always draws the same current once both channels are on
pub fn constant_current(amps: f64) -> CurrentModel
{
    Arc::new(move |_, _| amps)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimChannel
{
    pub voltage: f64,
    pub current_limit: Option<f64>,
    pub output: bool,
}

/// Operations of the simulated bias source which should fail
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiasFaults
{
    /// Selecting this channel fails
    pub select: Option<u8>,
    /// Enabling the output of this channel fails
    pub enable: Option<u8>,
    /// Disabling the output of this channel fails
    pub disable: Option<u8>,
    pub voltage_writes: bool,
    pub current_reads: bool,
    pub voltage_reads: bool,
}

struct BiasState
{
    selected: Option<u8>,
    channels: Vec<SimChannel>,
    gate_channel: u8,
    drain_channel: u8,
    model: CurrentModel,
    faults: BiasFaults,
    latency: Duration,
}

impl BiasState
{
    fn channel(&self, channel: u8) -> Option<&SimChannel>
    {
        self.channels.get(usize::from(channel).checked_sub(1)?)
    }

    fn selected_mut(&mut self) -> Result<&mut SimChannel, InstrumentError>
    {
        let index = self
            .selected
            .ok_or_else(|| InstrumentError::Refused("no channel selected".to_string()))?;

        Ok(&mut self.channels[usize::from(index) - 1])
    }

    fn drain_current(&self) -> f64
    {
        let gate = self.channel(self.gate_channel).copied().unwrap_or_default();
        let drain = self.channel(self.drain_channel).copied().unwrap_or_default();

        if !gate.output || !drain.output {
            return 0.0;
        }

        let amps = (self.model)(gate.voltage, drain.voltage);

        match drain.current_limit {
            Some(limit) => amps.min(limit),
            None => amps,
        }
    }
}

/// Simulated multi-channel bias supply
#[derive(Clone)]
pub struct SimBiasSource
{
    state: Arc<Mutex<BiasState>>,
    journal: SimJournal,
}

impl SimBiasSource
{
    /// Four channels, gate on channel 1, drain on channel 2, no current drawn
    pub fn new(journal: SimJournal) -> Self
    {
        Self::with_channels(journal, 4)
    }

    pub fn with_channels(journal: SimJournal, count: u8) -> Self
    {
        Self {
            state: Arc::new(Mutex::new(BiasState {
                selected: None,
                channels: vec![SimChannel::default(); usize::from(count)],
                gate_channel: 1,
                drain_channel: 2,
                model: constant_current(0.0),
                faults: BiasFaults::default(),
                latency: Duration::ZERO,
            })),
            journal: journal,
        }
    }

    /// Which channels feed the gate and drain of the simulated device
    pub fn wiring(self, gate_channel: u8, drain_channel: u8) -> Self
    {
        {
            let mut state = lock(&self.state);
            state.gate_channel = gate_channel;
            state.drain_channel = drain_channel;
        }
        self
    }

    pub fn model(self, model: CurrentModel) -> Self
    {
        lock(&self.state).model = model;
        self
    }

    /// Delay before every command completes
    pub fn latency(self, latency: Duration) -> Self
    {
        lock(&self.state).latency = latency;
        self
    }

    pub fn set_model(&self, model: CurrentModel)
    {
        lock(&self.state).model = model;
    }

    pub fn set_faults(&self, faults: BiasFaults)
    {
        lock(&self.state).faults = faults;
    }

    pub fn channel(&self, channel: u8) -> Option<SimChannel>
    {
        lock(&self.state).channel(channel).copied()
    }

    pub fn output_enabled(&self, channel: u8) -> bool
    {
        self.channel(channel).map_or(false, |ch| ch.output)
    }

    /// Channels whose output is currently on
    pub fn enabled_channels(&self) -> Vec<u8>
    {
        let state = lock(&self.state);

        (1..=state.channels.len() as u8)
            .filter(|channel| state.channel(*channel).map_or(false, |ch| ch.output))
            .collect()
    }

    fn latency_now(&self) -> Duration
    {
        lock(&self.state).latency
    }
}

#[async_trait]
impl BiasSource for SimBiasSource
{
    fn channel_count(&self) -> u8
    {
        lock(&self.state).channels.len() as u8
    }

    async fn select_channel(&mut self, channel: u8) -> Result<(), InstrumentError>
    {
        respond_after(self.latency_now()).await;
        self.journal.record::<Ngp800Display>(SimInstrument::Bias, CmdSet::SelectChannel(channel));

        let mut state = lock(&self.state);

        if state.faults.select == Some(channel) {
            return Err(injected("select"));
        }

        if state.channel(channel).is_none() {
            return Err(InstrumentError::Refused(format!("channel {} does not exist", channel)));
        }

        state.selected = Some(channel);
        Ok(())
    }

    async fn set_voltage(&mut self, volts: f64) -> Result<(), InstrumentError>
    {
        respond_after(self.latency_now()).await;
        self.journal.record::<Ngp800Display>(SimInstrument::Bias, CmdSet::SetVoltage(volts));

        let mut state = lock(&self.state);

        if state.faults.voltage_writes {
            return Err(injected("voltage write"));
        }

        state.selected_mut()?.voltage = volts;
        Ok(())
    }

    async fn set_current(&mut self, amps: f64) -> Result<(), InstrumentError>
    {
        respond_after(self.latency_now()).await;
        self.journal.record::<Ngp800Display>(SimInstrument::Bias, CmdSet::SetCurrent(amps));

        lock(&self.state).selected_mut()?.current_limit = Some(amps);
        Ok(())
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError>
    {
        respond_after(self.latency_now()).await;
        self.journal.record::<Ngp800Display>(SimInstrument::Bias, CmdSet::SetOutput(enabled));

        let mut state = lock(&self.state);
        let fault = if enabled { state.faults.enable } else { state.faults.disable };

        if fault.is_some() && fault == state.selected {
            return Err(injected(if enabled { "output enable" } else { "output disable" }));
        }

        state.selected_mut()?.output = enabled;
        Ok(())
    }

    async fn measure_current(&mut self) -> Result<f64, InstrumentError>
    {
        respond_after(self.latency_now()).await;
        self.journal.record::<Ngp800Display>(SimInstrument::Bias, CmdSet::MeasureCurrent);

        let state = lock(&self.state);

        if state.faults.current_reads {
            return Err(InstrumentError::Timeout(crate::executor::DEFAULT_QUERY_TIMEOUT));
        }

        match state.selected {
            Some(channel) if channel == state.drain_channel => Ok(state.drain_current()),
            Some(_) => Ok(0.0),
            None => Err(InstrumentError::Refused("no channel selected".to_string())),
        }
    }

    async fn measure_voltage(&mut self) -> Result<f64, InstrumentError>
    {
        respond_after(self.latency_now()).await;
        self.journal.record::<Ngp800Display>(SimInstrument::Bias, CmdSet::MeasureVoltage);

        let mut state = lock(&self.state);

        if state.faults.voltage_reads {
            return Err(InstrumentError::Timeout(crate::executor::DEFAULT_QUERY_TIMEOUT));
        }

        let channel = state.selected_mut()?;
        Ok(if channel.output { channel.voltage } else { 0.0 })
    }
}

/// Operations of the simulated RF source which should fail
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RfFaults
{
    pub writes: bool,
    pub frequency_reads: bool,
    /// Reply text returned to `POW?` instead of the actual level
    pub power_reply: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct RfState
{
    frequency_hz: f64,
    power_dbm: f64,
    output: bool,
    faults: RfFaults,
}

/// Simulated RF signal generator
#[derive(Clone)]
pub struct SimRfSource
{
    state: Arc<Mutex<RfState>>,
    journal: SimJournal,
}

impl SimRfSource
{
    pub fn new(journal: SimJournal) -> Self
    {
        Self {
            state: Arc::new(Mutex::new(RfState {
                frequency_hz: 1e9,
                power_dbm: -135.0,
                ..Default::default()
            })),
            journal: journal,
        }
    }

    pub fn set_faults(&self, faults: RfFaults)
    {
        lock(&self.state).faults = faults;
    }

    pub fn output_enabled(&self) -> bool
    {
        lock(&self.state).output
    }

    pub fn power_dbm(&self) -> f64
    {
        lock(&self.state).power_dbm
    }

    pub fn frequency_hz(&self) -> f64
    {
        lock(&self.state).frequency_hz
    }

    fn write<F>(&self, cmd: CmdSet, apply: F) -> Result<(), InstrumentError>
        where F: FnOnce(&mut RfState)
    {
        self.journal.record::<N5173bDisplay>(SimInstrument::Rf, cmd);

        let mut state = lock(&self.state);

        if state.faults.writes {
            return Err(injected("RF write"));
        }

        apply(&mut state);
        Ok(())
    }
}

#[async_trait]
impl RfSource for SimRfSource
{
    async fn set_frequency(&mut self, hz: f64) -> Result<(), InstrumentError>
    {
        self.write(CmdSet::SetFrequency(hz), |state| state.frequency_hz = hz)
    }

    async fn set_power(&mut self, dbm: f64) -> Result<(), InstrumentError>
    {
        self.write(CmdSet::SetPower(dbm), |state| state.power_dbm = dbm)
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError>
    {
        self.write(CmdSet::SetOutput(enabled), |state| state.output = enabled)
    }

    async fn query_frequency(&mut self) -> Result<f64, InstrumentError>
    {
        self.journal.record::<N5173bDisplay>(SimInstrument::Rf, CmdSet::QueryFrequency);

        let state = lock(&self.state);

        if state.faults.frequency_reads {
            return Err(InstrumentError::Timeout(crate::executor::DEFAULT_QUERY_TIMEOUT));
        }

        Ok(state.frequency_hz)
    }

    async fn query_power(&mut self) -> Result<f64, InstrumentError>
    {
        self.journal.record::<N5173bDisplay>(SimInstrument::Rf, CmdSet::QueryPower);

        let state = lock(&self.state);

        match &state.faults.power_reply {
            Some(reply) => Ok(parse_decimal(reply)?),
            None => Ok(state.power_dbm),
        }
    }
}

/// Simulated power meter at the output of the device under test
#[derive(Clone)]
pub struct SimPowerMeter
{
    source: SimRfSource,
    gain_db: f64,
    saturation_dbm: Option<f64>,
    dialect: PowerMeterDialect,
    reply: Arc<Mutex<Option<String>>>,
    journal: SimJournal,
}

impl SimPowerMeter
{
    /// A meter reading `source` through a device of fixed `gain_db`
    pub fn coupled(source: &SimRfSource, gain_db: f64) -> Self
    {
        Self {
            source: source.clone(),
            gain_db: gain_db,
            saturation_dbm: None,
            dialect: PowerMeterDialect::Nrx,
            reply: Arc::new(Mutex::new(None)),
            journal: source.journal.clone(),
        }
    }

    /// Output power cannot rise above `dbm`, which shows up as gain compression
    pub fn saturation(mut self, dbm: f64) -> Self
    {
        self.saturation_dbm = Some(dbm);
        self
    }

    pub fn dialect(mut self, dialect: PowerMeterDialect) -> Self
    {
        self.dialect = dialect;
        self
    }

    /// Reply text returned instead of a reading, `None` to return to normal
    pub fn set_reply(&self, reply: Option<&str>)
    {
        *lock(&self.reply) = reply.map(str::to_string);
    }

    fn reading(&self) -> f64
    {
        if !self.source.output_enabled() {
            return NOISE_FLOOR_DBM;
        }

        let out = self.source.power_dbm() + self.gain_db;

        match self.saturation_dbm {
            Some(limit) => out.min(limit),
            None => out,
        }
    }
}

#[async_trait]
impl PowerSensor for SimPowerMeter
{
    async fn measure_power(&mut self) -> Result<f64, InstrumentError>
    {
        match self.dialect {
            PowerMeterDialect::Nrx => self.journal.record::<NrxDisplay>(SimInstrument::Meter, CmdSet::MeasurePower),
            PowerMeterDialect::Nrp2 => self.journal.record::<Nrp2Display>(SimInstrument::Meter, CmdSet::MeasurePower),
        }

        match lock(&self.reply).as_deref() {
            Some(reply) => Ok(parse_decimal(reply)?),
            None => Ok(self.reading()),
        }
    }
}

/// All three simulated instruments sharing one journal
///
/// The fields are handles onto the same instruments the [`Bench`] built by
/// [`bench`](Self::bench) drives.
#[derive(Clone)]
pub struct SimBench
{
    pub journal: SimJournal,
    pub bias: SimBiasSource,
    pub rf: SimRfSource,
    pub meter: SimPowerMeter,
}

impl SimBench
{
    /// A device under test with 15 dB gain drawing no current
    pub fn new() -> Self
    {
        let journal = SimJournal::new();
        let rf = SimRfSource::new(journal.clone());

        Self {
            bias: SimBiasSource::new(journal.clone()),
            meter: SimPowerMeter::coupled(&rf, 15.0),
            rf: rf,
            journal: journal,
        }
    }

    /// A bench with all three instruments attached
    pub fn bench(&self) -> Bench
    {
        Bench::new(self.bias.clone())
            .with_rf_source(self.rf.clone())
            .with_power_meter(self.meter.clone())
    }

    /// A bench with only the bias source attached
    pub fn bias_only(&self) -> Bench
    {
        Bench::new(self.bias.clone())
    }
}

impl Default for SimBench
{
    fn default() -> Self
    {
        Self::new()
    }
}
