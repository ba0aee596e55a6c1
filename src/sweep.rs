//! Sweep execution
//!
//! # Lifecycle
//! A [`SweepEngine`] owns the bench and runs at most one sweep at a time. [`SweepEngine::start`]
//! validates a plan and spawns the run on a tokio task, returning a [`SweepHandle`] for pausing,
//! stopping and finally joining it. The run publishes its [`SweepState`] on a watch channel:
//!
//! ```text
//! Idle -> Running -> { Paused <-> Running } -> Stopping -> Idle
//! ```
//!
//! # Serialization
//! Every instrument sits behind one async mutex. A multi-step exchange such as "select channel, set
//! voltage, enable output" holds the lock for its whole duration, so an emergency stop issued from
//! another task lands before or after it, never between two of its commands. Settle waits do not
//! hold the lock.
//!
//! # Shutdown
//! Every channel enabled through the engine is recorded in a ledger. Whenever a run ends, however
//! it ends, each ledger channel and the RF output get exactly one output-off attempt. Failures are
//! logged and reported in the [`SweepReport`] rather than retried.

use std::{
    collections::BTreeSet,
    fmt,
    sync::Arc,
};
use chrono::Local;
use tokio::{
    runtime::Handle,
    sync::{ Mutex, oneshot, watch },
    task::JoinHandle,
};

use crate::{
    calibration::{ self, CompressionTracker },
    control::{ Checkpoint, SweepControl },
    devices::{ BiasSource, PowerSensor, RfSource },
    error::{ BenchError, InstrumentError, StartError },
    limits::{ self, LimitAxis, LimitConfig, LimitViolation, PostRead, PreSend },
    plan::{ self, Capabilities, ChannelAssignment, CompiledPlan, SweepPlan },
    record::{ RecordSink, SampleRecord },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState
{
    Idle,
    Running,
    Paused,
    Stopping,
}

/// A bias source primitive whose failure leaves the device in an unknown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOperation
{
    Select,
    EnableOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFault
{
    pub channel: u8,
    pub operation: ChannelOperation,
    pub message: String,
}

impl fmt::Display for ChannelFault
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let operation = match self.operation {
            ChannelOperation::Select => "select",
            ChannelOperation::EnableOutput => "enable output of",
        };

        write!(f, "failed to {} channel {}: {}", operation, self.channel, self.message)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome
{
    /// Every axis was exhausted
    Completed,
    /// Stopped on request
    Aborted,
    /// A measured value tripped its ceiling
    LimitExceeded(LimitViolation),
    /// A set-point was refused before being sent
    PreSendRejected(LimitViolation),
    ChannelFault(ChannelFault),
    /// The run task panicked. Its ledger channels and the RF output were switched off afterwards.
    Panicked,
}

/// An output which could not be confirmed off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget
{
    BiasChannel(u8),
    RfOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownFailure
{
    pub target: OutputTarget,
    pub message: String,
}

/// Records of one RF power level, archived once its bias sweep has ended
#[derive(Debug, Clone, PartialEq)]
pub struct PowerLevelResult
{
    pub rf_power_dbm: Option<f64>,
    pub records: Vec<SampleRecord>,
    /// `false` if the run ended before this level's bias sweep was exhausted
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport
{
    pub outcome: RunOutcome,
    pub records_emitted: u64,
    pub power_levels: Vec<PowerLevelResult>,
    pub shutdown_failures: Vec<ShutdownFailure>,
}

/// Read-back of one bias channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading
{
    pub channel: u8,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    /// The channel was enabled through the engine and has not been switched off since
    pub enabled: bool,
}

/// The instruments driven by the engine
pub struct Bench
{
    bias: Box<dyn BiasSource>,
    rf: Option<Box<dyn RfSource>>,
    meter: Option<Box<dyn PowerSensor>>,
    enabled_channels: BTreeSet<u8>,
}

impl Bench
{
    pub fn new<B>(bias: B) -> Self
        where B: BiasSource + 'static
    {
        Self {
            bias: Box::new(bias),
            rf: None,
            meter: None,
            enabled_channels: BTreeSet::new(),
        }
    }

    pub fn with_rf_source<R>(mut self, rf: R) -> Self
        where R: RfSource + 'static
    {
        self.rf = Some(Box::new(rf));
        self
    }

    pub fn with_power_meter<P>(mut self, meter: P) -> Self
        where P: PowerSensor + 'static
    {
        self.meter = Some(Box::new(meter));
        self
    }

    pub fn capabilities(&self) -> Capabilities
    {
        Capabilities {
            bias_channels: self.bias.channel_count(),
            rf_source: self.rf.is_some(),
            power_meter: self.meter.is_some(),
        }
    }

    /// Selects, sets and enables a bias channel. The channel enters the ledger before the enable
    /// command is sent so that a failed enable is still switched off afterwards.
    async fn apply_bias(&mut self, channel: u8, volts: f64) -> Result<(), ChannelFault>
    {
        self.bias
            .select_channel(channel)
            .await
            .map_err(|err| channel_fault(channel, ChannelOperation::Select, err))?;

        if let Err(err) = self.bias.set_voltage(volts).await {
            log::warn!("channel {}: failed to set {} V: {}", channel, volts, err);
        }

        self.enabled_channels.insert(channel);

        self.bias
            .set_output_enabled(true)
            .await
            .map_err(|err| channel_fault(channel, ChannelOperation::EnableOutput, err))
    }

    /// One output-off attempt for every ledger channel and the RF output
    async fn shutdown_outputs(&mut self) -> Vec<ShutdownFailure>
    {
        let channels: Vec<u8> = self.enabled_channels.iter().copied().collect();
        self.switch_off(channels).await
    }

    /// One output-off attempt for every channel of the bias source and the RF output
    async fn all_outputs_off(&mut self) -> Vec<ShutdownFailure>
    {
        let channels: Vec<u8> = (1..=self.bias.channel_count()).collect();
        self.switch_off(channels).await
    }

    async fn switch_off(&mut self, channels: Vec<u8>) -> Vec<ShutdownFailure>
    {
        let mut failures = Vec::new();

        for channel in channels {
            let result = match self.bias.select_channel(channel).await {
                Ok(()) => self.bias.set_output_enabled(false).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    self.enabled_channels.remove(&channel);
                    log::info!("channel {} output off", channel);
                },
                Err(err) => {
                    log::error!("channel {} could not be switched off: {}", channel, err);
                    failures.push(ShutdownFailure { target: OutputTarget::BiasChannel(channel), message: err.to_string() });
                },
            }
        }

        if let Some(rf) = self.rf.as_mut() {
            match rf.set_output_enabled(false).await {
                Ok(()) => log::info!("RF output off"),
                Err(err) => {
                    log::error!("RF output could not be switched off: {}", err);
                    failures.push(ShutdownFailure { target: OutputTarget::RfOutput, message: err.to_string() });
                },
            }
        }

        failures
    }
}

fn channel_fault(channel: u8, operation: ChannelOperation, err: InstrumentError) -> ChannelFault
{
    ChannelFault { channel: channel, operation: operation, message: err.to_string() }
}

/// Turns a failed reading into a missing field
fn field(name: &str, result: Result<f64, InstrumentError>) -> Option<f64>
{
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("{} reading lost: {}", name, err);
            None
        },
    }
}

fn lock_active(active: &std::sync::Mutex<Option<SweepControl>>) -> std::sync::MutexGuard<'_, Option<SweepControl>>
{
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs sweeps on a bench, one at a time
pub struct SweepEngine
{
    bench: Arc<Mutex<Bench>>,
    caps: Capabilities,
    state: Arc<watch::Sender<SweepState>>,
    active: Arc<std::sync::Mutex<Option<SweepControl>>>,
}

impl SweepEngine
{
    pub fn new(bench: Bench) -> Self
    {
        let caps = bench.capabilities();
        let (state, _) = watch::channel(SweepState::Idle);

        Self {
            bench: Arc::new(Mutex::new(bench)),
            caps: caps,
            state: Arc::new(state),
            active: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn capabilities(&self) -> Capabilities
    {
        self.caps
    }

    pub fn state(&self) -> SweepState
    {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SweepState>
    {
        self.state.subscribe()
    }

    /// Validates `plan` and starts running it
    ///
    /// Nothing is sent to any instrument if this returns an error.
    pub fn start<S>(&self, plan: &SweepPlan, sink: S) -> Result<SweepHandle, StartError>
        where S: RecordSink + 'static
    {
        let current = self.state();
        if current != SweepState::Idle {
            return Err(StartError::AlreadyActive(current));
        }

        let compiled = plan.compile(&self.caps)?;
        let runtime = Handle::try_current().map_err(|_| StartError::NoRuntime)?;

        let mut claimed = false;
        self.state.send_if_modified(|state| {
            claimed = *state == SweepState::Idle;
            if claimed {
                *state = SweepState::Running;
            }
            claimed
        });

        if !claimed {
            return Err(StartError::AlreadyActive(self.state()));
        }

        log::info!(
            "starting sweep: {} RF level(s) x {} vgate x {} vdrain point(s)",
            compiled.rf_power.len(), compiled.vgate.len(), compiled.vdrain.len()
        );

        let control = SweepControl::new();
        *lock_active(&self.active) = Some(control.clone());

        let run = SweepRun {
            bench: self.bench.clone(),
            state: self.state.clone(),
            active: self.active.clone(),
            control: control.clone(),
            has_meter: self.caps.power_meter,
            plan: compiled,
            sink: Box::new(sink),
            tracker: CompressionTracker::new(),
            sequence: 0,
            level_records: Vec::new(),
            power_levels: Vec::new(),
        };

        let (recovered, recovery) = oneshot::channel();
        let guard = RunGuard {
            bench: self.bench.clone(),
            state: self.state.clone(),
            active: self.active.clone(),
            control: control.clone(),
            recovered: Some(recovered),
        };

        Ok(SweepHandle {
            control: control,
            bench: self.bench.clone(),
            state: self.state.clone(),
            active: self.active.clone(),
            task: runtime.spawn(run.execute(guard)),
            recovery: recovery,
        })
    }

    fn abort_active(&self)
    {
        if let Some(control) = lock_active(&self.active).as_ref() {
            control.request_abort();
        }
    }

    /// Aborts any active run and switches off every channel enabled through the engine plus the
    /// RF output
    pub async fn emergency_stop(&self) -> Vec<ShutdownFailure>
    {
        log::warn!("emergency stop");
        self.abort_active();
        self.bench.lock().await.shutdown_outputs().await
    }

    /// Aborts any active run and switches off every channel of the bias source plus the RF output,
    /// whether or not the engine enabled them
    pub async fn all_outputs_off(&self) -> Vec<ShutdownFailure>
    {
        log::warn!("all outputs off");
        self.abort_active();
        self.bench.lock().await.all_outputs_off().await
    }

    /// Applies a single gate/drain bias point outside of a sweep
    pub async fn set_point(
        &self,
        channels: ChannelAssignment,
        limits: &LimitConfig,
        vgate: f64,
        vdrain: f64,
    ) -> Result<(), BenchError>
    {
        plan::validate_channels(&channels, self.caps.bias_channels)?;
        limits.validate()?;

        for (axis, channel, value) in [
            (LimitAxis::Vgate, channels.vgate, vgate),
            (LimitAxis::Vdrain, channels.vdrain, vdrain),
        ] {
            pre_send(limits, axis, channel, value).map_err(BenchError::LimitRejected)?;
        }

        let mut bench = self.bench.lock().await;

        // checked with the lock held so a run cannot start in between
        let current = self.state();
        if current != SweepState::Idle {
            return Err(BenchError::Busy(current));
        }

        for (channel, volts) in [(channels.vgate, vgate), (channels.vdrain, vdrain)] {
            if let Err(fault) = bench.apply_bias(channel, volts).await {
                log::error!("set-point abandoned, {}", fault);
                let shutdown_failures = bench.shutdown_outputs().await;
                return Err(BenchError::ChannelFault { fault: fault, shutdown_failures: shutdown_failures });
            }
            log::info!("channel {} set to {} V", channel, volts);
        }

        Ok(())
    }

    /// Reads back voltage and current of every bias channel
    pub async fn monitor(&self) -> Result<Vec<ChannelReading>, BenchError>
    {
        let mut guard = self.bench.lock().await;
        let bench = &mut *guard;

        let current = self.state();
        if current != SweepState::Idle {
            return Err(BenchError::Busy(current));
        }

        let mut readings = Vec::new();

        for channel in 1..=bench.bias.channel_count() {
            bench.bias.select_channel(channel).await?;

            readings.push(ChannelReading {
                channel: channel,
                voltage: field("voltage", bench.bias.measure_voltage().await),
                current: field("current", bench.bias.measure_current().await),
                enabled: bench.enabled_channels.contains(&channel),
            });
        }

        Ok(readings)
    }
}

/// Control surface of a started run
pub struct SweepHandle
{
    control: SweepControl,
    bench: Arc<Mutex<Bench>>,
    state: Arc<watch::Sender<SweepState>>,
    active: Arc<std::sync::Mutex<Option<SweepControl>>>,
    task: JoinHandle<SweepReport>,
    recovery: oneshot::Receiver<Vec<ShutdownFailure>>,
}

impl SweepHandle
{
    /// Suspends the run before its next drain voltage commit. Outputs stay as they are.
    pub fn pause(&self)
    {
        self.control.request_pause();
    }

    pub fn resume(&self)
    {
        self.control.resume();
    }

    /// Ends the run at its next safe point
    pub fn stop(&self)
    {
        self.control.request_abort();
    }

    pub fn control(&self) -> SweepControl
    {
        self.control.clone()
    }

    pub fn state(&self) -> SweepState
    {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SweepState>
    {
        self.state.subscribe()
    }

    pub fn is_finished(&self) -> bool
    {
        self.task.is_finished()
    }

    /// Stops the run and switches off every channel it enabled plus the RF output, without waiting
    /// for the run to reach a safe point
    ///
    /// Waits for any exchange in flight to finish first. The run shuts down on its own afterwards.
    pub async fn emergency_stop(&self) -> Vec<ShutdownFailure>
    {
        log::warn!("emergency stop");
        self.control.request_abort();
        self.bench.lock().await.shutdown_outputs().await
    }

    /// Waits for the run to end
    pub async fn join(self) -> SweepReport
    {
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                log::error!("sweep task failed: {}", err);

                // the task's guard normally switches everything off before we get here
                let shutdown_failures = match self.recovery.await {
                    Ok(failures) => failures,
                    Err(_) => recover(&self.bench, &self.state, &self.active, &self.control).await,
                };

                SweepReport {
                    outcome: RunOutcome::Panicked,
                    records_emitted: 0,
                    power_levels: Vec::new(),
                    shutdown_failures: shutdown_failures,
                }
            },
        }
    }
}

/// Switches off what a dead run task left on and returns the engine to `Idle`
async fn recover(
    bench: &Mutex<Bench>,
    state: &watch::Sender<SweepState>,
    active: &std::sync::Mutex<Option<SweepControl>>,
    control: &SweepControl,
) -> Vec<ShutdownFailure>
{
    control.request_abort();
    state.send_replace(SweepState::Stopping);

    let shutdown_failures = bench.lock().await.shutdown_outputs().await;

    lock_active(active).take();
    state.send_replace(SweepState::Idle);
    shutdown_failures
}

/// Held by the run task. If the task unwinds before disarming it, outputs are switched off from a
/// fresh task and the result is handed to [`SweepHandle::join`].
struct RunGuard
{
    bench: Arc<Mutex<Bench>>,
    state: Arc<watch::Sender<SweepState>>,
    active: Arc<std::sync::Mutex<Option<SweepControl>>>,
    control: SweepControl,
    recovered: Option<oneshot::Sender<Vec<ShutdownFailure>>>,
}

impl RunGuard
{
    fn disarm(&mut self)
    {
        self.recovered.take();
    }
}

impl Drop for RunGuard
{
    fn drop(&mut self)
    {
        let Some(recovered) = self.recovered.take() else { return };

        log::error!("sweep task ended abnormally, switching outputs off");

        let bench = self.bench.clone();
        let state = self.state.clone();
        let active = self.active.clone();
        let control = self.control.clone();

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let failures = recover(&bench, &state, &active, &control).await;
                    let _ = recovered.send(failures);
                });
            },
            Err(_) => log::error!("no runtime left to switch outputs off"),
        }
    }
}

/// Pre-send check of a bias value against its role ceiling and its channel ceiling
fn pre_send(limits: &LimitConfig, axis: LimitAxis, channel: u8, value: f64) -> Result<(), LimitViolation>
{
    for axis in [axis, LimitAxis::ChannelVoltage(channel)] {
        if let PreSend::Rejected(violation) = limits::check_pre_send(axis, value, limits.ceiling_for(axis)) {
            log::error!("refusing to send {} V to channel {}: {}", value, channel, violation);
            return Err(violation);
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct Reading
{
    current: Option<f64>,
    drain_voltage: Option<f64>,
    rf_frequency_hz: Option<f64>,
    power_in_raw_dbm: Option<f64>,
    power_out_raw_dbm: Option<f64>,
}

/// State owned by the run task
struct SweepRun
{
    bench: Arc<Mutex<Bench>>,
    state: Arc<watch::Sender<SweepState>>,
    active: Arc<std::sync::Mutex<Option<SweepControl>>>,
    control: SweepControl,
    has_meter: bool,
    plan: CompiledPlan,
    sink: Box<dyn RecordSink>,
    tracker: CompressionTracker,
    sequence: u64,
    level_records: Vec<SampleRecord>,
    power_levels: Vec<PowerLevelResult>,
}

impl SweepRun
{
    async fn execute(mut self, mut guard: RunGuard) -> SweepReport
    {
        let outcome = match self.sweep().await {
            Ok(()) => RunOutcome::Completed,
            Err(outcome) => outcome,
        };

        match &outcome {
            RunOutcome::Completed => log::info!("sweep complete, {} records", self.sequence),
            RunOutcome::Aborted => log::warn!("sweep aborted after {} records", self.sequence),
            RunOutcome::LimitExceeded(violation) => log::error!("sweep stopped, LimitExceeded: {}", violation),
            RunOutcome::PreSendRejected(violation) => log::error!("sweep stopped, set-point refused: {}", violation),
            RunOutcome::ChannelFault(fault) => log::error!("sweep stopped, channel fault: {}", fault),
            RunOutcome::Panicked => (),
        }

        self.state.send_replace(SweepState::Stopping);

        let shutdown_failures = self.bench.lock().await.shutdown_outputs().await;

        if let Err(err) = self.sink.flush() {
            log::warn!("record sink failed to flush: {}", err);
        }

        lock_active(&self.active).take();
        self.state.send_replace(SweepState::Idle);
        guard.disarm();

        SweepReport {
            outcome: outcome,
            records_emitted: self.sequence,
            power_levels: self.power_levels,
            shutdown_failures: shutdown_failures,
        }
    }

    async fn sweep(&mut self) -> Result<(), RunOutcome>
    {
        self.prepare().await?;

        for level in self.plan.rf_power.clone() {
            self.checkpoint().await?;

            let result = match level {
                Some(dbm) => match self.apply_rf_power(dbm).await {
                    Ok(()) => self.bias_sweep(level).await,
                    Err(outcome) => Err(outcome),
                },
                None => self.bias_sweep(level).await,
            };

            self.archive(level, result.is_ok());
            result?;
        }

        Ok(())
    }

    /// Programs per-channel current limits and the carrier frequency
    async fn prepare(&mut self) -> Result<(), RunOutcome>
    {
        let mut guard = self.bench.lock().await;
        let bench = &mut *guard;

        for (channel, limit) in &self.plan.limits.channels {
            if let Some(amps) = limit.max_current {
                bench.bias
                    .select_channel(*channel)
                    .await
                    .map_err(|err| RunOutcome::ChannelFault(channel_fault(*channel, ChannelOperation::Select, err)))?;

                match bench.bias.set_current(amps).await {
                    Ok(()) => log::info!("channel {} current limit {} A", channel, amps),
                    Err(err) => log::warn!("channel {}: failed to set current limit {} A: {}", channel, amps, err),
                }
            }
        }

        if let (Some(hz), Some(rf)) = (self.plan.rf_frequency_hz, bench.rf.as_mut()) {
            if let Err(err) = rf.set_frequency(hz).await {
                log::warn!("failed to set RF frequency {} Hz: {}", hz, err);
            }
        }

        Ok(())
    }

    fn publish_pause(state: &watch::Sender<SweepState>, paused: bool)
    {
        if paused {
            log::info!("sweep paused");
            state.send_replace(SweepState::Paused);
        }
        else {
            log::info!("sweep resumed");
            state.send_replace(SweepState::Running);
        }
    }

    async fn checkpoint(&mut self) -> Result<(), RunOutcome>
    {
        let state = &self.state;

        match self.control.checkpoint(|paused| Self::publish_pause(state, paused)).await {
            Checkpoint::Continue => Ok(()),
            Checkpoint::Abort => Err(RunOutcome::Aborted),
        }
    }

    async fn settle(&mut self, duration: std::time::Duration) -> Result<(), RunOutcome>
    {
        let state = &self.state;

        match self.control.settle(duration, |paused| Self::publish_pause(state, paused)).await {
            Checkpoint::Continue => Ok(()),
            Checkpoint::Abort => Err(RunOutcome::Aborted),
        }
    }

    /// Output off, new level, output on. RF faults only cost the readings that depend on them.
    async fn apply_rf_power(&mut self, dbm: f64) -> Result<(), RunOutcome>
    {
        {
            let mut bench = self.bench.lock().await;

            if self.control.is_abort_requested() {
                return Err(RunOutcome::Aborted);
            }

            if let Some(rf) = bench.rf.as_mut() {
                if let Err(err) = rf.set_output_enabled(false).await {
                    log::warn!("failed to switch RF output off: {}", err);
                }
                if let Err(err) = rf.set_power(dbm).await {
                    log::warn!("failed to set RF power {} dBm: {}", dbm, err);
                }
                if let Err(err) = rf.set_output_enabled(true).await {
                    log::warn!("failed to switch RF output on: {}", err);
                }
                log::info!("RF power {} dBm", dbm);
            }
        }

        self.settle(self.plan.timing.rf_power).await
    }

    async fn bias_sweep(&mut self, level: Option<f64>) -> Result<(), RunOutcome>
    {
        let vgates = self.plan.vgate.clone();
        let vdrains = self.plan.vdrain.clone();
        let channels = self.plan.channels;

        for vgate in vgates {
            self.checkpoint().await?;
            self.commit_bias(LimitAxis::Vgate, channels.vgate, vgate).await?;
            self.settle(self.plan.timing.vgate).await?;

            for &vdrain in &vdrains {
                self.checkpoint().await?;
                self.commit_bias(LimitAxis::Vdrain, channels.vdrain, vdrain).await?;
                self.settle(self.plan.timing.vdrain).await?;

                let reading = self.measure().await?;
                self.emit(level, vgate, vdrain, &reading);
                self.check_readings(vgate, vdrain, &reading)?;
            }
        }

        Ok(())
    }

    async fn commit_bias(&mut self, axis: LimitAxis, channel: u8, volts: f64) -> Result<(), RunOutcome>
    {
        pre_send(&self.plan.limits, axis, channel, volts).map_err(RunOutcome::PreSendRejected)?;

        let mut bench = self.bench.lock().await;

        // an emergency stop may have switched everything off while this task waited for the lock
        if self.control.is_abort_requested() {
            return Err(RunOutcome::Aborted);
        }

        bench.apply_bias(channel, volts).await.map_err(RunOutcome::ChannelFault)?;
        log::debug!("{} = {} V on channel {}", axis, volts, channel);

        Ok(())
    }

    async fn measure(&mut self) -> Result<Reading, RunOutcome>
    {
        let drain = self.plan.channels.vdrain;
        let mut reading = Reading::default();

        {
            let mut guard = self.bench.lock().await;
            let bench = &mut *guard;

            // outputs may have been switched off while this task waited for the lock
            if self.control.is_abort_requested() {
                return Err(RunOutcome::Aborted);
            }

            bench.bias
                .select_channel(drain)
                .await
                .map_err(|err| RunOutcome::ChannelFault(channel_fault(drain, ChannelOperation::Select, err)))?;

            reading.current = field("current", bench.bias.measure_current().await);
            reading.drain_voltage = field("drain voltage", bench.bias.measure_voltage().await);

            if let Some(rf) = bench.rf.as_mut() {
                reading.rf_frequency_hz = field("RF frequency", rf.query_frequency().await);
                reading.power_in_raw_dbm = field("RF input power", rf.query_power().await);
            }
        }

        if self.has_meter {
            self.settle(self.plan.timing.meter).await?;

            let mut bench = self.bench.lock().await;

            if self.control.is_abort_requested() {
                return Err(RunOutcome::Aborted);
            }

            if let Some(meter) = bench.meter.as_mut() {
                reading.power_out_raw_dbm = field("RF output power", meter.measure_power().await);
            }
        }

        Ok(reading)
    }

    fn emit(&mut self, level: Option<f64>, vgate: f64, vdrain: f64, reading: &Reading)
    {
        let metrics = calibration::derive(
            reading.power_in_raw_dbm,
            reading.power_out_raw_dbm,
            vdrain,
            reading.current,
            &self.plan.calibration,
            &mut self.tracker,
        );

        let record = SampleRecord {
            sequence: self.sequence,
            timestamp: Local::now(),
            rf_power_setpoint_dbm: level,
            vgate: vgate,
            vdrain: vdrain,
            current: reading.current,
            rf_frequency_hz: reading.rf_frequency_hz,
            power_in_raw_dbm: reading.power_in_raw_dbm,
            power_out_raw_dbm: reading.power_out_raw_dbm,
            power_in_actual_dbm: metrics.power_in_actual_dbm,
            power_out_actual_dbm: metrics.power_out_actual_dbm,
            power_in_actual_mw: metrics.power_in_actual_mw,
            power_out_actual_mw: metrics.power_out_actual_mw,
            gain_db: metrics.gain_db,
            compression_db: metrics.compression_db,
            pae_percent: metrics.pae_percent,
        };

        self.sequence += 1;

        if let Err(err) = self.sink.emit(&record) {
            log::warn!("record {} was not delivered: {}", record.sequence, err);
        }

        self.level_records.push(record);
    }

    /// Authoritative checks of what the device actually draws
    fn check_readings(&self, vgate: f64, vdrain: f64, reading: &Reading) -> Result<(), RunOutcome>
    {
        let channels = self.plan.channels;
        let measured_vdrain = reading.drain_voltage.unwrap_or(vdrain);

        let checks = [
            (LimitAxis::Vdrain, Some(measured_vdrain)),
            (LimitAxis::ChannelVoltage(channels.vdrain), Some(measured_vdrain)),
            (LimitAxis::Vgate, Some(vgate)),
            (LimitAxis::ChannelVoltage(channels.vgate), Some(vgate)),
            (LimitAxis::Current, reading.current),
            (LimitAxis::ChannelCurrent(channels.vdrain), reading.current),
        ];

        for (axis, value) in checks {
            let Some(value) = value else { continue };

            if let PostRead::LimitExceeded(violation) = limits::check_post_read(axis, value, self.plan.limits.ceiling_for(axis)) {
                log::error!(
                    "LimitExceeded on {}: measured {} against a ceiling of {}",
                    violation.axis, violation.value, violation.ceiling
                );
                return Err(RunOutcome::LimitExceeded(violation));
            }
        }

        Ok(())
    }

    fn archive(&mut self, level: Option<f64>, complete: bool)
    {
        if let Err(err) = self.sink.finish_power_level(level) {
            log::warn!("record sink failed to archive RF level {:?}: {}", level, err);
        }

        self.power_levels.push(PowerLevelResult {
            rf_power_dbm: level,
            records: std::mem::take(&mut self.level_records),
            complete: complete,
        });
    }
}
