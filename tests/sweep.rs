use std::{ sync::Mutex, time::Duration };
use tokio::time::Instant;

use arcs_pasweep::{
    Bench, CalibrationProfile, ChannelLimit, ChannelSink, ConfigurationError, LimitAxis, LimitConfig,
    LimitViolation, MemorySink, RecordSink, RunOutcome, SampleRecord, SettleTiming, SinkError, StartError,
    SweepAxis, SweepEngine, SweepPlan, SweepState, POLL_TICK,
    error::BenchError,
    plan::ChannelAssignment,
    sim::{ BiasFaults, RfFaults, SimBench, SimInstrument, SimPowerMeter, constant_current },
    sweep::{ ChannelOperation, OutputTarget },
};

/// Keeps every log line so the tests can look for safety events
struct CaptureLogger
{
    lines: Mutex<Vec<String>>,
}

static LOGGER: CaptureLogger = CaptureLogger { lines: Mutex::new(Vec::new()) };

impl log::Log for CaptureLogger
{
    fn enabled(&self, _metadata: &log::Metadata) -> bool
    {
        true
    }

    fn log(&self, record: &log::Record)
    {
        let line = format!("{} {}", record.level(), record.args());
        self.lines.lock().unwrap().push(line);
    }

    fn flush(&self) {}
}

fn capture_logs()
{
    // every test in this binary shares the logger, so a second install is expected to fail
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Trace);
}

fn logged(pred: impl Fn(&str) -> bool) -> bool
{
    LOGGER.lines.lock().unwrap().iter().any(|line| pred(line))
}

fn settle(vdrain: Duration) -> SettleTiming
{
    SettleTiming {
        vgate: Duration::from_millis(10),
        vdrain: vdrain,
        rf_power: Duration::from_millis(10),
        meter: Duration::from_millis(5),
    }
}

/// Vgate 2, 1, 0 by Vdrain 0, 5, 10 on channels 1 and 2, nothing limited
fn bias_plan() -> SweepPlan
{
    SweepPlan::new()
        .vgate_axis(SweepAxis::new(2.0, -1.0, 0.0).unwrap())
        .vdrain_axis(SweepAxis::new(0.0, 5.0, 10.0).unwrap())
        .channels(1, 2)
        .limits(LimitConfig::new())
        .calibration(CalibrationProfile::default())
        .timing(settle(Duration::from_millis(10)))
}

fn rf_plan() -> SweepPlan
{
    bias_plan()
        .rf_power_axis(SweepAxis::single(-10.0).unwrap())
        .rf_frequency_hz(2.4e9)
}

fn assert_all_off(sim: &SimBench)
{
    assert_eq!(sim.bias.enabled_channels(), Vec::<u8>::new());
    assert!(!sim.rf.output_enabled());
}

#[tokio::test(start_paused = true)]
async fn nested_sweep_emits_cross_product()
{
    let sim = SimBench::new();
    sim.bias.set_model(constant_current(0.1));
    let engine = SweepEngine::new(sim.bench());
    let records = MemorySink::new();

    let handle = engine.start(&rf_plan(), records.clone()).unwrap();
    assert_eq!(engine.state(), SweepState::Running);

    let report = handle.join().await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.records_emitted, 9);
    assert_eq!(engine.state(), SweepState::Idle);

    let records = records.records();
    let points: Vec<(f64, f64)> = records.iter().map(|rec| (rec.vgate, rec.vdrain)).collect();
    assert_eq!(points, vec![
        (2.0, 0.0), (2.0, 5.0), (2.0, 10.0),
        (1.0, 0.0), (1.0, 5.0), (1.0, 10.0),
        (0.0, 0.0), (0.0, 5.0), (0.0, 10.0),
    ]);

    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, index as u64);
        assert_eq!(record.rf_power_setpoint_dbm, Some(-10.0));
        assert_eq!(record.rf_frequency_hz, Some(2.4e9));
        assert_eq!(record.current, Some(0.1));
        assert_eq!(record.power_in_raw_dbm, Some(-10.0));
        assert_eq!(record.power_out_raw_dbm, Some(5.0));
        assert_eq!(record.gain_db, Some(15.0));
    }

    for pair in records.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }

    // first gain of the run is the compression reference
    assert_eq!(records[0].compression_db, None);
    assert_eq!(records[1].compression_db, Some(0.0));

    // no DC power at Vdrain = 0
    assert_eq!(records[0].pae_percent, Some(-1.0));
    assert!(records[1].pae_percent.unwrap() > 0.0);

    assert_eq!(report.power_levels.len(), 1);
    assert_eq!(report.power_levels[0].records.len(), 9);
    assert!(report.power_levels[0].complete);
    assert!(report.shutdown_failures.is_empty());
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_active()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bias_only());

    let handle = engine.start(&bias_plan(), MemorySink::new()).unwrap();
    assert_eq!(
        engine.start(&bias_plan(), MemorySink::new()).err(),
        Some(StartError::AlreadyActive(SweepState::Running))
    );

    assert_eq!(handle.join().await.outcome, RunOutcome::Completed);

    // and accepted again once idle
    let handle = engine.start(&bias_plan(), MemorySink::new()).unwrap();
    assert_eq!(handle.join().await.records_emitted, 9);
}

#[tokio::test(start_paused = true)]
async fn invalid_plan_has_no_side_effects()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());

    let plan = SweepPlan::new()
        .vgate_axis(SweepAxis::single(0.0).unwrap())
        .vdrain_axis(SweepAxis::single(1.0).unwrap())
        .channels(1, 2)
        .calibration(CalibrationProfile::default());

    assert_eq!(
        engine.start(&plan, MemorySink::new()).err(),
        Some(StartError::Configuration(ConfigurationError::Missing("limits")))
    );
    assert_eq!(engine.state(), SweepState::Idle);
    assert!(sim.journal.is_empty());

    let rf_without_source = SweepEngine::new(sim.bias_only());
    assert!(matches!(
        rf_without_source.start(&rf_plan(), MemorySink::new()),
        Err(StartError::Configuration(ConfigurationError::Unsupported(_)))
    ));
    assert!(sim.journal.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_holds_progress_and_outputs()
{
    let sim = SimBench::new();
    sim.bias.set_model(constant_current(0.05));
    let engine = SweepEngine::new(sim.bench());
    let (sink, mut rx) = ChannelSink::new();

    let plan = rf_plan().timing(settle(Duration::from_secs(1)));
    let handle = engine.start(&plan, sink).unwrap();
    let mut states = handle.subscribe();

    let mut received = 0;
    while received < 2 {
        rx.recv().await.unwrap();
        received += 1;
    }

    handle.pause();
    states.wait_for(|state| *state == SweepState::Paused).await.unwrap();

    while rx.try_recv().is_ok() {
        received += 1;
    }

    let gate = sim.bias.channel(1);
    let drain = sim.bias.channel(2);
    let rf_on = sim.rf.output_enabled();
    let commands = sim.journal.len();

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(handle.state(), SweepState::Paused);
    assert_eq!(sim.bias.channel(1), gate);
    assert_eq!(sim.bias.channel(2), drain);
    assert_eq!(sim.rf.output_enabled(), rf_on);
    assert_eq!(sim.journal.len(), commands);

    handle.resume();
    states.wait_for(|state| *state != SweepState::Paused).await.unwrap();

    let report = handle.join().await;
    while rx.recv().await.is_some() {
        received += 1;
    }

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(received, 9);
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn stop_reaches_idle_within_a_tick()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());
    let (sink, mut rx) = ChannelSink::new();

    let plan = rf_plan().timing(settle(Duration::from_secs(10)));
    let handle = engine.start(&plan, sink).unwrap();

    rx.recv().await.unwrap();

    let stopped_at = Instant::now();
    handle.stop();
    let report = handle.join().await;

    assert!(stopped_at.elapsed() <= POLL_TICK);
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(engine.state(), SweepState::Idle);
    assert!(!report.power_levels[0].complete);
    assert_all_off(&sim);

    let bias = sim.journal.commands(SimInstrument::Bias);
    let tail: Vec<&str> = bias[bias.len() - 4..].iter().map(String::as_str).collect();
    assert_eq!(tail, vec!["INST:NSEL 1", "OUTP OFF", "INST:NSEL 2", "OUTP OFF"]);
}

#[tokio::test(start_paused = true)]
async fn stop_while_paused()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bias_only());

    let plan = bias_plan().timing(settle(Duration::from_secs(1)));
    let handle = engine.start(&plan, MemorySink::new()).unwrap();
    let mut states = handle.subscribe();

    handle.pause();
    states.wait_for(|state| *state == SweepState::Paused).await.unwrap();

    handle.stop();
    let report = handle.join().await;

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(engine.state(), SweepState::Idle);
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn overcurrent_stops_the_run()
{
    capture_logs();

    let sim = SimBench::new();
    sim.bias.set_model(constant_current(0.02));
    let bias = sim.bias.clone().latency(Duration::from_millis(20));
    let engine = SweepEngine::new(Bench::new(bias));
    let records = MemorySink::new();

    let mut states = engine.subscribe();
    let bias = sim.bias.clone();
    let watcher = tokio::spawn(async move {
        states.wait_for(|state| *state == SweepState::Stopping).await.unwrap();
        states.wait_for(|state| *state == SweepState::Idle).await.unwrap();
        bias.enabled_channels()
    });

    let plan = bias_plan().limits(LimitConfig::new().max_current(0.01));
    let report = engine.start(&plan, records.clone()).unwrap().join().await;

    assert_eq!(
        report.outcome,
        RunOutcome::LimitExceeded(LimitViolation { axis: LimitAxis::Current, value: 0.02, ceiling: 0.01 })
    );
    assert!(logged(|line| line.contains("LimitExceeded") && line.contains("current") && line.contains("0.02")));

    // the offending point is still recorded, nothing after it
    assert_eq!(records.records().len(), 1);
    assert_eq!(records.records()[0].current, Some(0.02));

    // Stopping was observed, and by the time the run was Idle every output was off
    assert_eq!(watcher.await.unwrap(), Vec::<u8>::new());
    assert!(report.shutdown_failures.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsafe_setpoint_is_never_sent()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bias_only());
    let records = MemorySink::new();

    let plan = bias_plan().limits(LimitConfig::new().max_vdrain(7.0));
    let report = engine.start(&plan, records.clone()).unwrap().join().await;

    assert_eq!(
        report.outcome,
        RunOutcome::PreSendRejected(LimitViolation { axis: LimitAxis::Vdrain, value: 10.0, ceiling: 7.0 })
    );
    assert_eq!(records.records().len(), 2);
    assert!(!sim.journal.commands(SimInstrument::Bias).contains(&"VOLT 10".to_string()));
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn channel_limits_are_programmed_and_enforced()
{
    let sim = SimBench::new();
    sim.bias.set_model(constant_current(0.2));
    let engine = SweepEngine::new(sim.bias_only());
    let records = MemorySink::new();

    let plan = bias_plan()
        .vgate_axis(SweepAxis::single(-1.0).unwrap())
        .vdrain_axis(SweepAxis::single(10.0).unwrap())
        .limits(LimitConfig::new().channel(2, ChannelLimit { max_voltage: Some(12.0), max_current: Some(0.05) }));

    let report = engine.start(&plan, records.clone()).unwrap().join().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(records.records()[0].current, Some(0.05));

    let bias = sim.journal.commands(SimInstrument::Bias);
    assert_eq!(&bias[..5], &["INST:NSEL 2", "CURR 0.05", "INST:NSEL 1", "VOLT -1", "OUTP ON"]);
}

#[tokio::test(start_paused = true)]
async fn enable_failure_is_a_channel_fault()
{
    let sim = SimBench::new();
    sim.bias.set_faults(BiasFaults { enable: Some(2), ..Default::default() });
    let engine = SweepEngine::new(sim.bench());
    let records = MemorySink::new();

    let report = engine.start(&rf_plan(), records.clone()).unwrap().join().await;

    match report.outcome {
        RunOutcome::ChannelFault(fault) => {
            assert_eq!(fault.channel, 2);
            assert_eq!(fault.operation, ChannelOperation::EnableOutput);
        },
        other => panic!("expected a channel fault, got {:?}", other),
    }

    assert!(records.records().is_empty());
    // channel 2 failed to enable but is still commanded off
    let bias = sim.journal.commands(SimInstrument::Bias);
    assert!(bias.ends_with(&["INST:NSEL 1".to_string(), "OUTP OFF".to_string(), "INST:NSEL 2".to_string(), "OUTP OFF".to_string()]));
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn select_failure_is_a_channel_fault()
{
    let sim = SimBench::new();
    sim.bias.set_faults(BiasFaults { select: Some(1), ..Default::default() });
    let engine = SweepEngine::new(sim.bias_only());

    let report = engine.start(&bias_plan(), MemorySink::new()).unwrap().join().await;

    assert!(matches!(
        report.outcome,
        RunOutcome::ChannelFault(ref fault) if fault.channel == 1 && fault.operation == ChannelOperation::Select
    ));
    assert_eq!(engine.state(), SweepState::Idle);
}

#[tokio::test(start_paused = true)]
async fn malformed_rf_reply_only_spoils_its_fields()
{
    let sim = SimBench::new();
    sim.bias.set_model(constant_current(0.1));
    sim.rf.set_faults(RfFaults { power_reply: Some("ERR".to_string()), ..Default::default() });
    let engine = SweepEngine::new(sim.bench());
    let records = MemorySink::new();

    let report = engine.start(&rf_plan(), records.clone()).unwrap().join().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(records.records().len(), 9);

    for record in records.records() {
        assert_eq!(record.current, Some(0.1));
        assert_eq!(record.rf_frequency_hz, Some(2.4e9));
        assert_eq!(record.power_in_raw_dbm, None);
        assert_eq!(record.power_in_actual_dbm, None);
        assert_eq!(record.power_out_raw_dbm, Some(5.0));
        assert_eq!(record.power_out_actual_dbm, Some(5.0));
        assert_eq!(record.gain_db, None);
        assert_eq!(record.compression_db, None);
        assert_eq!(record.pae_percent, None);
    }
}

#[tokio::test(start_paused = true)]
async fn lost_current_reading_is_not_fatal()
{
    let sim = SimBench::new();
    sim.bias.set_faults(BiasFaults { current_reads: true, ..Default::default() });
    let engine = SweepEngine::new(sim.bench());
    let records = MemorySink::new();

    let plan = rf_plan().limits(LimitConfig::new().max_current(0.01));
    let report = engine.start(&plan, records.clone()).unwrap().join().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    for record in records.records() {
        assert_eq!(record.current, None);
        assert_eq!(record.pae_percent, None);
        assert_eq!(record.gain_db, Some(15.0));
    }
}

#[tokio::test(start_paused = true)]
async fn rf_levels_are_stepped_and_archived()
{
    let sim = SimBench::new();
    let meter = SimPowerMeter::coupled(&sim.rf, 15.0).saturation(0.0);
    let bench = Bench::new(sim.bias.clone())
        .with_rf_source(sim.rf.clone())
        .with_power_meter(meter);
    let engine = SweepEngine::new(bench);
    let records = MemorySink::new();

    let plan = bias_plan()
        .vgate_axis(SweepAxis::single(-2.0).unwrap())
        .vdrain_axis(SweepAxis::new(0.0, 28.0, 28.0).unwrap())
        .rf_power_axis(SweepAxis::new(-20.0, 10.0, 0.0).unwrap())
        .rf_frequency_hz(2.4e9);

    let report = engine.start(&plan, records.clone()).unwrap().join().await;
    assert_eq!(report.outcome, RunOutcome::Completed);

    let rf = sim.journal.commands(SimInstrument::Rf);
    let mut expected = vec!["FREQ 2400000000 Hz".to_string()];
    for level in ["-20", "-10", "0"] {
        expected.push("OUTP OFF".to_string());
        expected.push(format!("POW {} dBm", level));
        expected.push("OUTP ON".to_string());
        for _ in 0..2 {
            expected.push("FREQ?".to_string());
            expected.push("POW?".to_string());
        }
    }
    expected.push("OUTP OFF".to_string());
    assert_eq!(rf, expected);
    assert_eq!(sim.journal.commands(SimInstrument::Meter).len(), 6);

    let levels: Vec<Option<f64>> = report.power_levels.iter().map(|level| level.rf_power_dbm).collect();
    assert_eq!(levels, vec![Some(-20.0), Some(-10.0), Some(0.0)]);
    assert_eq!(records.finished_levels(), levels);
    assert!(report.power_levels.iter().all(|level| level.complete && level.records.len() == 2));

    // the amplifier saturates at 0 dBm out
    let compression: Vec<Option<f64>> = records.records().iter().map(|rec| rec.compression_db).collect();
    assert_eq!(compression, vec![None, Some(0.0), Some(5.0), Some(5.0), Some(15.0), Some(15.0)]);
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn compression_reference_resets_per_run()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());

    for _ in 0..2 {
        let records = MemorySink::new();
        engine.start(&rf_plan(), records.clone()).unwrap().join().await;
        assert_eq!(records.records()[0].compression_db, None);
        assert_eq!(records.records()[0].sequence, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_switches_off_immediately()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());
    let (sink, mut rx) = ChannelSink::new();

    let plan = rf_plan().timing(settle(Duration::from_secs(10)));
    let handle = engine.start(&plan, sink).unwrap();
    rx.recv().await.unwrap();

    assert!(!sim.bias.enabled_channels().is_empty());
    let failures = handle.emergency_stop().await;

    assert!(failures.is_empty());
    assert_all_off(&sim);

    let report = handle.join().await;
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(engine.state(), SweepState::Idle);
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn failed_shutdown_is_reported_and_retried()
{
    let sim = SimBench::new();
    sim.bias.set_faults(BiasFaults { disable: Some(1), ..Default::default() });
    let engine = SweepEngine::new(sim.bias_only());
    let (sink, mut rx) = ChannelSink::new();

    let handle = engine.start(&bias_plan().timing(settle(Duration::from_secs(10))), sink).unwrap();
    rx.recv().await.unwrap();
    handle.stop();
    let report = handle.join().await;

    assert_eq!(report.shutdown_failures.len(), 1);
    assert_eq!(report.shutdown_failures[0].target, OutputTarget::BiasChannel(1));
    assert_eq!(sim.bias.enabled_channels(), vec![1]);

    sim.bias.set_faults(BiasFaults::default());
    assert!(engine.emergency_stop().await.is_empty());
    assert_eq!(sim.bias.enabled_channels(), Vec::<u8>::new());
}

#[tokio::test(start_paused = true)]
async fn all_outputs_off_covers_every_channel()
{
    use arcs_pasweep::BiasSource;

    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());

    // switched on behind the engine's back
    let mut bias = sim.bias.clone();
    bias.select_channel(4).await.unwrap();
    bias.set_output_enabled(true).await.unwrap();
    sim.journal.clear();

    assert!(engine.all_outputs_off().await.is_empty());
    assert_all_off(&sim);

    let commands = sim.journal.commands(SimInstrument::Bias);
    for channel in 1..=4 {
        assert!(commands.contains(&format!("INST:NSEL {}", channel)));
    }
    assert_eq!(sim.journal.commands(SimInstrument::Rf), vec!["OUTP OFF"]);
}

#[tokio::test(start_paused = true)]
async fn single_setpoint_and_monitor()
{
    let sim = SimBench::new();
    sim.bias.set_model(constant_current(0.3));
    let engine = SweepEngine::new(sim.bias_only());
    let channels = ChannelAssignment { vgate: 1, vdrain: 2 };
    let limits = LimitConfig::new().max_vgate(5.0);

    let commands = sim.journal.len();
    assert!(matches!(
        engine.set_point(channels, &limits, -6.0, 28.0).await,
        Err(BenchError::LimitRejected(LimitViolation { axis: LimitAxis::Vgate, .. }))
    ));
    assert_eq!(sim.journal.len(), commands);

    engine.set_point(channels, &limits, -2.0, 28.0).await.unwrap();
    assert_eq!(sim.bias.enabled_channels(), vec![1, 2]);
    assert_eq!(sim.bias.channel(1).unwrap().voltage, -2.0);

    let readings = engine.monitor().await.unwrap();
    assert_eq!(readings.len(), 4);
    assert_eq!(readings[0].voltage, Some(-2.0));
    assert!(readings[0].enabled);
    assert_eq!(readings[1].current, Some(0.3));
    assert_eq!(readings[1].voltage, Some(28.0));
    assert!(!readings[2].enabled);
    assert_eq!(readings[2].voltage, Some(0.0));

    assert!(engine.emergency_stop().await.is_empty());
    assert_eq!(sim.bias.enabled_channels(), Vec::<u8>::new());
}

#[tokio::test(start_paused = true)]
async fn bench_operations_wait_for_idle()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bias_only());

    let handle = engine.start(&bias_plan().timing(settle(Duration::from_secs(10))), MemorySink::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let channels = ChannelAssignment { vgate: 1, vdrain: 2 };
    assert!(matches!(
        engine.set_point(channels, &LimitConfig::new(), 0.0, 1.0).await,
        Err(BenchError::Busy(SweepState::Running))
    ));
    assert!(matches!(engine.monitor().await, Err(BenchError::Busy(_))));

    handle.stop();
    assert_eq!(handle.join().await.outcome, RunOutcome::Aborted);
}

#[tokio::test(start_paused = true)]
async fn failed_setpoint_leaves_nothing_energized()
{
    let sim = SimBench::new();
    sim.bias.set_faults(BiasFaults { enable: Some(2), ..Default::default() });
    let engine = SweepEngine::new(sim.bias_only());
    let channels = ChannelAssignment { vgate: 1, vdrain: 2 };

    match engine.set_point(channels, &LimitConfig::new(), -2.0, 28.0).await {
        Err(BenchError::ChannelFault { fault, shutdown_failures }) => {
            assert_eq!(fault.channel, 2);
            assert_eq!(fault.operation, ChannelOperation::EnableOutput);
            assert!(shutdown_failures.is_empty());
        },
        other => panic!("expected a channel fault, got {:?}", other),
    }

    assert_eq!(sim.bias.enabled_channels(), Vec::<u8>::new());
    assert_eq!(engine.state(), SweepState::Idle);
}

#[test]
fn start_outside_a_runtime_is_refused()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bias_only());

    assert_eq!(engine.start(&bias_plan(), MemorySink::new()).err(), Some(StartError::NoRuntime));
    assert_eq!(engine.state(), SweepState::Idle);
    assert!(sim.journal.is_empty());
}

/// Blows up on the first record
struct ExplodingSink;

impl RecordSink for ExplodingSink
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>
    {
        panic!("sink cannot take record {}", record.sequence);
    }
}

#[tokio::test(start_paused = true)]
async fn panicked_run_is_reported_by_join()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());

    let report = engine.start(&rf_plan(), ExplodingSink).unwrap().join().await;

    assert_eq!(report.outcome, RunOutcome::Panicked);
    assert!(report.shutdown_failures.is_empty());
    assert_eq!(engine.state(), SweepState::Idle);
    assert_all_off(&sim);
}

#[tokio::test(start_paused = true)]
async fn panicked_run_shuts_down_without_a_handle()
{
    let sim = SimBench::new();
    let engine = SweepEngine::new(sim.bench());
    let mut states = engine.subscribe();

    drop(engine.start(&rf_plan(), ExplodingSink).unwrap());
    states.wait_for(|state| *state == SweepState::Idle).await.unwrap();

    assert_all_off(&sim);

    // and the engine is usable again
    let report = engine.start(&rf_plan(), MemorySink::new()).unwrap().join().await;
    assert_eq!(report.outcome, RunOutcome::Completed);
}
