//! Runs against real instruments. Needs `--features serial` and `--ignored`.
#![cfg(feature = "serial")]

use std::time::Duration;
use tokio_serial::{ SerialPortBuilderExt, SerialStream };

use arcs_pasweep::{
    BiasSource, Bench, CalibrationProfile, LimitConfig, MemorySink, N5173b, Ngp800, PowerMeter, RunOutcome,
    RfSource, SweepAxis, SweepEngine, SweepPlan,
};

const BIAS_PORT: &'static str = "/dev/ttyUSB0";
const RF_PORT: &'static str = "/dev/ttyUSB1";
const METER_PORT: &'static str = "/dev/ttyACM0";
const BAUD_RATE: u32 = 9600;

fn open(path: &str) -> SerialStream
{
    tokio_serial::new(path, BAUD_RATE)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn bias_supply_round_trip()
{
    let mut supply = Ngp800::with(open(BIAS_PORT));

    let identity = supply.identify().await.unwrap();
    println!("{}", identity);
    assert!(identity.mentions("NGP"));

    supply.select_channel(1).await.unwrap();
    supply.set_voltage(1.5).await.unwrap();
    supply.set_output_enabled(false).await.unwrap();

    assert_eq!(supply.measure_voltage().await.unwrap(), 0.0);
}

#[tokio::test]
#[ignore]
async fn signal_generator_round_trip()
{
    let mut generator = N5173b::with(open(RF_PORT));

    println!("{}", generator.identify().await.unwrap());

    generator.set_output_enabled(false).await.unwrap();
    generator.set_frequency(1.0e9).await.unwrap();
    generator.set_power(-30.0).await.unwrap();

    assert_eq!(generator.query_frequency().await.unwrap(), 1.0e9);
    assert_eq!(generator.query_power().await.unwrap(), -30.0);
}

#[tokio::test]
#[ignore]
async fn short_sweep_into_a_dummy_load()
{
    let mut bias = Ngp800::with(open(BIAS_PORT));
    let mut rf = N5173b::with(open(RF_PORT));
    let (mut meter, identity) = PowerMeter::connect(open(METER_PORT)).await.unwrap();

    println!("meter: {} ({:?})", identity, meter.dialect());

    bias.set_timeout(Duration::from_secs(3));
    rf.set_timeout(Duration::from_secs(3));
    meter.set_timeout(Duration::from_secs(5));

    let engine = SweepEngine::new(Bench::new(bias).with_rf_source(rf).with_power_meter(meter));

    let plan = SweepPlan::new()
        .vgate_axis(SweepAxis::single(-3.0).unwrap())
        .vdrain_axis(SweepAxis::new(0.0, 1.0, 2.0).unwrap())
        .rf_power_axis(SweepAxis::new(-30.0, 10.0, -20.0).unwrap())
        .rf_frequency_hz(1.0e9)
        .channels(1, 2)
        .limits(LimitConfig::new().max_vgate(5.0).max_vdrain(3.0).max_current(0.05))
        .calibration(CalibrationProfile::default());

    let records = MemorySink::new();
    let report = engine.start(&plan, records.clone()).unwrap().join().await;

    for record in records.records() {
        println!("{:?}", record);
    }

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.records_emitted, 6);
    assert!(report.shutdown_failures.is_empty());
}
