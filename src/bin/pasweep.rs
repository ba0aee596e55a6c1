//! # pasweep
//!
//! Headless runner for power amplifier sweeps on serial-attached instruments.
//!
//! ```bash
//! # Run the sweep described by a configuration file, writing records to CSV
//! pasweep run bench.toml --csv results.csv
//!
//! # Read back every bias channel
//! pasweep monitor bench.toml
//!
//! # Apply one bias point, then switch everything off again
//! pasweep set bench.toml --vgate -2.5 --vdrain 28
//! pasweep off bench.toml
//! ```

use anyhow::{ Context, Result };
use clap::{ Parser, Subcommand };
use log::{ error, info, warn };
use std::{ path::{ Path, PathBuf }, time::Duration };
use tokio_serial::{ SerialPortBuilderExt, SerialStream };

use arcs_pasweep::{
    Bench, CsvSink, FanOut, N5173b, Ngp800, PowerMeter, RecordSink, RunOutcome, SampleRecord, SinkError,
    SweepConfig, SweepEngine, DEFAULT_QUERY_TIMEOUT,
    plan::ChannelAssignment,
    sweep::ShutdownFailure,
};

const DEFAULT_BAUD_RATE: u32 = 9600;

/// Power amplifier bias and RF power sweeps
#[derive(Parser)]
#[command(name = "pasweep")]
#[command(author, version, about, long_about = None)]
struct Cli
{
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands
{
    /// Run the sweep described by a configuration file
    Run {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Write every record to this CSV file
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
    /// Read back voltage and current of every bias channel
    Monitor {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
    /// Apply a single gate/drain bias point
    Set {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        #[arg(long, allow_negative_numbers = true)]
        vgate: f64,

        #[arg(long, allow_negative_numbers = true)]
        vdrain: f64,
    },
    /// Switch off every bias channel and the RF output
    Off {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

/// Logs one line per record
struct ProgressSink;

impl RecordSink for ProgressSink
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>
    {
        info!(
            "#{} Vg={} V Vd={} V Id={} Pout={} gain={}",
            record.sequence,
            record.vgate,
            record.vdrain,
            optional(record.current, "A"),
            optional(record.power_out_actual_dbm, "dBm"),
            optional(record.gain_db, "dB"),
        );
        Ok(())
    }

    fn finish_power_level(&mut self, rf_power_dbm: Option<f64>) -> Result<(), SinkError>
    {
        if let Some(dbm) = rf_power_dbm {
            info!("RF level {} dBm done", dbm);
        }
        Ok(())
    }
}

fn optional(value: Option<f64>, unit: &str) -> String
{
    match value {
        Some(value) => format!("{:.4} {}", value, unit),
        None => "-".to_string(),
    }
}

fn open(path: &str, baud_rate: u32) -> Result<SerialStream>
{
    tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .with_context(|| format!("failed to open {}", path))
}

/// Opens and identifies every instrument listed under `[ports]`
async fn connect(config: &SweepConfig) -> Result<Bench>
{
    let ports = &config.ports;
    let baud_rate = ports.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let timeout = ports.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_QUERY_TIMEOUT);

    let bias_port = ports.bias.as_deref().context("no bias supply port configured ([ports] bias)")?;
    let mut bias = Ngp800::with_channels(open(bias_port, baud_rate)?, ports.bias_channels.unwrap_or(4));
    bias.set_timeout(timeout);
    info!("bias supply on {}: {}", bias_port, bias.identify().await?);

    let mut bench = Bench::new(bias);

    if let Some(path) = ports.rf.as_deref() {
        let mut rf = N5173b::with(open(path, baud_rate)?);
        rf.set_timeout(timeout);
        info!("signal generator on {}: {}", path, rf.identify().await?);
        bench = bench.with_rf_source(rf);
    }

    if let Some(path) = ports.meter.as_deref() {
        let (mut meter, identity) = PowerMeter::connect(open(path, baud_rate)?).await?;
        meter.set_timeout(timeout);
        info!("power meter on {}: {} ({:?})", path, identity, meter.dialect());
        bench = bench.with_power_meter(meter);
    }

    Ok(bench)
}

async fn load(path: &Path) -> Result<(SweepConfig, SweepEngine)>
{
    let config = SweepConfig::from_file(path)?;
    let engine = SweepEngine::new(connect(&config).await?);
    Ok((config, engine))
}

fn report_shutdown(failures: &[ShutdownFailure]) -> Result<()>
{
    for failure in failures {
        error!("{:?} may still be on: {}", failure.target, failure.message);
    }

    if !failures.is_empty() {
        anyhow::bail!("{} output(s) could not be confirmed off", failures.len());
    }

    Ok(())
}

async fn run(config_path: &Path, csv: Option<&Path>) -> Result<()>
{
    let (config, engine) = load(config_path).await?;
    let plan = config.to_plan()?;

    let mut sink = FanOut::new().with(ProgressSink);
    if let Some(path) = csv {
        sink = sink.with(CsvSink::create(path)?);
        info!("writing records to {}", path.display());
    }

    let handle = engine.start(&plan, sink)?;
    let join = handle.join();
    tokio::pin!(join);

    let report = tokio::select! {
        report = &mut join => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, switching outputs off");
            report_shutdown(&engine.emergency_stop().await)?;
            join.await
        },
    };

    info!("{} records over {} RF level(s)", report.records_emitted, report.power_levels.len());
    report_shutdown(&report.shutdown_failures)?;

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Aborted => {
            warn!("sweep aborted");
            Ok(())
        },
        outcome => anyhow::bail!("sweep stopped: {:?}", outcome),
    }
}

async fn monitor(config_path: &Path) -> Result<()>
{
    let (_, engine) = load(config_path).await?;

    println!("{:>7} {:>12} {:>12} {:>6}", "channel", "voltage (V)", "current (A)", "output");
    for reading in engine.monitor().await? {
        println!(
            "{:>7} {:>12} {:>12} {:>6}",
            reading.channel,
            reading.voltage.map_or("-".to_string(), |v| format!("{:.4}", v)),
            reading.current.map_or("-".to_string(), |a| format!("{:.5}", a)),
            if reading.enabled { "on" } else { "-" },
        );
    }

    Ok(())
}

async fn set_point(config_path: &Path, vgate: f64, vdrain: f64) -> Result<()>
{
    let (config, engine) = load(config_path).await?;

    let channels = config.channels.context("no [channels] configured")?;
    let limits = config.limits.as_ref().context("no [limits] configured")?.to_limit_config()?;

    let assignment = ChannelAssignment { vgate: channels.vgate, vdrain: channels.vdrain };
    engine.set_point(assignment, &limits, vgate, vdrain).await?;
    info!("vgate {} V on channel {}, vdrain {} V on channel {}", vgate, channels.vgate, vdrain, channels.vdrain);

    Ok(())
}

async fn off(config_path: &Path) -> Result<()>
{
    let (_, engine) = load(config_path).await?;
    report_shutdown(&engine.all_outputs_off().await)
}

#[tokio::main]
async fn main() -> Result<()>
{
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Run { config, csv } => run(&config, csv.as_deref()).await,
        Commands::Monitor { config } => monitor(&config).await,
        Commands::Set { config, vgate, vdrain } => set_point(&config, vgate, vdrain).await,
        Commands::Off { config } => off(&config).await,
    }
}
