//! **A**synchronous-Rust **R**emote **C**ontrol for **S**CPI **p**ower **a**mplifier **sweep**s
//!
//! Drives a nested bias and RF power sweep across three lab instruments to characterize an RF
//! power amplifier:
//!   - a multi-channel DC supply biasing gate and drain ([`Ngp800`])
//!   - an RF signal generator driving the amplifier input ([`N5173b`])
//!   - an RF power meter reading the amplifier output ([`PowerMeter`])
//!
//! For every gate/drain/RF-power point the engine records drain current, input and output power,
//! gain, power-added efficiency and gain compression, checking measured values against safety
//! ceilings as it goes.
//!
//! # Example
//! ```no_run
//! use arcs_pasweep::{
//!     CalibrationProfile, LimitConfig, MemorySink, SweepAxis, SweepEngine, SweepPlan,
//!     sim::SimBench,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = SimBench::new();
//! let engine = SweepEngine::new(sim.bench());
//!
//! let plan = SweepPlan::new()
//!     .vgate_axis(SweepAxis::new(-3.0, 0.5, -1.0)?)
//!     .vdrain_axis(SweepAxis::new(0.0, 7.0, 28.0)?)
//!     .rf_power_axis(SweepAxis::new(-20.0, 2.0, 0.0)?)
//!     .rf_frequency_hz(2.4e9)
//!     .channels(1, 2)
//!     .limits(LimitConfig::new().max_vgate(5.0).max_vdrain(30.0).max_current(0.8))
//!     .calibration(CalibrationProfile { input_loss_db: 1.2, input_gain_db: 0.0, output_loss_db: 30.0 });
//!
//! let records = MemorySink::new();
//! let handle = engine.start(&plan, records.clone())?;
//! let report = handle.join().await;
//!
//! println!("{:?}: {} records", report.outcome, records.records().len());
//! # Ok(())
//! # }
//! ```
//!
//! Real instruments are constructed from any tokio async I/O stream, e.g. a `tokio_serial`
//! port or a TCP connection to the instrument's raw SCPI socket.

pub mod axis;
pub mod calibration;
pub mod cmd;
pub mod config;
pub mod control;
pub mod devices;
pub mod error;
mod executor;
pub mod limits;
pub mod plan;
pub mod record;
pub mod reply;
pub mod sim;
pub mod sweep;

pub use axis::{ SweepAxis, generate };
pub use calibration::{ CalibrationProfile, CompressionTracker, RfMetrics };
pub use config::SweepConfig;
pub use control::{ SweepControl, POLL_TICK };
pub use devices::{ BiasSource, RfSource, PowerSensor, Ngp800, N5173b, PowerMeter, PowerMeterDialect };
pub use error::{ ConfigurationError, InstrumentError, StartError, BenchError, SinkError };
pub use executor::DEFAULT_QUERY_TIMEOUT;
pub use limits::{ LimitConfig, ChannelLimit, LimitAxis, LimitViolation };
pub use plan::{ SweepPlan, SettleTiming, Capabilities, CompiledPlan };
pub use record::{ SampleRecord, RecordSink, ChannelSink, MemorySink, CsvSink, FanOut };
pub use reply::Identity;
pub use sweep::{ Bench, SweepEngine, SweepHandle, SweepState, SweepReport, RunOutcome };
