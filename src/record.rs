//! Sample records and where they go
//!
//! One [`SampleRecord`] is produced per completed drain-voltage point. Records are handed to a
//! [`RecordSink`] in the order they were measured. A sink failing never stops a sweep: the
//! instruments are still energized and the run must reach its normal shutdown either way.

use std::{
    io::Write,
    sync::{ Arc, Mutex },
};
use chrono::{ DateTime, Local };
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// One measurement point
///
/// Every field derived from an RF reading is `None` if that reading failed. CSV export writes such
/// fields as empty cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord
{
    /// Position of the record within its run, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Local>,
    /// RF power level the generator was commanded to, if an RF source is attached
    pub rf_power_setpoint_dbm: Option<f64>,
    pub vgate: f64,
    pub vdrain: f64,
    /// Drain current in amperes
    pub current: Option<f64>,
    pub rf_frequency_hz: Option<f64>,
    pub power_in_raw_dbm: Option<f64>,
    pub power_out_raw_dbm: Option<f64>,
    pub power_in_actual_dbm: Option<f64>,
    pub power_out_actual_dbm: Option<f64>,
    pub power_in_actual_mw: Option<f64>,
    pub power_out_actual_mw: Option<f64>,
    pub gain_db: Option<f64>,
    pub compression_db: Option<f64>,
    pub pae_percent: Option<f64>,
}

/// Consumer of the record stream of a run
pub trait RecordSink: Send
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>;

    /// Called after the inner sweep of an RF power level has finished
    fn finish_power_level(&mut self, _rf_power_dbm: Option<f64>) -> Result<(), SinkError>
    {
        Ok(())
    }

    /// Called once when the run ends, however it ends
    fn flush(&mut self) -> Result<(), SinkError>
    {
        Ok(())
    }
}

/// Sends every record down a tokio channel, e.g. to a display task
pub struct ChannelSink
{
    tx: mpsc::UnboundedSender<SampleRecord>,
}

impl ChannelSink
{
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SampleRecord>)
    {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: tx }, rx)
    }
}

impl RecordSink for ChannelSink
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>
    {
        self.tx.send(record.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Keeps every record in memory
#[derive(Clone, Default)]
pub struct MemorySink
{
    records: Arc<Mutex<Vec<SampleRecord>>>,
    levels_finished: Arc<Mutex<Vec<Option<f64>>>>,
}

impl MemorySink
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn records(&self) -> Vec<SampleRecord>
    {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// RF power levels reported finished so far, in order
    pub fn finished_levels(&self) -> Vec<Option<f64>>
    {
        match self.levels_finished.lock() {
            Ok(levels) => levels.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RecordSink for MemorySink
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>
    {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }

    fn finish_power_level(&mut self, rf_power_dbm: Option<f64>) -> Result<(), SinkError>
    {
        match self.levels_finished.lock() {
            Ok(mut levels) => levels.push(rf_power_dbm),
            Err(poisoned) => poisoned.into_inner().push(rf_power_dbm),
        }
        Ok(())
    }
}

/// Writes records as CSV rows with a header of field names
pub struct CsvSink<W>
    where W: Write
{
    writer: csv::Writer<W>,
}

impl <W> CsvSink<W>
    where W: Write
{
    pub fn new(writer: W) -> Self
    {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, SinkError>
    {
        self.writer
            .into_inner()
            .map_err(|err| SinkError::Io(err.into_error()))
    }
}

impl CsvSink<std::fs::File>
{
    pub fn create<P>(path: P) -> Result<Self, SinkError>
        where P: AsRef<std::path::Path>
    {
        Ok(Self {
            writer: csv::Writer::from_path(path)?,
        })
    }
}

impl <W> RecordSink for CsvSink<W>
    where W: Write + Send
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>
    {
        self.writer.serialize(record)?;
        Ok(())
    }

    fn finish_power_level(&mut self, _rf_power_dbm: Option<f64>) -> Result<(), SinkError>
    {
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError>
    {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every record to several sinks
///
/// Each sink is fed independently; the first error is returned after all sinks have been tried.
pub struct FanOut
{
    sinks: Vec<Box<dyn RecordSink>>,
}

impl FanOut
{
    pub fn new() -> Self
    {
        Self { sinks: Vec::new() }
    }

    pub fn with<S>(mut self, sink: S) -> Self
        where S: RecordSink + 'static
    {
        self.sinks.push(Box::new(sink));
        self
    }

    fn each<F>(&mut self, mut op: F) -> Result<(), SinkError>
        where F: FnMut(&mut dyn RecordSink) -> Result<(), SinkError>
    {
        let mut first_err = None;

        for sink in self.sinks.iter_mut() {
            if let Err(err) = op(sink.as_mut()) {
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

impl Default for FanOut
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl RecordSink for FanOut
{
    fn emit(&mut self, record: &SampleRecord) -> Result<(), SinkError>
    {
        self.each(|sink| sink.emit(record))
    }

    fn finish_power_level(&mut self, rf_power_dbm: Option<f64>) -> Result<(), SinkError>
    {
        self.each(|sink| sink.finish_power_level(rf_power_dbm))
    }

    fn flush(&mut self) -> Result<(), SinkError>
    {
        self.each(|sink| sink.flush())
    }
}
