//! Per-cycle log records of aggregators, and sinks that collect them.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::CategoryProfile;
use crate::sync::lock;

/// Column header of the CSV export.
const HEADER: &str = "id,now,current,demand,expected,max,min,request,\
                      nextDemand,nextMax,nextMin,nextRequest,nowMillis,\
                      timeslotMillis,timeslot";

/// One record of a node's state.
///
/// Energies are integrals in watt-seconds over the current window
/// `[timeslot - len, timeslot)` or the next window `[timeslot, timeslot + len)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub id: String,
    /// Wall-clock time of the record, epoch milliseconds.
    pub now: i64,
    /// End of the current window, epoch milliseconds.
    pub timeslot: i64,
    /// Instantaneous aggregate demand (W).
    pub current: f64,
    pub demand: f64,
    pub expected: f64,
    pub max: f64,
    pub min: f64,
    /// Contracted energy; only present under contract.
    pub request: Option<f64>,
    pub next_demand: f64,
    pub next_max: f64,
    pub next_min: f64,
    pub next_request: Option<f64>,
}

impl LogLine {
    /// Builds a record from the actual aggregate and the expected profile
    /// (the committed target under contract, else the aggregate itself).
    pub fn from_profiles(
        id: &str,
        current: &CategoryProfile,
        expected: &CategoryProfile,
        now: DateTime<Utc>,
        timeslot: DateTime<Utc>,
        slot_len: Duration,
        contract: bool,
    ) -> Self {
        let prev = timeslot - slot_len;
        let next = timeslot + slot_len;
        Self {
            id: id.to_string(),
            now: now.timestamp_millis(),
            timeslot: timeslot.timestamp_millis(),
            current: current.demand.value_at(now),
            demand: current.demand.integral(prev, timeslot),
            expected: expected.demand.integral(prev, timeslot),
            max: expected.max_flex.integral(prev, timeslot),
            min: expected.min_flex.integral(prev, timeslot),
            request: contract.then(|| expected.demand.integral(prev, timeslot)),
            next_demand: current.demand.integral(timeslot, next),
            next_max: expected.max_flex.integral(timeslot, next),
            next_min: expected.min_flex.integral(timeslot, next),
            next_request: contract.then(|| expected.demand.integral(timeslot, next)),
        }
    }

    pub fn now_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now).unwrap_or_default()
    }

    pub fn timeslot_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timeslot).unwrap_or_default()
    }

    fn csv_record(&self) -> [String; 15] {
        let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        [
            self.id.clone(),
            iso(self.now_time()),
            self.current.to_string(),
            self.demand.to_string(),
            self.expected.to_string(),
            self.max.to_string(),
            self.min.to_string(),
            opt(self.request),
            self.next_demand.to_string(),
            self.next_max.to_string(),
            self.next_min.to_string(),
            opt(self.next_request),
            self.now.to_string(),
            self.timeslot.to_string(),
            iso(self.timeslot_time()),
        ]
    }
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Writes log records as CSV to any writer.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_csv<'a>(lines: impl IntoIterator<Item = &'a LogLine>, writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(HEADER.split(',').map(str::trim))?;
    for line in lines {
        wtr.write_record(line.csv_record())?;
    }
    wtr.flush()?;
    Ok(())
}

/// Exports log records to a CSV file at `path`.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_csv(lines: &[LogLine], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_csv(lines, io::BufWriter::new(file))
}

/// Destination of log records.
pub trait LogSink: Send + Sync {
    fn log(&self, line: LogLine);
}

/// Summary of a [`MemoryLog`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStats {
    pub count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Collects records in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<LogLine>>,
}

impl MemoryLog {
    /// Retention used by [`forget`](Self::forget) when no age is given.
    pub const DEFAULT_RETENTION_DAYS: i64 = 7;

    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records.
    pub fn lines(&self) -> Vec<LogLine> {
        lock(&self.lines).clone()
    }

    /// Records of one node.
    pub fn lines_for(&self, id: &str) -> Vec<LogLine> {
        lock(&self.lines).iter().filter(|l| l.id == id).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.lines).is_empty()
    }

    pub fn stats(&self) -> LogStats {
        let lines = lock(&self.lines);
        LogStats {
            count: lines.len(),
            oldest: lines.first().map(LogLine::now_time),
            newest: lines.last().map(LogLine::now_time),
        }
    }

    pub fn clear(&self) {
        lock(&self.lines).clear();
    }

    /// Drops leading records older than `days` (default 7) before `now`.
    ///
    /// Records arrive nearly in order, so scanning stops at the first one
    /// that is recent enough. Returns how many were dropped.
    pub fn forget(&self, now: DateTime<Utc>, days: Option<i64>) -> usize {
        let gauge = (now - Duration::days(days.unwrap_or(Self::DEFAULT_RETENTION_DAYS))).timestamp_millis();
        let mut lines = lock(&self.lines);
        let stale = lines.iter().take_while(|l| l.now < gauge).count();
        lines.drain(..stale);
        stale
    }

    /// Writes every record as CSV.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if writing fails.
    pub fn write_csv(&self, writer: impl Write) -> io::Result<()> {
        write_csv(lock(&self.lines).iter(), writer)
    }
}

impl LogSink for MemoryLog {
    fn log(&self, line: LogLine) {
        lock(&self.lines).push(line);
    }
}
