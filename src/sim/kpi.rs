//! Post-hoc summary of a run, computed from the root's log records.

use std::fmt;

use chrono::Duration;
use serde::Serialize;

use crate::logline::LogLine;

/// Contract-tracking indicators of the root aggregator.
///
/// Deviations compare the contracted energy of the current window with
/// the aggregate demand over it and are expressed as average power.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Id of the node the summary describes.
    pub root: String,
    /// All log records of the root.
    pub records: usize,
    /// Records written under contract.
    pub contract_records: usize,
    /// Mean absolute deviation from the contract (W).
    pub mae_deviation_watts: f64,
    /// Root-mean-square deviation from the contract (W).
    pub rmse_deviation_watts: f64,
    /// Largest instantaneous aggregate demand seen (W).
    pub peak_demand_watts: f64,
    /// Timeslots in which the root logged at least once.
    pub timeslots: usize,
}

impl RunSummary {
    /// Summarizes the records of `root` among `lines`.
    pub fn from_lines(lines: &[LogLine], root: &str, slot_len: Duration) -> Self {
        let secs = slot_len.num_seconds().max(1) as f64;
        let mut records = 0;
        let mut contract_records = 0;
        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut peak = 0.0_f64;
        let mut slots = Vec::new();

        for line in lines.iter().filter(|l| l.id == root) {
            records += 1;
            peak = peak.max(line.current);
            if slots.last() != Some(&line.timeslot) {
                slots.push(line.timeslot);
            }
            if let Some(request) = line.request {
                let deviation = (line.demand - request) / secs;
                contract_records += 1;
                abs_sum += deviation.abs();
                sq_sum += deviation * deviation;
            }
        }
        slots.sort_unstable();
        slots.dedup();

        let (mae, rmse) = if contract_records > 0 {
            let n = contract_records as f64;
            (abs_sum / n, (sq_sum / n).sqrt())
        } else {
            (0.0, 0.0)
        };

        Self {
            root: root.to_string(),
            records,
            contract_records,
            mae_deviation_watts: mae,
            rmse_deviation_watts: rmse,
            peak_demand_watts: peak,
            timeslots: slots.len(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Run Summary ({}) ---", self.root)?;
        writeln!(f, "Log records:           {}", self.records)?;
        writeln!(f, "Timeslots:             {}", self.timeslots)?;
        writeln!(f, "Under contract:        {}", self.contract_records)?;
        writeln!(f, "MAE deviation:         {:.1} W", self.mae_deviation_watts)?;
        writeln!(f, "RMSE deviation:        {:.1} W", self.rmse_deviation_watts)?;
        write!(f, "Peak demand:           {:.1} W", self.peak_demand_watts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(id: &str, timeslot: i64, current: f64, demand: f64, request: Option<f64>) -> LogLine {
        LogLine {
            id: id.to_string(),
            now: timeslot - 1_000,
            timeslot,
            current,
            demand,
            expected: request.unwrap_or(demand),
            max: 0.0,
            min: 0.0,
            request,
            next_demand: 0.0,
            next_max: 0.0,
            next_min: 0.0,
            next_request: None,
        }
    }

    #[test]
    fn deviation_is_average_power() {
        // 900 s slots; deviations of +90 kWs and -180 kWs are 100 W and 200 W.
        let lines = vec![
            line("bus_0", 900_000, 500.0, 90_000.0, Some(0.0)),
            line("bus_0", 1_800_000, 700.0, 0.0, Some(180_000.0)),
        ];
        let summary = RunSummary::from_lines(&lines, "bus_0", Duration::minutes(15));
        assert_eq!(summary.contract_records, 2);
        assert!((summary.mae_deviation_watts - 150.0).abs() < 1e-9);
        assert!((summary.rmse_deviation_watts - 25_000.0_f64.sqrt()).abs() < 1e-9);
        assert_eq!(summary.peak_demand_watts, 700.0);
    }

    #[test]
    fn other_nodes_and_free_running_records_are_ignored() {
        let lines = vec![
            line("bus_0", 900_000, 100.0, 10.0, None),
            line("feeder_a", 900_000, 9_000.0, 10.0, Some(5.0)),
            line("bus_0", 900_000, 100.0, 10.0, None),
            line("bus_0", 1_800_000, 100.0, 10.0, None),
        ];
        let summary = RunSummary::from_lines(&lines, "bus_0", Duration::minutes(15));
        assert_eq!(summary.records, 3);
        assert_eq!(summary.timeslots, 2);
        assert_eq!(summary.contract_records, 0);
        assert_eq!(summary.mae_deviation_watts, 0.0);
        assert_eq!(summary.peak_demand_watts, 100.0);
    }

    #[test]
    fn empty_log() {
        let summary = RunSummary::from_lines(&[], "bus_0", Duration::minutes(15));
        assert_eq!(summary.records, 0);
        assert!(summary.to_string().contains("bus_0"));
    }
}
