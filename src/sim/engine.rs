//! Simulated-time run of a tree: advances the clock tick by tick, runs due
//! timers, and delivers queued calls.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::kpi::RunSummary;
use super::tree::{NodeSnapshot, Tree};
use crate::clock::Clock;
use crate::config::{ConfigError, TreeConfig};
use crate::logline::LogLine;
use crate::node::{ControlMode, NodeId, ReportSource};
use crate::profile::Timeline;
use crate::schedule::Scheduler;
use crate::transport::{Call, Transport};

/// Upper bound on calls delivered after a single timer task.
///
/// Reports and requests can bounce between levels of the tree within one
/// instant; anything beyond this waits for the next task or tick.
pub const PUMP_LIMIT: usize = 5_000;

/// Sender id of the contract request.
pub const OPERATOR: &str = "operator";

/// Outcome of a complete run.
#[derive(Debug, Clone)]
pub struct SimResult {
    pub lines: Vec<LogLine>,
    pub nodes: Vec<NodeSnapshot>,
    pub summary: RunSummary,
}

/// Drives a [`Tree`] through simulated time.
#[derive(Debug)]
pub struct Engine {
    tree: Tree,
    tick: Duration,
    end: DateTime<Utc>,
    request_at: DateTime<Utc>,
    request_watts: f64,
    requested: bool,
    deferred: usize,
}

impl Engine {
    /// Builds the tree of `config` and arms its timers.
    ///
    /// # Errors
    ///
    /// Returns the first validation error of `config`.
    pub fn new(config: &TreeConfig) -> Result<Self, ConfigError> {
        let tree = Tree::build(config)?;
        tree.start();
        let sim = &config.simulation;
        Ok(Self {
            tick: Duration::seconds(i64::from(sim.tick_seconds)),
            end: sim.start + Duration::hours(i64::from(sim.hours)),
            request_at: sim.start + Duration::minutes(i64::from(sim.request_at_minutes)),
            request_watts: sim.request_watts,
            requested: false,
            deferred: 0,
            tree,
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.tree.scheduler().now()
    }

    pub fn is_finished(&self) -> bool {
        self.now() >= self.end
    }

    /// Number of times delivery stopped at [`PUMP_LIMIT`].
    pub fn deferred(&self) -> usize {
        self.deferred
    }

    /// Advances one tick: runs every due timer, delivering queued calls
    /// after each, and sends the contract request once its time has come.
    pub fn step(&mut self) {
        let until = (self.now() + self.tick).min(self.end);
        let scheduler = self.tree.scheduler().clone();
        while let Some(task) = scheduler.pop_due(until) {
            task();
            self.drain();
        }
        if until > self.tree.clock().now() {
            self.tree.clock().set(until);
        }
        if !self.requested && self.now() >= self.request_at {
            self.send_request();
            self.requested = true;
        }
        self.drain();
    }

    /// Steps until the configured end.
    pub fn run(&mut self) {
        while !self.is_finished() {
            self.step();
        }
    }

    /// Asks the root to move its demand by `request_watts` over the
    /// current and next window.
    pub fn send_request(&self) {
        let Some(root) = self.tree.root() else {
            return;
        };
        let control = root.control();
        control.update_time();
        let (start, slot) = control.current_window();
        let end = slot + control.slot_len();

        let demand = root.generate_report().all().demand.clone();
        let mut step = Timeline::new(start);
        step.set_value_at(start, self.request_watts);
        let timeline = demand.add(&step).zero_before(start).zero_from(end).compact();
        info!(
            root = %root.id(),
            watts = self.request_watts,
            from = %start,
            until = %end,
            "sending contract request"
        );
        let result = self.tree.transport().call(
            &NodeId::from(OPERATOR),
            root.id(),
            Call::Request {
                timeline,
                wants_reply: true,
            },
        );
        if let Err(err) = result {
            warn!(root = %root.id(), error = %err, "contract request failed");
        }
        if control.mode() != ControlMode::Contract {
            warn!(root = %root.id(), mode = %control.mode(), "root did not accept the request");
        }
    }

    fn drain(&mut self) {
        let transport = self.tree.transport();
        transport.pump(PUMP_LIMIT);
        let pending = transport.pending();
        if pending > 0 {
            self.deferred += 1;
            warn!(pending, limit = PUMP_LIMIT, "delivery limit reached, deferring calls");
        }
    }

    /// Finishes the run and collects its results.
    pub fn finish(mut self) -> SimResult {
        self.run();
        let lines = self.tree.log().lines();
        let root = self.tree.root_id().to_string();
        let slot_len = self
            .tree
            .root()
            .map_or(Duration::minutes(15), |r| r.control().slot_len());
        let summary = RunSummary::from_lines(&lines, &root, slot_len);
        SimResult {
            nodes: self.tree.snapshot(),
            lines,
            summary,
        }
    }
}

/// Builds, runs and collects a simulation of `config`.
///
/// # Errors
///
/// Returns the first validation error of `config`.
pub fn run(config: &TreeConfig) -> Result<SimResult, ConfigError> {
    Ok(Engine::new(config)?.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(mut config: TreeConfig) -> TreeConfig {
        config.simulation.hours = 1;
        config
    }

    #[test]
    fn engine_advances_to_end() {
        let mut engine = Engine::new(&short(TreeConfig::single_bus())).expect("valid preset");
        let start = engine.now();
        engine.step();
        assert_eq!(engine.now(), start + Duration::seconds(60));
        engine.run();
        assert!(engine.is_finished());
        assert_eq!(engine.now(), start + Duration::hours(1));
    }

    #[test]
    fn request_puts_root_under_contract() {
        let mut engine = Engine::new(&short(TreeConfig::single_bus())).expect("valid preset");
        engine.run();
        let root = engine.tree().root().expect("root present");
        assert_eq!(root.control().mode(), ControlMode::Contract);
        assert!(root.control().committed().is_some());
    }

    #[test]
    fn leaves_report_to_root() {
        let mut engine = Engine::new(&short(TreeConfig::single_bus())).expect("valid preset");
        engine.run();
        let root = engine.tree().root().expect("root present");
        let children: Vec<_> = root.child_ids().iter().map(ToString::to_string).collect();
        assert_eq!(children, ["hvac_1", "light_1", "other_1"]);
    }

    #[test]
    fn same_seed_same_log() {
        let config = short(TreeConfig::single_bus());
        let a = run(&config).expect("valid preset");
        let b = run(&config).expect("valid preset");
        assert_eq!(a.lines, b.lines);
        assert!(!a.lines.is_empty());
    }
}
