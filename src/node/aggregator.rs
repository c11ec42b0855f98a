//! Aggregation point: sums child reports and steers children toward the
//! committed target.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{ControlMode, ControlNode, Node, NodeId, ReportSource, SteerGate};
use crate::logline::{LogLine, LogSink};
use crate::profile::{CategoryProfile, PowerProfile, Timeline};
use crate::sync::{lock, read, write};
use crate::transport::{Call, Endpoint, TransportError};

/// Cached report of one child.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub report: PowerProfile,
    /// Logical time of the last access; smaller means longer ago.
    pub touched: u64,
}

/// A node whose report is the sum of its children's reports.
pub struct AggregatingNode {
    control: ControlNode,
    children: RwLock<BTreeMap<NodeId, ChildEntry>>,
    touches: AtomicU64,
    gate: SteerGate,
    /// Held while committing a request and for a whole steering pass, so a
    /// pass never sees two different committed targets.
    steering: Mutex<()>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for AggregatingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatingNode")
            .field("control", &self.control)
            .field("children", &read(&self.children).len())
            .finish_non_exhaustive()
    }
}

impl AggregatingNode {
    pub fn new(control: ControlNode) -> Self {
        Self {
            control,
            children: RwLock::new(BTreeMap::new()),
            touches: AtomicU64::new(0),
            gate: SteerGate::new(),
            steering: Mutex::new(()),
            log_sink: None,
        }
    }

    /// Sends a [`LogLine`] to `sink` after every report, request and pass.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn control(&self) -> &ControlNode {
        &self.control
    }

    pub fn id(&self) -> &NodeId {
        self.control.id()
    }

    /// Ids of every child that has reported, sorted.
    pub fn child_ids(&self) -> Vec<NodeId> {
        read(&self.children).keys().cloned().collect()
    }

    /// Cached report of `child` without refreshing its access marker.
    pub fn child_entry(&self, child: &NodeId) -> Option<ChildEntry> {
        read(&self.children).get(child).cloned()
    }

    fn next_touch(&self) -> u64 {
        self.touches.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Caches `profile` as `from`'s report, then steers and logs.
    pub fn report(&self, from: &NodeId, profile: PowerProfile) {
        debug!(node = %self.id(), from = %from, "report received");
        let touched = self.next_touch();
        write(&self.children).insert(
            from.clone(),
            ChildEntry {
                report: profile,
                touched,
            },
        );
        self.steer();
        self.send_log();
    }

    /// Commits to `timeline`, steers, logs, and optionally replies.
    pub fn request(&self, timeline: &Timeline, wants_reply: bool) {
        let committed = {
            let _steering = lock(&self.steering);
            self.control.commit_request(self, timeline)
        };
        if !committed {
            self.send_report();
            self.send_log();
            return;
        }
        self.steer();
        self.send_log();
        if wants_reply {
            self.send_report();
        }
    }

    /// Forgets every child report.
    pub fn reset(&self) {
        write(&self.children).clear();
        info!(node = %self.id(), "child reports cleared");
    }

    pub fn set_mode(&self, mode: ControlMode) {
        self.control.set_mode(mode);
        self.send_log();
    }

    /// Sets the mode here and on every known child.
    pub fn set_all_modes(&self, mode: ControlMode) {
        self.set_mode(mode);
        let transport = self.control.transport();
        for child in self.child_ids() {
            if let Err(err) = transport.call(self.id(), &child, Call::SetMode(mode)) {
                warn!(node = %self.id(), to = %child, error = %err, "could not forward mode");
            }
        }
    }

    /// The `All` category of the current aggregate.
    pub fn current_profile(&self) -> CategoryProfile {
        self.generate_report().all().into_owned()
    }

    pub fn send_report(&self) {
        self.control.send_report(self);
    }

    /// Runs a steering pass, or reports upward when the mode has no
    /// steering authority.
    ///
    /// Safe to call redundantly: a trigger that arrives while a pass is in
    /// flight is folded into a single re-run of that pass.
    pub fn steer(&self) {
        if !self.control.mode().steers() {
            if !self.id().is_bus() {
                self.send_report();
            }
            return;
        }
        self.gate.run(|| self.steer_pass());
    }

    fn steer_pass(&self) {
        let _steering = lock(&self.steering);
        let now = self.control.now();
        if now > self.control.timeslot() {
            self.control.update_time();
        }
        let config = self.control.config();
        let limit = config.steer_limit_watts;
        let gain = config.allocation_gain;
        let (start, slot) = self.control.current_window();
        let end = slot + self.control.slot_len();

        let aggregate = self.generate_report();
        let mut current_diff = nan_to_zero(self.control.get_diff(start, slot, now, &aggregate));
        let mut next_diff = nan_to_zero(self.control.get_diff(slot, end, slot, &aggregate));

        if current_diff.abs() < limit && next_diff.abs() < limit {
            debug!(
                node = %self.id(),
                current_diff,
                next_diff,
                limit,
                "deviation below steer limit"
            );
            self.send_log();
            return;
        }

        let current_pct = allocation(
            current_diff,
            self.control.get_flex_up(now, &aggregate),
            self.control.get_flex_down(now, &aggregate),
            gain,
        );
        let next_pct = allocation(
            next_diff,
            self.control.get_flex_up(slot, &aggregate),
            self.control.get_flex_down(slot, &aggregate),
            gain,
        );
        info!(
            node = %self.id(),
            current_diff,
            current_pct,
            next_diff,
            next_pct,
            "steering children"
        );

        let mut order: Vec<(u64, NodeId)> = read(&self.children)
            .iter()
            .map(|(id, entry)| (entry.touched, id.clone()))
            .collect();
        order.sort();

        let epoch = self
            .control
            .committed()
            .map_or(slot, |target| target.timestamp());

        for (_, child) in order {
            if current_diff.abs() < 0.01 * limit && next_diff.abs() < 0.01 * limit {
                debug!(node = %self.id(), current_diff, next_diff, "done steering");
                break;
            }
            let Some(mut report) = self.touch(&child) else {
                continue;
            };
            report.calc_all();

            let mut diff_line = Timeline::new(epoch);
            let mut influence = 0.0;

            let raise = current_diff > 0.0;
            let val = self.share(&mut current_diff, now, &report, current_pct);
            diff_line.set_value_at(now, val);
            influence += if raise { val } else { -val };
            diff_line = diff_line.zero_from(slot);

            let raise = next_diff > 0.0;
            let val = self.share(&mut next_diff, slot, &report, next_pct);
            diff_line.set_value_at(slot, val);
            influence += if raise { val } else { -val };
            diff_line = diff_line.zero_from(end);

            if influence <= 0.0 {
                debug!(node = %self.id(), to = %child, "not sending zero influence request");
                continue;
            }

            let request = Timeline::new(epoch)
                .add(&report.all().demand)
                .add(&diff_line);
            let proposal = self.control.create_proposal(&report, &request);
            if let Some(entry) = write(&self.children).get_mut(&child) {
                let cached = std::mem::replace(&mut entry.report, PowerProfile::new(slot));
                entry.report = cached.merge(&proposal, start, end).drop_history(start);
            }

            debug!(node = %self.id(), to = %child, "sending request to child");
            let id = self.id().clone();
            let to = child.clone();
            self.control.transport().call_async(
                self.id(),
                &child,
                Call::Request {
                    timeline: request,
                    wants_reply: false,
                },
                Box::new(move |result| match result {
                    Ok(()) => debug!(node = %id, to = %to, "request delivered"),
                    Err(err) => warn!(node = %id, to = %to, error = %err, "could not send request to child"),
                }),
            );
        }

        if current_diff.abs() > limit || next_diff.abs() > limit {
            warn!(
                node = %self.id(),
                current_diff,
                next_diff,
                "reached steering limits, resetting goal and reporting"
            );
            self.control.update_current_report(self, false);
            self.send_report();
        }
        self.send_log();
    }

    /// Refreshes `child`'s access marker and returns its report.
    fn touch(&self, child: &NodeId) -> Option<PowerProfile> {
        let touched = self.next_touch();
        let mut children = write(&self.children);
        let entry = children.get_mut(child)?;
        entry.touched = touched;
        Some(entry.report.clone())
    }

    /// The part of `diff` one child takes on at `at`, bounded by its
    /// headroom scaled by `pct`. Subtracts it from `diff`.
    fn share(&self, diff: &mut f64, at: DateTime<Utc>, report: &PowerProfile, pct: f64) -> f64 {
        let val = if *diff > 0.0 {
            diff.min(self.control.get_flex_up(at, report) * pct)
        } else {
            diff.max(self.control.get_flex_down(at, report) * pct)
        };
        *diff -= val;
        val
    }

    /// Builds the log record for `aggregate` at the current time.
    pub fn log_line(&self, aggregate: &PowerProfile) -> LogLine {
        let now = self.control.now();
        let current = aggregate.all().into_owned();
        let contract = self.control.mode() == ControlMode::Contract;
        let expected = match self.control.committed() {
            Some(target) if contract => target.all().into_owned(),
            _ => current.clone(),
        };
        LogLine::from_profiles(
            self.id().as_str(),
            &current,
            &expected,
            now,
            self.control.timeslot(),
            self.control.slot_len(),
            contract,
        )
    }

    /// Emits a [`LogLine`] to the configured sink.
    pub fn send_log(&self) {
        let Some(sink) = &self.log_sink else {
            return;
        };
        if self.control.now() > self.control.timeslot() {
            self.control.update_time();
        }
        sink.log(self.log_line(&self.generate_report()));
    }

    /// Multi-line status: both windows with actual, goal and deviation.
    pub fn describe(&self) -> String {
        let aggregate = self.generate_report();
        let now = self.control.now();
        let state = self.control.state();
        let (start, slot) = self.control.current_window();
        let end = slot + self.control.slot_len();
        let secs = self.control.slot_len().num_seconds().max(1) as f64;
        let demand = aggregate.all().demand.clone();

        let mut out = String::new();
        let _ = writeln!(out, "{} {}|{} {}", self.id(), now, state.current_timeslot, state.mode);
        let _ = writeln!(
            out,
            "T0 c:{} a:{} g:{} d:({})",
            demand.value_at(now),
            demand.integral(start, slot) / secs,
            self.control.get_goal(now),
            self.control.get_diff(start, slot, now, &aggregate)
        );
        let _ = writeln!(
            out,
            "T1 c:{} a:{} g:{} d:({})",
            demand.value_at(slot),
            demand.integral(slot, end) / secs,
            self.control.get_goal(slot),
            self.control.get_diff(slot, end, slot, &aggregate)
        );
        let line = self.log_line(&aggregate);
        let _ = writeln!(
            out,
            "log demand:{} expected:{} max:{} min:{} request:{:?}",
            line.demand, line.expected, line.max, line.min, line.request
        );
        let _ = write!(out, "(nof reports:{})", read(&self.children).len());
        out
    }
}

/// Share of a child's headroom to claim for `diff`.
///
/// Clamped to `[0.01, 1]`; a zero diff yields the floor.
fn allocation(diff: f64, flex_up: f64, flex_down: f64, gain: f64) -> f64 {
    let pct = if diff > 0.0 {
        diff / flex_up * gain
    } else if diff == 0.0 {
        0.0
    } else {
        diff / flex_down * gain
    };
    if pct.is_nan() { 1.0 } else { pct.clamp(0.01, 1.0) }
}

fn nan_to_zero(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v }
}

impl ReportSource for AggregatingNode {
    fn generate_report(&self) -> PowerProfile {
        let children = read(&self.children);
        children
            .values()
            .fold(PowerProfile::new(self.control.timeslot()), |sum, entry| {
                sum.add(&entry.report)
            })
            .with_all()
    }
}

impl Endpoint for AggregatingNode {
    fn handle(&self, from: &NodeId, call: Call) -> Result<(), TransportError> {
        match call {
            Call::Report(profile) => self.report(from, profile),
            Call::Request {
                timeline,
                wants_reply,
            } => self.request(&timeline, wants_reply),
            Call::SetMode(mode) => self.set_mode(mode),
            Call::Reset => self.reset(),
        }
        Ok(())
    }
}

impl Node for AggregatingNode {
    fn control(&self) -> &ControlNode {
        &self.control
    }

    fn send_report(&self) {
        AggregatingNode::send_report(self);
    }

    fn steer(&self) {
        AggregatingNode::steer(self);
    }

    fn is_aggregator(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        AggregatingNode::describe(self)
    }
}
