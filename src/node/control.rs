//! State and behaviour shared by every node: timeslot tracking, control
//! mode, and the committed target profile.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ControlMode, NodeId};
use crate::clock::{Clock, next_slot_boundary};
use crate::config::NodeConfig;
use crate::profile::{Category, CategoryProfile, PowerProfile, Timeline};
use crate::sync::lock;
use crate::transport::{Call, Transport};

/// Produces a node's current, unconstrained report.
///
/// Leaves compute it from their device model, aggregators from the cached
/// reports of their children.
pub trait ReportSource {
    fn generate_report(&self) -> PowerProfile;
}

/// Mutable scalar state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlState {
    /// End of the current window; the first slot boundary after now.
    pub current_timeslot: DateTime<Utc>,
    pub mode: ControlMode,
}

/// The part of a node that tracks and reports a committed target.
///
/// The committed target is guarded by its own lock, which is never held
/// across a call to [`ReportSource::generate_report`] or an outbound call.
pub struct ControlNode {
    id: NodeId,
    parent: Option<NodeId>,
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    state: Mutex<ControlState>,
    committed: Mutex<Option<PowerProfile>>,
}

impl std::fmt::Debug for ControlNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlNode")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ControlNode {
    /// Creates a node in [`ControlMode::Nominal`] without a committed target.
    pub fn new(
        id: NodeId,
        parent: Option<NodeId>,
        config: NodeConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let current_timeslot = next_slot_boundary(clock.now(), config.timeslot());
        Self {
            id,
            parent,
            config,
            clock,
            transport,
            state: Mutex::new(ControlState {
                current_timeslot,
                mode: ControlMode::default(),
            }),
            committed: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self) -> ControlState {
        *lock(&self.state)
    }

    pub fn mode(&self) -> ControlMode {
        lock(&self.state).mode
    }

    /// End of the current window.
    pub fn timeslot(&self) -> DateTime<Utc> {
        lock(&self.state).current_timeslot
    }

    pub fn slot_len(&self) -> Duration {
        self.config.timeslot()
    }

    /// The slot containing now, `[timeslot - len, timeslot)`.
    pub fn current_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let slot = self.timeslot();
        (slot - self.slot_len(), slot)
    }

    /// The slot after the current one, `[timeslot, timeslot + len)`.
    pub fn next_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let slot = self.timeslot();
        (slot, slot + self.slot_len())
    }

    pub fn set_mode(&self, mode: ControlMode) {
        let previous = std::mem::replace(&mut lock(&self.state).mode, mode);
        if previous != mode {
            info!(node = %self.id, from = %previous, to = %mode, "mode changed");
        }
    }

    /// Moves the current timeslot to the first boundary after now.
    pub fn update_time(&self) {
        let slot = next_slot_boundary(self.clock.now(), self.slot_len());
        let mut state = lock(&self.state);
        if state.current_timeslot != slot {
            state.current_timeslot = slot;
            debug!(node = %self.id, timeslot = %slot, "timeslot updated");
        }
    }

    /// Snapshot of the committed target.
    pub fn committed(&self) -> Option<PowerProfile> {
        lock(&self.committed).clone()
    }

    /// Committed aggregate demand at `t`, or `0.0` without a contract.
    pub fn get_goal(&self, t: DateTime<Utc>) -> f64 {
        lock(&self.committed)
            .as_ref()
            .map_or(0.0, |target| target.all().demand.value_at(t))
    }

    /// Average power still owed over `[now, end)` to make the aggregate's
    /// energy over `[start, end)` match the committed target.
    ///
    /// Returns `0.0` when nothing has been committed.
    pub fn get_diff(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
        aggregate: &PowerProfile,
    ) -> f64 {
        let goal = match lock(&self.committed).as_ref() {
            Some(target) => target.all().demand.integral(start, end),
            None => return 0.0,
        };
        let actual = aggregate.all().demand.integral(start, end);
        let seconds = (end - now).num_seconds().max(1);
        (goal - actual) / seconds as f64
    }

    /// Headroom above the aggregate's demand at `now`.
    pub fn get_flex_up(&self, now: DateTime<Utc>, aggregate: &PowerProfile) -> f64 {
        if lock(&self.committed).is_none() {
            return 0.0;
        }
        let all = aggregate.all();
        all.max_flex.value_at(now) - all.demand.value_at(now)
    }

    /// Headroom below the aggregate's demand at `now`; zero or negative.
    pub fn get_flex_down(&self, now: DateTime<Utc>, aggregate: &PowerProfile) -> f64 {
        if lock(&self.committed).is_none() {
            return 0.0;
        }
        let all = aggregate.all();
        all.min_flex.value_at(now) - all.demand.value_at(now)
    }

    /// Turns a requested demand timeline into a profile bounded to the
    /// current and next window.
    ///
    /// When the request says nothing about the start of the current window
    /// (value `0`), the current window is filled from `report`'s own demand.
    /// The envelope is `report`'s envelope widened to contain the requested
    /// demand.
    pub fn create_proposal(&self, report: &PowerProfile, request: &Timeline) -> PowerProfile {
        let (start, slot) = self.current_window();
        let end = slot + self.slot_len();
        let all = report.all();

        let mut bounded = request.clone().zero_before(start).zero_from(end);
        if bounded.value_at(start) == 0.0 {
            bounded = bounded.merge(&all.demand, start, slot);
        }
        let demand = bounded.compact();
        let max_flex = all
            .max_flex
            .max(&demand)
            .zero_before(start)
            .zero_from(end)
            .compact();
        let min_flex = all
            .min_flex
            .min(&demand)
            .zero_before(start)
            .zero_from(end)
            .compact();

        let mut proposal = PowerProfile::new(request.epoch());
        proposal.set_category(
            Category::Simulated,
            CategoryProfile {
                demand,
                max_flex,
                min_flex,
            },
        );
        proposal.with_all()
    }

    /// Commits to `request` over the current and next window.
    ///
    /// Returns `false` without touching the target when the node abstains.
    /// Seeds the target from `source` if nothing was committed yet and
    /// switches to [`ControlMode::Contract`].
    pub fn commit_request(&self, source: &dyn ReportSource, request: &Timeline) -> bool {
        info!(node = %self.id, "request received");
        if self.mode() == ControlMode::Abstain {
            info!(node = %self.id, "ignoring request, free running");
            return false;
        }
        let (start, slot) = self.current_window();
        let end = slot + self.slot_len();
        let uncommitted = lock(&self.committed).is_none();
        let seed = uncommitted.then(|| source.generate_report());
        {
            let mut committed = lock(&self.committed);
            let current = committed
                .take()
                .or(seed)
                .unwrap_or_else(|| PowerProfile::new(slot).with_all());
            let proposal = self.create_proposal(&current, request);
            *committed = Some(current.merge(&proposal, start, end).drop_history(start));
        }
        self.set_mode(ControlMode::Contract);
        true
    }

    /// Handles a request from the parent; abstaining nodes answer with a
    /// report instead.
    pub fn request(&self, source: &dyn ReportSource, request: &Timeline, wants_reply: bool) {
        if !self.commit_request(source, request) {
            self.send_report(source);
            return;
        }
        if wants_reply {
            self.send_report(source);
        }
    }

    /// Refreshes the committed target from a fresh aggregate.
    ///
    /// Without a target the aggregate becomes the target. Otherwise the
    /// envelope always comes from the aggregate, and demand comes from the
    /// existing target when `contract` is set.
    pub fn update_current_report(&self, source: &dyn ReportSource, contract: bool) {
        let aggregate = source.generate_report();
        let slot = self.timeslot();
        let mut committed = lock(&self.committed);
        let updated = match committed.take() {
            None => aggregate,
            Some(current) => {
                let mut fresh = PowerProfile::new(slot);
                for cat in Category::CONCRETE {
                    let actual = aggregate.category(cat);
                    let promised = current.category(cat);
                    if actual.is_none() && promised.is_none() {
                        continue;
                    }
                    let actual = actual
                        .cloned()
                        .unwrap_or_else(|| CategoryProfile::empty(aggregate.timestamp()));
                    let demand = if contract {
                        promised.map_or_else(|| Timeline::new(slot), |p| p.demand.clone())
                    } else {
                        actual.demand
                    };
                    fresh.set_category(
                        cat,
                        CategoryProfile {
                            demand: demand.with_epoch(slot),
                            max_flex: actual.max_flex.with_epoch(slot),
                            min_flex: actual.min_flex.with_epoch(slot),
                        },
                    );
                }
                fresh.with_all()
            }
        };
        *committed = Some(updated);
    }

    /// Reports the committed target to the parent.
    ///
    /// Delivery is asynchronous; the outcome is only logged and a failed
    /// report is superseded by the next scheduled one.
    pub fn send_report(&self, source: &dyn ReportSource) {
        if self.config.skip_reports {
            info!(node = %self.id, "skipping report");
            return;
        }
        self.update_current_report(source, self.mode() == ControlMode::Contract);
        let Some(parent) = self.parent.clone() else {
            debug!(node = %self.id, "no parent to report to");
            return;
        };
        let Some(profile) = self.committed() else {
            return;
        };
        let id = self.id.clone();
        let to = parent.clone();
        self.transport.call_async(
            &self.id,
            &parent,
            Call::Report(profile),
            Box::new(move |result| match result {
                Ok(()) => info!(node = %id, to = %to, "reported flexibility"),
                Err(err) => warn!(node = %id, to = %to, error = %err, "failed to report flexibility"),
            }),
        );
    }

    /// Replaces the committed target outright.
    pub(crate) fn set_committed(&self, target: Option<PowerProfile>) {
        *lock(&self.committed) = target;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::LocalTransport;

    struct Fixed(PowerProfile);

    impl ReportSource for Fixed {
        fn generate_report(&self) -> PowerProfile {
            self.0.clone()
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 1, 10, 5, 0).single().expect("valid")
    }

    fn node(clock: Arc<ManualClock>) -> ControlNode {
        ControlNode::new(
            NodeId::from("n"),
            None,
            NodeConfig::default(),
            clock,
            Arc::new(LocalTransport::queued()),
        )
    }

    /// Flat profile: demand 1000 W, envelope [500, 1500] W from 09:00.
    fn flat(slot: DateTime<Utc>) -> PowerProfile {
        let from = Utc.with_ymd_and_hms(2016, 1, 1, 9, 0, 0).single().expect("valid");
        let offset = (from - slot).num_milliseconds();
        let mut profile = PowerProfile::new(slot);
        let hvac = profile.category_mut(Category::Hvac);
        hvac.demand = Timeline::from_breakpoints(slot, [(offset, 1000.0)]);
        hvac.max_flex = Timeline::from_breakpoints(slot, [(offset, 1500.0)]);
        hvac.min_flex = Timeline::from_breakpoints(slot, [(offset, 500.0)]);
        profile.with_all()
    }

    #[test]
    fn timeslot_is_next_boundary() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock.clone());
        let slot = Utc.with_ymd_and_hms(2016, 1, 1, 10, 15, 0).single().expect("valid");
        assert_eq!(n.timeslot(), slot);
        assert_eq!(n.current_window(), (slot - Duration::minutes(15), slot));
        clock.advance(Duration::minutes(12));
        n.update_time();
        assert_eq!(n.timeslot(), slot + Duration::minutes(15));
    }

    #[test]
    fn no_contract_means_no_deviation() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        let agg = flat(n.timeslot());
        let (s, e) = n.current_window();
        assert_eq!(n.get_diff(s, e, start(), &agg), 0.0);
        assert_eq!(n.get_flex_up(start(), &agg), 0.0);
        assert_eq!(n.get_flex_down(start(), &agg), 0.0);
        assert_eq!(n.get_goal(start()), 0.0);
    }

    #[test]
    fn flex_is_envelope_minus_demand() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        let agg = flat(n.timeslot());
        n.set_committed(Some(agg.clone()));
        assert_eq!(n.get_flex_up(start(), &agg), 500.0);
        assert_eq!(n.get_flex_down(start(), &agg), -500.0);
    }

    #[test]
    fn diff_spreads_missing_energy_over_remaining_seconds() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        let slot = n.timeslot();
        let mut target = flat(slot);
        target.category_mut(Category::Hvac).demand = Timeline::from_breakpoints(slot, [(-3_600_000, 1200.0)]);
        n.set_committed(Some(target.with_all()));

        let (s, e) = n.current_window();
        // 200 W short over 900 s, 600 s left
        let diff = n.get_diff(s, e, start(), &flat(slot));
        assert!((diff - 200.0 * 900.0 / 600.0).abs() < 1e-9);
        // past the end the divisor is one second
        let late = n.get_diff(s, e, e + Duration::seconds(5), &flat(slot));
        assert!((late - 200.0 * 900.0).abs() < 1e-9);
    }

    #[test]
    fn proposal_is_bounded_and_backfilled() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        let slot = n.timeslot();
        let (s, _) = n.current_window();
        let end = slot + Duration::minutes(15);
        let report = flat(slot);
        // asks for 1800 W in the next slot only
        let request = Timeline::from_breakpoints(slot, [(0, 1800.0), (3_600_000, 100.0)]);
        let proposal = n.create_proposal(&report, &request);

        let sim = proposal.category(Category::Simulated).expect("simulated category");
        assert_eq!(sim.demand.value_at(s - Duration::seconds(1)), 0.0);
        assert_eq!(sim.demand.value_at(s), 1000.0);
        assert_eq!(sim.demand.value_at(slot), 1800.0);
        assert_eq!(sim.demand.value_at(end), 0.0);
        assert_eq!(sim.max_flex.value_at(slot), 1800.0);
        assert_eq!(sim.max_flex.value_at(s), 1500.0);
        assert_eq!(sim.min_flex.value_at(slot), 500.0);
        assert_eq!(proposal.all().demand.value_at(slot), 1800.0);
    }

    #[test]
    fn request_commits_and_switches_to_contract() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        let slot = n.timeslot();
        let source = Fixed(flat(slot));
        let (s, _) = n.current_window();
        let request = Timeline::from_breakpoints(slot, [(-900_000, 900.0), (0, 800.0)]);
        n.request(&source, &request, false);

        assert_eq!(n.mode(), ControlMode::Contract);
        let target = n.committed().expect("committed");
        assert_eq!(target.all().demand.value_at(s), 900.0);
        assert_eq!(target.all().demand.value_at(slot), 800.0);
        assert_eq!(target.all().demand.value_at(s - Duration::minutes(1)), 0.0);
        assert_eq!(n.get_goal(slot), 800.0);
    }

    #[test]
    fn abstaining_node_ignores_request() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        n.set_mode(ControlMode::Abstain);
        let source = Fixed(flat(n.timeslot()));
        let request = Timeline::from_breakpoints(n.timeslot(), [(0, 1.0)]);
        assert!(!n.commit_request(&source, &request));
        assert_eq!(n.mode(), ControlMode::Abstain);
        assert!(n.committed().is_none());
    }

    #[test]
    fn update_keeps_committed_demand_under_contract() {
        let clock = Arc::new(ManualClock::new(start()));
        let n = node(clock);
        let slot = n.timeslot();
        let source = Fixed(flat(slot));
        let request = Timeline::from_breakpoints(slot, [(-900_000, 700.0)]);
        n.request(&source, &request, false);

        n.update_current_report(&source, true);
        let kept = n.committed().expect("committed");
        assert_eq!(kept.all().demand.value_at(slot), 700.0);
        assert_eq!(kept.all().max_flex.value_at(slot), 1500.0);
        assert_eq!(kept.timestamp(), slot);

        n.update_current_report(&source, false);
        let reset = n.committed().expect("committed");
        assert_eq!(reset.all().demand.value_at(slot), 1000.0);
    }
}
