//! Simulated DER leaf.
//!
//! Consumption follows a daily usage spread, or the committed goal while
//! under contract, perturbed by a random offset and by simulated users.
//! The flexibility band widens or narrows with how far base consumption is
//! from the middle of the configured band.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::{ControlMode, ControlNode, Node, NodeId, ReportSource};
use crate::config::LeafConfig;
use crate::profile::{CategoryProfile, PowerProfile};
use crate::sync::lock;
use crate::transport::{Call, Endpoint, TransportError};

/// Device model behind a [`LeafNode`].
#[derive(Debug)]
pub struct DerSimulator {
    config: LeafConfig,
    rng: StdRng,
    trick_offset: f64,
    current_random_offset: f64,
}

impl DerSimulator {
    pub fn new(config: LeafConfig, seed: u64) -> Self {
        let trick_offset = config.trick_offset;
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            trick_offset,
            current_random_offset: 0.0,
        }
    }

    pub fn config(&self) -> &LeafConfig {
        &self.config
    }

    pub fn trick_offset(&self) -> f64 {
        self.trick_offset
    }

    pub fn set_trick_offset(&mut self, offset: f64) {
        self.trick_offset = offset;
    }

    pub fn current_random_offset(&self) -> f64 {
        self.current_random_offset
    }

    /// Draws a new random deviation in `[-random_offset / 2, random_offset / 2)`.
    pub fn refresh_random_offset(&mut self) {
        self.current_random_offset = (0.5 - self.rng.random::<f64>()) * self.config.random_offset;
    }

    /// Whole seconds in `[1, max_secs]`, drawn from the model's generator.
    pub fn random_delay(&mut self, max_secs: i64) -> Duration {
        Duration::seconds(self.rng.random_range(1..=max_secs.max(1)))
    }

    /// With probability 0.2, a user pushes consumption towards a random
    /// target inside the band, biased to the top. Returns whether it did.
    pub fn user_event(&mut self, goal_consumption: f64) -> bool {
        if !self.rng.random_bool(0.2) {
            return false;
        }
        let max = self.config.max_consumption;
        let available = max - max * self.config.min_flex / 100.0;
        let target = max - self.rng.random::<f64>().powi(2) * available;
        let previous = std::mem::replace(&mut self.trick_offset, target - goal_consumption);
        info!(from = previous, to = self.trick_offset, "user changed consumption");
        true
    }

    /// Usage percentage of the first step starting after `t`'s time of
    /// day, or of the last step.
    fn time_percentage(&self, t: DateTime<Utc>) -> f64 {
        let second = t.num_seconds_from_midnight();
        let mut pct = 0.0;
        for step in &self.config.timespread {
            pct = step.usage_percentage;
            if step.seconds_of_day > second {
                break;
            }
        }
        pct
    }

    /// Consumption without any steering or offsets.
    pub fn base_consumption(&self, t: DateTime<Utc>) -> f64 {
        self.config.max_consumption * self.time_percentage(t) / 100.0
    }

    /// Consumption at `t` given the goal to follow there.
    ///
    /// Offsets fade with distance from `slot` beyond one slot length.
    pub fn consumption(&self, t: DateTime<Utc>, slot: DateTime<Utc>, slot_len: Duration, goal: f64) -> f64 {
        let distance = (t - slot).num_milliseconds().abs();
        let len = slot_len.num_milliseconds();
        let factor = if distance > len {
            len as f64 / distance as f64
        } else {
            1.0
        };
        (goal + (self.trick_offset + self.current_random_offset) * factor)
            .min(self.config.max_consumption)
            .max(0.0)
    }

    fn mean_pct_gap(&self, base: f64) -> f64 {
        let mean = (self.config.max_flex + self.config.min_flex) / 2.0;
        100.0 * base / self.config.max_consumption - mean
    }

    fn up_percentage(&self, base: f64) -> f64 {
        band(self.mean_pct_gap(base))
    }

    fn down_percentage(&self, base: f64) -> f64 {
        band(-self.mean_pct_gap(base))
    }

    /// Upper bound at a point where the device consumes `consumption`.
    pub fn max_flexibility(&self, consumption: f64, base: f64) -> f64 {
        let cap = self.config.max_consumption * self.config.max_flex / 100.0;
        let stretch = (100.0 + self.up_percentage(base)) / 100.0 * base;
        consumption.max(cap.min(stretch))
    }

    /// Lower bound; local generation pushes it down.
    pub fn min_flexibility(&self, consumption: f64, base: f64) -> f64 {
        let generation = self.config.generation_offset;
        let floor = self.config.max_consumption * self.config.min_flex / 100.0 - generation;
        let shrink = (100.0 - self.down_percentage(base)) / 100.0 * base;
        consumption.min(floor.max(shrink) - generation)
    }

    /// Forecast one slot back up to the horizon, one sample per slot.
    ///
    /// `goal` yields the committed consumption at a point in time, if any.
    pub fn forecast(
        &self,
        slot: DateTime<Utc>,
        slot_len: Duration,
        goal: impl Fn(DateTime<Utc>) -> Option<f64>,
    ) -> CategoryProfile {
        let mut profile = CategoryProfile::empty(slot);
        let step = slot_len.num_milliseconds().max(1);
        let horizon = i64::from(self.config.forecast_horizon_hours) * 3_600_000;
        let mut offset = -step;
        while offset < horizon {
            let t = slot + Duration::milliseconds(offset);
            let base = self.base_consumption(t);
            let consumption = self.consumption(t, slot, slot_len, goal(t).unwrap_or(base));
            profile.demand.set_value_at(t, consumption);
            profile.max_flex.set_value_at(t, self.max_flexibility(consumption, base));
            profile.min_flex.set_value_at(t, self.min_flexibility(consumption, base));
            offset += step;
        }
        profile
    }
}

/// Flexibility percentage for a gap between current and mean usage.
fn band(gap: f64) -> f64 {
    if gap > 15.0 {
        1.0
    } else if gap > 10.0 {
        5.0
    } else if gap > 5.0 {
        10.0
    } else {
        15.0
    }
}

/// A node backed by a [`DerSimulator`].
pub struct LeafNode {
    control: ControlNode,
    model: Mutex<DerSimulator>,
}

impl std::fmt::Debug for LeafNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafNode")
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl LeafNode {
    pub fn new(control: ControlNode, model: DerSimulator) -> Self {
        Self {
            control,
            model: Mutex::new(model),
        }
    }

    pub fn control(&self) -> &ControlNode {
        &self.control
    }

    pub fn id(&self) -> &NodeId {
        self.control.id()
    }

    /// Whether simulated users are enabled.
    pub fn user_events(&self) -> bool {
        lock(&self.model).config().user_events
    }

    pub fn set_trick_offset(&self, offset: f64) {
        lock(&self.model).set_trick_offset(offset);
    }

    pub fn refresh_random_offset(&self) {
        lock(&self.model).refresh_random_offset();
    }

    /// Delay drawn from the model's generator, at most `max_secs`.
    pub fn random_delay(&self, max_secs: i64) -> Duration {
        lock(&self.model).random_delay(max_secs)
    }

    /// Goal-following consumption at `t` before offsets.
    fn goal_consumption(&self, t: DateTime<Utc>) -> f64 {
        let goal = self.goal_at(t);
        goal.unwrap_or_else(|| lock(&self.model).base_consumption(t))
    }

    fn goal_at(&self, t: DateTime<Utc>) -> Option<f64> {
        if self.control.mode() != ControlMode::Contract {
            return None;
        }
        let goal = self.control.get_goal(t);
        (goal > 0.0).then_some(goal)
    }

    /// Runs one simulated user event and reports if consumption changed.
    pub fn user_event(&self) {
        let now = self.control.now();
        let goal = self.goal_consumption(now);
        let changed = lock(&self.model).user_event(goal);
        if changed {
            self.send_report();
        }
    }

    /// Current consumption.
    pub fn consumption(&self) -> f64 {
        let now = self.control.now();
        let goal = self.goal_consumption(now);
        let model = lock(&self.model);
        model.consumption(now, self.control.timeslot(), self.control.slot_len(), goal)
    }

    pub fn send_report(&self) {
        self.control.send_report(self);
    }

    pub fn describe(&self) -> String {
        let now = self.control.now();
        let state = self.control.state();
        format!(
            "{} {}|{} {}\nc:{} g:{}",
            self.id(),
            now,
            state.current_timeslot,
            state.mode,
            self.consumption(),
            self.control.get_goal(now)
        )
    }
}

impl ReportSource for LeafNode {
    fn generate_report(&self) -> PowerProfile {
        let slot = self.control.timeslot();
        let slot_len = self.control.slot_len();
        let now = self.control.now();
        let contract = self.control.mode() == ControlMode::Contract;
        let committed = self.control.committed();

        let goal = |t: DateTime<Utc>| {
            let goal = committed.as_ref()?.all().demand.value_at(t);
            (contract && goal > 0.0).then_some(goal)
        };
        let (category, mut forecast) = {
            let model = lock(&self.model);
            (model.config().category, model.forecast(slot, slot_len, goal))
        };

        if let Some(target) = &committed {
            debug!(node = %self.id(), from = %(slot - slot_len), to = %now, "adding historical data");
            let history = target.all();
            forecast = forecast.zip_with(&history, |tl, h| tl.merge(h, slot - slot_len, now));
        }

        let demand = forecast.demand.compact();
        let (max_flex, min_flex) = if self.control.mode() == ControlMode::Abstain {
            (demand.clone(), demand.clone())
        } else {
            (forecast.max_flex.compact(), forecast.min_flex.compact())
        };
        let mut profile = PowerProfile::new(slot);
        profile.set_category(
            category,
            CategoryProfile {
                demand,
                max_flex,
                min_flex,
            },
        );
        profile.with_all()
    }
}

impl Endpoint for LeafNode {
    fn handle(&self, _from: &NodeId, call: Call) -> Result<(), TransportError> {
        match call {
            Call::Request {
                timeline,
                wants_reply,
            } => self.control.request(self, &timeline, wants_reply),
            Call::SetMode(mode) => self.control.set_mode(mode),
            Call::Reset => {}
            Call::Report(_) => {
                return Err(TransportError::Rejected {
                    to: self.id().clone(),
                    reason: "leaf nodes have no children".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Node for LeafNode {
    fn control(&self) -> &ControlNode {
        &self.control
    }

    fn send_report(&self) {
        LeafNode::send_report(self);
    }

    fn describe(&self) -> String {
        LeafNode::describe(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{NodeConfig, UsageStep};
    use crate::profile::{Category, Timeline};
    use crate::transport::LocalTransport;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 1, h, m, 0).single().expect("valid")
    }

    fn flat_config() -> LeafConfig {
        LeafConfig {
            id: "der".to_string(),
            parent: "bus_0".to_string(),
            category: Category::Hvac,
            max_consumption: 1000.0,
            max_flex: 80.0,
            min_flex: 20.0,
            forecast_horizon_hours: 2,
            timespread: vec![UsageStep {
                seconds_of_day: 0,
                usage_percentage: 50.0,
            }],
            ..LeafConfig::default()
        }
    }

    fn leaf(clock: Arc<ManualClock>, config: LeafConfig) -> LeafNode {
        let control = ControlNode::new(
            NodeId::from("der"),
            Some(NodeId::from("bus_0")),
            NodeConfig::default(),
            clock,
            Arc::new(LocalTransport::queued()),
        );
        LeafNode::new(control, DerSimulator::new(config, 1))
    }

    #[test]
    fn time_percentage_takes_first_later_step() {
        let config = LeafConfig {
            timespread: vec![
                UsageStep {
                    seconds_of_day: 0,
                    usage_percentage: 10.0,
                },
                UsageStep {
                    seconds_of_day: 36_000,
                    usage_percentage: 40.0,
                },
                UsageStep {
                    seconds_of_day: 72_000,
                    usage_percentage: 70.0,
                },
            ],
            ..flat_config()
        };
        let sim = DerSimulator::new(config, 0);
        assert_eq!(sim.time_percentage(t(9, 0)), 40.0);
        assert_eq!(sim.time_percentage(t(10, 0)), 70.0);
        assert_eq!(sim.time_percentage(t(23, 0)), 70.0);
    }

    #[test]
    fn band_narrows_far_from_mean() {
        assert_eq!(band(20.0), 1.0);
        assert_eq!(band(12.0), 5.0);
        assert_eq!(band(7.0), 10.0);
        assert_eq!(band(0.0), 15.0);
        assert_eq!(band(-30.0), 15.0);
    }

    #[test]
    fn flexibility_brackets_consumption() {
        let sim = DerSimulator::new(flat_config(), 0);
        // base 500 W sits on the band mean of 50 %
        let base = 500.0;
        assert!((sim.max_flexibility(base, base) - 575.0).abs() < 1e-9);
        assert!((sim.min_flexibility(base, base) - 425.0).abs() < 1e-9);
        assert_eq!(sim.max_flexibility(900.0, base), 900.0);
        assert_eq!(sim.min_flexibility(100.0, base), 100.0);
    }

    #[test]
    fn generation_lowers_min_flex() {
        let config = LeafConfig {
            generation_offset: 100.0,
            ..flat_config()
        };
        let sim = DerSimulator::new(config, 0);
        assert!((sim.min_flexibility(500.0, 500.0) - 325.0).abs() < 1e-9);
    }

    #[test]
    fn consumption_is_clamped_and_offsets_fade() {
        let mut sim = DerSimulator::new(flat_config(), 0);
        let slot = t(10, 15);
        let len = Duration::minutes(15);
        sim.set_trick_offset(200.0);
        assert_eq!(sim.consumption(slot, slot, len, 500.0), 700.0);
        // two slots away the offset is halved
        assert_eq!(sim.consumption(slot + Duration::minutes(30), slot, len, 500.0), 600.0);
        sim.set_trick_offset(5000.0);
        assert_eq!(sim.consumption(slot, slot, len, 500.0), 1000.0);
        sim.set_trick_offset(-5000.0);
        assert_eq!(sim.consumption(slot, slot, len, 500.0), 0.0);
    }

    #[test]
    fn random_offset_stays_in_range() {
        let config = LeafConfig {
            random_offset: 40.0,
            ..flat_config()
        };
        let mut sim = DerSimulator::new(config, 9);
        for _ in 0..100 {
            sim.refresh_random_offset();
            assert!(sim.current_random_offset().abs() <= 20.0);
        }
    }

    #[test]
    fn report_covers_previous_slot_to_horizon() {
        let clock = Arc::new(ManualClock::new(t(10, 5)));
        let node = leaf(clock, flat_config());
        let report = node.generate_report();
        let hvac = report.category(Category::Hvac).expect("own category");
        assert_eq!(report.timestamp(), t(10, 15));
        assert_eq!(hvac.demand.value_at(t(9, 59)), 0.0);
        assert_eq!(hvac.demand.value_at(t(10, 0)), 500.0);
        assert_eq!(hvac.demand.value_at(t(12, 0)), 500.0);
        assert!(hvac.max_flex.value_at(t(10, 30)) > 500.0);
        assert!(hvac.min_flex.value_at(t(10, 30)) < 500.0);
        assert_eq!(report.all().demand.value_at(t(10, 30)), 500.0);
    }

    #[test]
    fn abstaining_leaf_offers_no_flexibility() {
        let clock = Arc::new(ManualClock::new(t(10, 5)));
        let node = leaf(clock, flat_config());
        node.control().set_mode(ControlMode::Abstain);
        let all = node.generate_report().all().into_owned();
        assert_eq!(all.max_flex, all.demand);
        assert_eq!(all.min_flex, all.demand);
    }

    #[test]
    fn contract_goal_drives_consumption() {
        let clock = Arc::new(ManualClock::new(t(10, 5)));
        let node = leaf(clock, flat_config());
        let request = Timeline::from_breakpoints(t(10, 15), [(-900_000, 650.0)]);
        node.control().request(&node, &request, false);
        assert_eq!(node.control().mode(), ControlMode::Contract);
        assert_eq!(node.consumption(), 650.0);
        let report = node.generate_report();
        assert_eq!(report.all().demand.value_at(t(10, 20)), 650.0);
        // beyond the committed window consumption falls back to base
        assert_eq!(report.all().demand.value_at(t(11, 0)), 500.0);
    }

    #[test]
    fn report_call_is_rejected() {
        let clock = Arc::new(ManualClock::new(t(10, 5)));
        let node = leaf(clock, flat_config());
        let profile = PowerProfile::new(t(10, 15));
        let err = node
            .handle(&NodeId::from("x"), Call::Report(profile))
            .expect_err("leaves reject reports");
        assert!(matches!(err, TransportError::Rejected { .. }));
    }
}
