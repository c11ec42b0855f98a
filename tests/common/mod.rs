//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dr_tree::clock::{Clock, ManualClock};
use dr_tree::config::{LeafConfig, NodeConfig, UsageStep};
use dr_tree::logline::MemoryLog;
use dr_tree::node::{AggregatingNode, ControlNode, DerSimulator, LeafNode, NodeId};
use dr_tree::profile::{Category, Timeline};
use dr_tree::transport::{LocalTransport, Transport};

/// 2016-01-01 at `h:m` UTC.
pub fn t(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 1, 1, h, m, 0)
        .single()
        .expect("valid timestamp")
}

/// Constant 50 % usage of 1 kW with flexibility bounds of 20 % and 80 %.
///
/// With those settings every leaf reports 500 W within [425, 575] W.
pub fn flat_leaf(id: &str, parent: &str) -> LeafConfig {
    LeafConfig {
        id: id.to_string(),
        parent: parent.to_string(),
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

/// A bus with three flat leaves on a queued transport, clock at 10:05.
///
/// Windows are therefore `[10:00, 10:15)` and `[10:15, 10:30)`.
pub struct Bus {
    pub clock: Arc<ManualClock>,
    pub transport: Arc<LocalTransport>,
    pub log: Arc<MemoryLog>,
    pub bus: Arc<AggregatingNode>,
    pub leaves: Vec<Arc<LeafNode>>,
}

impl Bus {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(t(10, 5)));
        let transport = Arc::new(LocalTransport::queued());
        let log = Arc::new(MemoryLog::new());

        let bus = Arc::new(
            AggregatingNode::new(control("bus_0", None, &clock, &transport)).with_log_sink(log.clone()),
        );
        transport.register(bus.id().clone(), &bus);

        let leaves = ["der_1", "der_2", "der_3"]
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let leaf = Arc::new(LeafNode::new(
                    control(id, Some("bus_0"), &clock, &transport),
                    DerSimulator::new(flat_leaf(id, "bus_0"), i as u64),
                ));
                transport.register(leaf.id().clone(), &leaf);
                leaf
            })
            .collect();

        Self {
            clock,
            transport,
            log,
            bus,
            leaves,
        }
    }

    /// Every leaf reports and the reports are delivered.
    pub fn report_all(&self) {
        for leaf in &self.leaves {
            leaf.send_report();
        }
        self.transport.pump(1_000);
    }

    /// Sends a flat request of `watts` over both windows to the bus and
    /// delivers everything that follows from it.
    pub fn request(&self, watts: f64) -> usize {
        self.transport
            .call(&NodeId::from("operator"), self.bus.id(), dr_tree::transport::Call::Request {
                timeline: flat(watts),
                wants_reply: true,
            })
            .expect("bus accepts requests");
        self.transport.pump(1_000)
    }

    pub fn leaf(&self, id: &str) -> &Arc<LeafNode> {
        self.leaves
            .iter()
            .find(|l| l.id().as_str() == id)
            .expect("known leaf")
    }

    /// Deviations of the bus over the current and the next window.
    pub fn diffs(&self) -> (f64, f64) {
        use dr_tree::node::ReportSource;

        let aggregate = self.bus.generate_report();
        let control = self.bus.control();
        let now = self.clock.now();
        (
            control.get_diff(t(10, 0), t(10, 15), now, &aggregate),
            control.get_diff(t(10, 15), t(10, 30), t(10, 15), &aggregate),
        )
    }
}

pub fn control(
    id: &str,
    parent: Option<&str>,
    clock: &Arc<ManualClock>,
    transport: &Arc<LocalTransport>,
) -> ControlNode {
    let clock: Arc<dyn Clock> = clock.clone();
    let transport: Arc<dyn Transport> = transport.clone();
    ControlNode::new(
        NodeId::from(id),
        parent.map(NodeId::from),
        NodeConfig::default(),
        clock,
        transport,
    )
}

/// `watts` from 10:00 until 10:30.
pub fn flat(watts: f64) -> Timeline {
    let epoch = t(10, 15);
    let offset = |at: DateTime<Utc>| (at - epoch).num_milliseconds();
    Timeline::from_breakpoints(epoch, [(offset(t(10, 0)), watts), (offset(t(10, 30)), 0.0)])
}
