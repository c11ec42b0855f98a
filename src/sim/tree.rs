//! Wiring of a complete tree from a [`TreeConfig`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::clock::{Clock, ManualClock};
use crate::config::{ConfigError, TreeConfig};
use crate::logline::{LogSink, MemoryLog};
use crate::node::{AggregatingNode, ControlMode, ControlNode, DerSimulator, LeafNode, Node, NodeId};
use crate::schedule::{ManualScheduler, Scheduler, start_leaf_timers, start_node_timers};
use crate::transport::{LocalTransport, Transport};

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub parent: Option<String>,
    pub mode: ControlMode,
    pub aggregator: bool,
    pub description: String,
}

/// Every node of a tree sharing one simulated clock, scheduler and
/// queued transport. Aggregators log into a shared [`MemoryLog`].
pub struct Tree {
    clock: Arc<ManualClock>,
    scheduler: Arc<ManualScheduler>,
    transport: Arc<LocalTransport>,
    log: Arc<MemoryLog>,
    root: NodeId,
    aggregators: BTreeMap<NodeId, Arc<AggregatingNode>>,
    leaves: BTreeMap<NodeId, Arc<LeafNode>>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root)
            .field("aggregators", &self.aggregators.len())
            .field("leaves", &self.leaves.len())
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// Builds the nodes of `config` at `config.simulation.start`.
    ///
    /// Leaf `i` seeds its model with `seed + i`. Timers are not armed;
    /// call [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns the first validation error of `config`.
    pub fn build(config: &TreeConfig) -> Result<Self, ConfigError> {
        if let Some(err) = config.validate().into_iter().next() {
            return Err(err);
        }
        let root = config
            .root()
            .map(NodeId::from)
            .ok_or_else(|| ConfigError::new("aggregators", "exactly one aggregator must have no parent"))?;

        let clock = Arc::new(ManualClock::new(config.simulation.start));
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let transport = Arc::new(LocalTransport::queued());
        let log = Arc::new(MemoryLog::new());

        let shared_clock: Arc<dyn Clock> = clock.clone();
        let shared_transport: Arc<dyn Transport> = transport.clone();
        let sink: Arc<dyn LogSink> = log.clone();
        let control = |id: &str, parent: Option<&str>| {
            ControlNode::new(
                NodeId::from(id),
                parent.map(NodeId::from),
                config.node.clone(),
                shared_clock.clone(),
                shared_transport.clone(),
            )
        };

        let mut aggregators = BTreeMap::new();
        for agg in &config.aggregators {
            let node = Arc::new(
                AggregatingNode::new(control(&agg.id, agg.parent.as_deref())).with_log_sink(sink.clone()),
            );
            transport.register(node.id().clone(), &node);
            aggregators.insert(node.id().clone(), node);
        }

        let mut leaves = BTreeMap::new();
        for (i, leaf) in config.leaves.iter().enumerate() {
            let seed = config.simulation.seed.wrapping_add(i as u64);
            let node = Arc::new(LeafNode::new(
                control(&leaf.id, Some(&leaf.parent)),
                DerSimulator::new(leaf.clone(), seed),
            ));
            transport.register(node.id().clone(), &node);
            leaves.insert(node.id().clone(), node);
        }

        info!(
            root = %root,
            aggregators = aggregators.len(),
            leaves = leaves.len(),
            "tree built"
        );
        Ok(Self {
            clock,
            scheduler,
            transport,
            log,
            root,
            aggregators,
            leaves,
        })
    }

    /// Arms the timers of every node.
    pub fn start(&self) {
        let scheduler: Arc<dyn Scheduler> = self.scheduler.clone();
        for node in self.nodes() {
            start_node_timers(&node, &scheduler);
        }
        for leaf in self.leaves.values() {
            start_leaf_timers(leaf, &scheduler);
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<ManualScheduler> {
        &self.scheduler
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root
    }

    /// The root aggregator. Present by construction.
    pub fn root(&self) -> Option<&Arc<AggregatingNode>> {
        self.aggregators.get(&self.root)
    }

    pub fn aggregator(&self, id: &str) -> Option<&Arc<AggregatingNode>> {
        self.aggregators.get(&NodeId::from(id))
    }

    pub fn leaf(&self, id: &str) -> Option<&Arc<LeafNode>> {
        self.leaves.get(&NodeId::from(id))
    }

    /// Aggregators first, then leaves, each sorted by id.
    pub fn nodes(&self) -> Vec<Arc<dyn Node>> {
        let aggregators = self.aggregators.values().map(|a| a.clone() as Arc<dyn Node>);
        let leaves = self.leaves.values().map(|l| l.clone() as Arc<dyn Node>);
        aggregators.chain(leaves).collect()
    }

    pub fn node(&self, id: &str) -> Option<Arc<dyn Node>> {
        let id = NodeId::from(id);
        if let Some(agg) = self.aggregators.get(&id) {
            return Some(agg.clone() as Arc<dyn Node>);
        }
        self.leaves.get(&id).map(|l| l.clone() as Arc<dyn Node>)
    }

    /// Snapshots every node in [`nodes`](Self::nodes) order.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.nodes()
            .iter()
            .map(|node| {
                let control = node.control();
                NodeSnapshot {
                    id: control.id().to_string(),
                    parent: control.parent().map(NodeId::to_string),
                    mode: control.mode(),
                    aggregator: node.is_aggregator(),
                    description: node.describe(),
                }
            })
            .collect()
    }
}
