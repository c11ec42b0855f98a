//! Control nodes of the demand-response tree.
//!
//! A [`ControlNode`] holds the state every node shares: its timeslot, mode
//! and committed target. [`AggregatingNode`] adds a table of child reports
//! and the steering pass; [`LeafNode`] wraps a simulated DER.

mod aggregator;
mod control;
mod gate;
mod leaf;
mod mode;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use aggregator::{AggregatingNode, ChildEntry};
pub use control::{ControlNode, ControlState, ReportSource};
pub use gate::SteerGate;
pub use leaf::{DerSimulator, LeafNode};
pub use mode::ControlMode;

use crate::transport::Endpoint;

/// Address of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bus-level aggregators sit at the top of the tree and do not forward
    /// reports when they are not steering.
    pub fn is_bus(&self) -> bool {
        self.0.starts_with("bus_")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Behaviour shared by both node kinds, used by timers and diagnostics.
pub trait Node: Endpoint {
    fn control(&self) -> &ControlNode;

    /// Recomputes the committed target and reports it to the parent.
    fn send_report(&self);

    /// Runs a steering pass; leaves have nothing to steer.
    fn steer(&self) {}

    /// Whether this node should get the periodic steering timer.
    fn is_aggregator(&self) -> bool {
        false
    }

    /// Human-readable status snapshot.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_prefix() {
        assert!(NodeId::from("bus_0").is_bus());
        assert!(!NodeId::from("feeder_bus").is_bus());
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&NodeId::from("hvac_1")).expect("serialize");
        assert_eq!(json, "\"hvac_1\"");
    }
}
