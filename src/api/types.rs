//! Response and query types.

use serde::{Deserialize, Serialize};

use crate::node::ControlMode;
use crate::sim::NodeSnapshot;

/// One entry of the node listing.
#[derive(Debug, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub parent: Option<String>,
    pub mode: ControlMode,
    pub aggregator: bool,
}

impl From<&NodeSnapshot> for NodeInfo {
    fn from(node: &NodeSnapshot) -> Self {
        Self {
            id: node.id.clone(),
            parent: node.parent.clone(),
            mode: node.mode,
            aggregator: node.aggregator,
        }
    }
}

/// Optional filters of the log endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Only records of this node.
    pub node: Option<String>,
    /// Earliest record time, epoch milliseconds (inclusive).
    pub from: Option<i64>,
    /// Latest record time, epoch milliseconds (inclusive).
    pub to: Option<i64>,
}

impl LogQuery {
    pub fn matches(&self, id: &str, now: i64) -> bool {
        self.node.as_deref().is_none_or(|node| node == id)
            && self.from.is_none_or(|from| now >= from)
            && self.to.is_none_or(|to| now <= to)
    }
}

/// Body of 4xx responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
