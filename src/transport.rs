//! Addressable calls between nodes.
//!
//! Nodes never hold references to each other; they address peers by
//! [`NodeId`] through a [`Transport`]. [`LocalTransport`] is the in-process
//! implementation used by the simulator, the tests, and the CLI.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::runtime::Handle;
use tracing::debug;

use crate::node::{ControlMode, NodeId};
use crate::profile::{PowerProfile, Timeline};
use crate::sync::{lock, read, write};

/// One remote procedure call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// A child's current report.
    Report(PowerProfile),
    /// A demand request from the parent.
    Request { timeline: Timeline, wants_reply: bool },
    SetMode(ControlMode),
    /// Drop all cached child reports.
    Reset,
}

impl Call {
    /// Method name as it appears in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Call::Report(_) => "report",
            Call::Request { .. } => "request",
            Call::SetMode(_) => "setModus",
            Call::Reset => "reset",
        }
    }
}

/// Delivery failure.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No live endpoint is registered under this id.
    Unreachable(NodeId),
    /// The endpoint refused the call.
    Rejected { to: NodeId, reason: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unreachable(id) => write!(f, "node {id} is unreachable"),
            TransportError::Rejected { to, reason } => write!(f, "node {to} rejected call: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Receiving side of a call.
pub trait Endpoint: Send + Sync {
    fn handle(&self, from: &NodeId, call: Call) -> Result<(), TransportError>;
}

/// Completion callback of [`Transport::call_async`].
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Sending side of a call.
pub trait Transport: Send + Sync {
    /// Fire-and-forget delivery; `on_done` observes the outcome.
    fn call_async(&self, from: &NodeId, to: &NodeId, call: Call, on_done: Completion);

    /// Delivers immediately on the calling thread.
    fn call(&self, from: &NodeId, to: &NodeId, call: Call) -> Result<(), TransportError>;
}

/// How [`LocalTransport`] runs asynchronous calls.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Calls wait in a FIFO until [`LocalTransport::pump`] drains it.
    Queued,
    /// Each call runs on the tokio blocking pool.
    Spawned(Handle),
}

struct Envelope {
    from: NodeId,
    to: NodeId,
    call: Call,
    on_done: Completion,
}

/// In-process registry of endpoints.
///
/// Holds only weak references, so dropping a node makes it unreachable
/// without unregistering it.
pub struct LocalTransport {
    endpoints: RwLock<HashMap<NodeId, Weak<dyn Endpoint>>>,
    delivery: Delivery,
    queue: Mutex<VecDeque<Envelope>>,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("endpoints", &read(&self.endpoints).len())
            .field("delivery", &self.delivery)
            .field("pending", &self.pending())
            .finish()
    }
}

impl LocalTransport {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            delivery,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Transport whose asynchronous calls are delivered by [`pump`](Self::pump).
    pub fn queued() -> Self {
        Self::new(Delivery::Queued)
    }

    /// Registers `endpoint` under `id`, replacing any previous registration.
    pub fn register<E: Endpoint + 'static>(&self, id: NodeId, endpoint: &Arc<E>) {
        let weak: Weak<dyn Endpoint> = Arc::downgrade(endpoint) as Weak<dyn Endpoint>;
        write(&self.endpoints).insert(id, weak);
    }

    pub fn unregister(&self, id: &NodeId) {
        write(&self.endpoints).remove(id);
    }

    /// Number of queued asynchronous calls.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Delivers up to `limit` queued calls in FIFO order, including calls
    /// enqueued by the handlers themselves. Returns how many were delivered.
    pub fn pump(&self, limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit {
            let Some(envelope) = lock(&self.queue).pop_front() else {
                break;
            };
            let result = self.deliver(&envelope.from, &envelope.to, envelope.call);
            (envelope.on_done)(result);
            delivered += 1;
        }
        delivered
    }

    fn resolve(&self, to: &NodeId) -> Result<Arc<dyn Endpoint>, TransportError> {
        read(&self.endpoints)
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, call: Call) -> Result<(), TransportError> {
        debug!(from = %from, to = %to, method = call.method(), "delivering call");
        self.resolve(to)?.handle(from, call)
    }
}

impl Transport for LocalTransport {
    fn call_async(&self, from: &NodeId, to: &NodeId, call: Call, on_done: Completion) {
        match &self.delivery {
            Delivery::Queued => lock(&self.queue).push_back(Envelope {
                from: from.clone(),
                to: to.clone(),
                call,
                on_done,
            }),
            Delivery::Spawned(handle) => match self.resolve(to) {
                Ok(endpoint) => {
                    let from = from.clone();
                    handle.spawn_blocking(move || on_done(endpoint.handle(&from, call)));
                }
                Err(err) => on_done(Err(err)),
            },
        }
    }

    fn call(&self, from: &NodeId, to: &NodeId, call: Call) -> Result<(), TransportError> {
        self.deliver(from, to, call)
    }
}
