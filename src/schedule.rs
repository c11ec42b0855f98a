//! Deferred execution and the periodic timers every node runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Duration, Utc};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::clock::{Clock, ManualClock};
use crate::node::{LeafNode, Node};
use crate::sync::lock;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks at a point in time.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Runs `task` at `at`, or as soon as possible if `at` has passed.
    fn schedule_at(&self, at: DateTime<Utc>, task: Task);

    fn schedule_after(&self, delay: Duration, task: Task) {
        self.schedule_at(self.now() + delay, task);
    }
}

/// Real-time scheduler on a tokio runtime.
pub struct TokioScheduler {
    handle: Handle,
    clock: Arc<dyn Clock>,
}

impl TokioScheduler {
    pub fn new(handle: Handle, clock: Arc<dyn Clock>) -> Self {
        Self { handle, clock }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn schedule_at(&self, at: DateTime<Utc>, task: Task) {
        let delay = (at - self.clock.now()).to_std().unwrap_or_default();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

/// Simulated-time scheduler.
///
/// Tasks wait in a time-ordered queue until [`run_until`](Self::run_until)
/// or [`pop_due`](Self::pop_due) moves the shared [`ManualClock`] to them.
/// Tasks due at the same instant run in the order they were scheduled.
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    queue: Mutex<BTreeMap<(DateTime<Utc>, u64), Task>>,
    seq: AtomicU64,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            queue: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// When the earliest task is due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        lock(&self.queue).first_key_value().map(|((at, _), _)| *at)
    }

    /// Removes the earliest task due at or before `until` and moves the
    /// clock to its due time. The queue lock is released before returning,
    /// so the task may schedule more work.
    pub fn pop_due(&self, until: DateTime<Utc>) -> Option<Task> {
        let ((at, _), task) = {
            let mut queue = lock(&self.queue);
            let due = queue.first_key_value().is_some_and(|((at, _), _)| *at <= until);
            if !due {
                return None;
            }
            queue.pop_first()?
        };
        if at > self.clock.now() {
            self.clock.set(at);
        }
        Some(task)
    }

    /// Runs every task due up to `until`, then moves the clock to `until`.
    pub fn run_until(&self, until: DateTime<Utc>) -> usize {
        let mut ran = 0;
        while let Some(task) = self.pop_due(until) {
            task();
            ran += 1;
        }
        if until > self.clock.now() {
            self.clock.set(until);
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn schedule_at(&self, at: DateTime<Utc>, task: Task) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.queue).insert((at, seq), task);
    }
}

/// How often the timeslot is refreshed.
const UPDATE_TIME_INTERVAL_SECS: i64 = 60;
/// Steering runs this long before each slot boundary.
const STEER_LEAD_SECS: i64 = 35;
const RANDOM_OFFSET_MAX_SECS: i64 = 60;
const USER_EVENT_MAX_SECS: i64 = 30;

/// Arms the timers shared by every node: timeslot refresh, reporting after
/// each slot boundary and on an interval, the initial report, and for
/// aggregators the steering pass ahead of each boundary.
///
/// Timers hold weak references and stop once the node is dropped.
pub fn start_node_timers(node: &Arc<dyn Node>, scheduler: &Arc<dyn Scheduler>) {
    let weak = Arc::downgrade(node);
    repeat_update_time(weak.clone(), scheduler.clone());
    repeat_send_report_on_slot(weak.clone(), scheduler.clone());
    repeat_send_report_on_interval(weak.clone(), scheduler.clone());

    let delay = Duration::milliseconds(node.control().config().initial_report_delay_ms);
    let initial = weak.clone();
    scheduler.schedule_after(
        delay,
        Box::new(move || {
            if let Some(node) = initial.upgrade() {
                node.send_report();
            }
        }),
    );

    if node.is_aggregator() {
        repeat_steer(weak, scheduler.clone());
    }
}

/// Arms the random-offset refresh and, if enabled, simulated user events.
pub fn start_leaf_timers(leaf: &Arc<LeafNode>, scheduler: &Arc<dyn Scheduler>) {
    repeat_random_offset(Arc::downgrade(leaf), scheduler.clone());
    if leaf.user_events() {
        info!(node = %leaf.id(), "starting user events");
        repeat_user_events(Arc::downgrade(leaf), scheduler.clone());
    }
}

fn repeat_update_time(node: Weak<dyn Node>, scheduler: Arc<dyn Scheduler>) {
    let Some(live) = node.upgrade() else {
        return;
    };
    live.control().update_time();
    let next = scheduler.clone();
    scheduler.schedule_after(
        Duration::seconds(UPDATE_TIME_INTERVAL_SECS),
        Box::new(move || repeat_update_time(node, next)),
    );
}

fn repeat_send_report_on_slot(node: Weak<dyn Node>, scheduler: Arc<dyn Scheduler>) {
    let Some(live) = node.upgrade() else {
        return;
    };
    let control = live.control();
    let offset = control.config().send_offset_ms;
    if offset <= 0 {
        debug!(node = %control.id(), "slot reports disabled");
        return;
    }
    control.update_time();
    let offset = Duration::milliseconds(offset);
    let slot = control.timeslot();
    let prev = slot - control.slot_len() + offset;
    let at = if scheduler.now() < prev { prev } else { slot + offset };
    debug!(node = %control.id(), next = %at, "slot report");
    live.send_report();

    let next = scheduler.clone();
    scheduler.schedule_at(at, Box::new(move || repeat_send_report_on_slot(node, next)));
}

fn repeat_send_report_on_interval(node: Weak<dyn Node>, scheduler: Arc<dyn Scheduler>) {
    let Some(live) = node.upgrade() else {
        return;
    };
    let interval = live.control().config().send_interval_ms;
    if interval <= 0 {
        return;
    }
    live.control().update_time();
    live.send_report();

    let next = scheduler.clone();
    scheduler.schedule_after(
        Duration::milliseconds(interval),
        Box::new(move || repeat_send_report_on_interval(node, next)),
    );
}

fn repeat_steer(node: Weak<dyn Node>, scheduler: Arc<dyn Scheduler>) {
    let Some(live) = node.upgrade() else {
        return;
    };
    live.steer();

    let control = live.control();
    let at = control.timeslot() + control.slot_len() - Duration::seconds(STEER_LEAD_SECS);
    let prev = at - control.slot_len();
    let at = if scheduler.now() < prev { prev } else { at };

    let next = scheduler.clone();
    scheduler.schedule_at(at, Box::new(move || repeat_steer(node, next)));
}

fn repeat_random_offset(leaf: Weak<LeafNode>, scheduler: Arc<dyn Scheduler>) {
    let Some(live) = leaf.upgrade() else {
        return;
    };
    live.refresh_random_offset();
    let delay = live.random_delay(RANDOM_OFFSET_MAX_SECS);
    let next = scheduler.clone();
    scheduler.schedule_after(delay, Box::new(move || repeat_random_offset(leaf, next)));
}

fn repeat_user_events(leaf: Weak<LeafNode>, scheduler: Arc<dyn Scheduler>) {
    let Some(live) = leaf.upgrade() else {
        return;
    };
    live.user_event();
    let delay = live.random_delay(USER_EVENT_MAX_SECS);
    let next = scheduler.clone();
    scheduler.schedule_after(delay, Box::new(move || repeat_user_events(leaf, next)));
}
