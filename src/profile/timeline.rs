//! Sparse right-continuous step function of power over time.

use std::cmp::Ordering;
use std::ops::{Add, Sub};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::breakpoint::Breakpoint;

/// A power signal (watts) over time, stored as sparse breakpoints.
///
/// The value at `t` is the value of the last breakpoint whose offset is
/// `<= t - epoch`; before the first breakpoint the value is `0.0`, after the
/// last one it holds indefinitely. Offsets are strictly increasing.
///
/// Combining operations never alias: they return a new `Timeline` (or
/// consume `self` and hand back the modified value).
///
/// # Examples
///
/// ```
/// use chrono::{DateTime, Duration, Utc};
/// use dr_tree::profile::Timeline;
///
/// let epoch: DateTime<Utc> = "2016-01-01T00:00:00Z".parse().unwrap();
/// let a = Timeline::from_breakpoints(epoch, [(0, 10.0), (1000, 20.0)]);
/// let b = Timeline::from_breakpoints(epoch, [(0, 5.0)]);
///
/// let sum = a.add(&b);
/// assert_eq!(sum.value_at(epoch + Duration::milliseconds(1500)), 25.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TimelineRepr")]
pub struct Timeline {
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    epoch: DateTime<Utc>,
    #[serde(rename = "series")]
    breakpoints: Vec<Breakpoint>,
}

/// Unchecked wire shape; normalized into a [`Timeline`] on deserialization.
#[derive(Deserialize)]
struct TimelineRepr {
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    epoch: DateTime<Utc>,
    #[serde(rename = "series", default)]
    breakpoints: Vec<Breakpoint>,
}

impl From<TimelineRepr> for Timeline {
    fn from(repr: TimelineRepr) -> Self {
        Self::from_breakpoints(
            repr.epoch,
            repr.breakpoints.into_iter().map(|bp| (bp.offset, bp.value)),
        )
    }
}

impl Timeline {
    /// Creates an empty timeline (zero everywhere) anchored at `epoch`.
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            breakpoints: Vec::new(),
        }
    }

    /// Builds a timeline from `(offset_ms, watts)` pairs in any order.
    ///
    /// Pairs are sorted by offset; when an offset repeats, the last pair wins.
    pub fn from_breakpoints(
        epoch: DateTime<Utc>,
        points: impl IntoIterator<Item = (i64, f64)>,
    ) -> Self {
        let mut breakpoints: Vec<Breakpoint> = points
            .into_iter()
            .map(|(offset, value)| Breakpoint::new(offset, value))
            .collect();
        breakpoints.sort_by_key(|bp| bp.offset);
        // dedup_by keeps the first of a run; reverse so the last write survives.
        breakpoints.reverse();
        breakpoints.dedup_by_key(|bp| bp.offset);
        breakpoints.reverse();
        Self { epoch, breakpoints }
    }

    /// The instant offsets are measured from.
    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Breakpoints in increasing offset order.
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Number of breakpoints.
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    /// `true` when the timeline has no breakpoints (zero everywhere).
    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    fn offset_of(&self, t: DateTime<Utc>) -> i64 {
        (t - self.epoch).num_milliseconds()
    }

    fn value_at_offset(&self, offset: i64) -> f64 {
        let idx = self.breakpoints.partition_point(|bp| bp.offset <= offset);
        if idx == 0 {
            0.0
        } else {
            self.breakpoints[idx - 1].value
        }
    }

    /// Returns the value active at `t`, or `0.0` before the first breakpoint.
    pub fn value_at(&self, t: DateTime<Utc>) -> f64 {
        self.value_at_offset(self.offset_of(t))
    }

    /// Inserts a breakpoint at `t`, overwriting any breakpoint already there.
    pub fn set_value_at(&mut self, t: DateTime<Utc>, value: f64) {
        let offset = self.offset_of(t);
        let bp = Breakpoint::new(offset, value);
        match self.breakpoints.binary_search_by_key(&offset, |bp| bp.offset) {
            Ok(idx) => self.breakpoints[idx] = bp,
            Err(idx) => self.breakpoints.insert(idx, bp),
        }
    }

    /// Exact integral over `[from, until)` in watt-seconds.
    ///
    /// Returns `0.0` for empty or reversed intervals.
    pub fn integral(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
        if until <= from {
            return 0.0;
        }
        let from = self.offset_of(from);
        let until = self.offset_of(until);
        millis_integral(&self.breakpoints, from, until) / 1000.0
    }

    /// Time-weighted mean power over `[from, until)`; `0.0` if the interval
    /// is empty.
    pub fn average_watts(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
        let seconds = (until - from).num_milliseconds() as f64 / 1000.0;
        if seconds > 0.0 {
            self.integral(from, until) / seconds
        } else {
            0.0
        }
    }

    /// Pointwise sum.
    pub fn add(&self, other: &Timeline) -> Timeline {
        self.combine(other, |a, b| a + b)
    }

    /// Pointwise difference `self - other`.
    pub fn subtract(&self, other: &Timeline) -> Timeline {
        self.combine(other, |a, b| a - b)
    }

    /// Pointwise product.
    pub fn multiply(&self, other: &Timeline) -> Timeline {
        self.combine(other, |a, b| a * b)
    }

    /// Pointwise maximum.
    pub fn max(&self, other: &Timeline) -> Timeline {
        self.combine(other, f64::max)
    }

    /// Pointwise minimum.
    pub fn min(&self, other: &Timeline) -> Timeline {
        self.combine(other, f64::min)
    }

    /// Walks both breakpoint axes with a shared cursor, carrying each side's
    /// last value across the other side's breakpoints. The result lives on
    /// `self`'s epoch.
    fn combine(&self, other: &Timeline, op: impl Fn(f64, f64) -> f64) -> Timeline {
        if other.is_empty() {
            return self.clone();
        }
        let shift = (other.epoch - self.epoch).num_milliseconds();
        if self.is_empty() {
            return Timeline {
                epoch: self.epoch,
                breakpoints: other
                    .breakpoints
                    .iter()
                    .map(|bp| Breakpoint::new(bp.offset + shift, op(0.0, bp.value)))
                    .collect(),
            };
        }

        let mine = &self.breakpoints;
        let theirs = &other.breakpoints;
        let mut out = Vec::with_capacity(mine.len() + theirs.len());
        let (mut i, mut j) = (0, 0);
        let (mut mine_val, mut their_val) = (0.0, 0.0);

        while i < mine.len() && j < theirs.len() {
            let a = mine[i];
            let b = theirs[j];
            let b_offset = b.offset + shift;
            match b_offset.cmp(&a.offset) {
                Ordering::Greater => {
                    mine_val = a.value;
                    out.push(Breakpoint::new(a.offset, op(mine_val, their_val)));
                    i += 1;
                }
                Ordering::Equal => {
                    mine_val = a.value;
                    their_val = b.value;
                    out.push(Breakpoint::new(a.offset, op(mine_val, their_val)));
                    i += 1;
                    j += 1;
                }
                Ordering::Less => {
                    their_val = b.value;
                    out.push(Breakpoint::new(b_offset, op(mine_val, their_val)));
                    j += 1;
                }
            }
        }
        for a in &mine[i..] {
            out.push(Breakpoint::new(a.offset, op(a.value, their_val)));
        }
        for b in &theirs[j..] {
            out.push(Breakpoint::new(b.offset + shift, op(mine_val, b.value)));
        }

        Timeline {
            epoch: self.epoch,
            breakpoints: out,
        }
    }

    /// Drops breakpoints that repeat the previous value.
    pub fn compact(mut self) -> Self {
        self.breakpoints.dedup_by(|next, prev| next.value == prev.value);
        self
    }

    /// Clears everything before `t` to zero, keeping the value active at `t`
    /// as a breakpoint at `t`.
    pub fn zero_before(mut self, t: DateTime<Utc>) -> Self {
        if self.is_empty() {
            return self;
        }
        let offset = self.offset_of(t);
        let kept = self.value_at_offset(offset);
        let cut = self.breakpoints.partition_point(|bp| bp.offset <= offset);
        self.breakpoints.drain(..cut);
        self.breakpoints.insert(0, Breakpoint::new(offset, kept));
        self
    }

    /// Clears everything from `t` (inclusive) onwards to zero.
    pub fn zero_from(mut self, t: DateTime<Utc>) -> Self {
        if self.is_empty() {
            return self;
        }
        let offset = self.offset_of(t);
        let cut = self.breakpoints.partition_point(|bp| bp.offset < offset);
        self.breakpoints.truncate(cut);
        self.breakpoints.push(Breakpoint::new(offset, 0.0));
        self
    }

    /// Clears `[start, end)` to zero, restoring the value active at `end`
    /// as a breakpoint at `end`.
    pub fn zero_between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if self.is_empty() || end <= start {
            return self;
        }
        let start = self.offset_of(start);
        let end = self.offset_of(end);
        let end_val = self.value_at_offset(end);
        let lo = self.breakpoints.partition_point(|bp| bp.offset < start);
        let hi = self.breakpoints.partition_point(|bp| bp.offset <= end);
        self.breakpoints.splice(
            lo..hi,
            [Breakpoint::new(start, 0.0), Breakpoint::new(end, end_val)],
        );
        self
    }

    /// Replaces the content of `[start, end)` with `other`'s content there.
    pub fn merge(self, other: &Timeline, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let window = other.clone().zero_before(start).zero_from(end);
        self.zero_between(start, end).add(&window)
    }

    /// Re-bases offsets onto `epoch` without changing any value.
    pub fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        let shift = (self.epoch - epoch).num_milliseconds();
        if shift != 0 {
            for bp in &mut self.breakpoints {
                bp.offset += shift;
            }
        }
        self.epoch = epoch;
        self
    }

    /// Resamples into fixed buckets of `step` covering `[start, end)`.
    ///
    /// Each bucket holds the time-weighted average of `self` over that
    /// bucket; a trailing partial bucket averages over its actual length.
    /// The value is zero before `start` and from `end` on. A non-positive
    /// `step` or an empty interval yields an empty timeline.
    pub fn discrete(&self, start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Timeline {
        let step = step.num_milliseconds();
        let mut out = Timeline::new(self.epoch);
        if step <= 0 || end <= start {
            return out;
        }
        let from = self.offset_of(start);
        let until = self.offset_of(end);

        let mut bucket = from;
        while bucket < until {
            let close = (bucket + step).min(until);
            let mean = millis_integral(&self.breakpoints, bucket, close) / (close - bucket) as f64;
            out.breakpoints.push(Breakpoint::new(bucket, mean));
            bucket += step;
        }
        out.breakpoints.push(Breakpoint::new(until, 0.0));
        out
    }
}

/// Integral over `[from, until)` in watt-milliseconds.
fn millis_integral(points: &[Breakpoint], from: i64, until: i64) -> f64 {
    let mut total = 0.0;
    let mut cursor = from;
    let mut value = 0.0;
    for bp in points {
        if bp.offset < from {
            value = bp.value;
            continue;
        }
        if bp.offset > until {
            break;
        }
        total += value * (bp.offset - cursor) as f64;
        value = bp.value;
        cursor = bp.offset;
    }
    total + value * (until - cursor) as f64
}

impl Add for &Timeline {
    type Output = Timeline;

    fn add(self, rhs: &Timeline) -> Timeline {
        Timeline::add(self, rhs)
    }
}

impl Sub for &Timeline {
    type Output = Timeline;

    fn sub(self, rhs: &Timeline) -> Timeline {
        self.subtract(rhs)
    }
}
