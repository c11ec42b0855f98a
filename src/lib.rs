//! Hierarchical demand-response control tree.
//!
//! Leaves forecast the demand and flexibility of a device, aggregators sum
//! the reports of their children, and a committed target handed down from
//! the root is apportioned over the children each timeslot.

#[cfg(feature = "api")]
pub mod api;
pub mod clock;
pub mod config;
pub mod logline;
pub mod node;
pub mod profile;
pub mod schedule;
pub mod sim;
mod sync;
pub mod transport;
