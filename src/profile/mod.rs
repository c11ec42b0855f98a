//! Power-over-time value model: timelines, category profiles, power profiles.

mod breakpoint;
mod category;
mod power;
mod timeline;

pub use breakpoint::{Breakpoint, sanitize};
pub use category::{Category, CategoryProfile};
pub use power::PowerProfile;
pub use timeline::Timeline;
