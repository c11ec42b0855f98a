//! Demand categories and the per-category demand/flexibility triple.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timeline::Timeline;

/// Demand category a device or aggregate reports under.
///
/// [`Category::All`] is derived: it is the sum of every other category and
/// is recomputed by [`PowerProfile::calc_all`](super::PowerProfile::calc_all).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    All,
    Hvac,
    Lighting,
    Other,
    Production,
    Simulated,
}

impl Category {
    /// Every category except the derived `All`.
    pub const CONCRETE: [Category; 5] = [
        Category::Hvac,
        Category::Lighting,
        Category::Other,
        Category::Production,
        Category::Simulated,
    ];

    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::All => "ALL",
            Category::Hvac => "HVAC",
            Category::Lighting => "LIGHTING",
            Category::Other => "OTHER",
            Category::Production => "PRODUCTION",
            Category::Simulated => "SIMULATED",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Category::All),
            "HVAC" => Ok(Category::Hvac),
            "LIGHTING" => Ok(Category::Lighting),
            "OTHER" => Ok(Category::Other),
            "PRODUCTION" => Ok(Category::Production),
            "SIMULATED" => Ok(Category::Simulated),
            other => Err(format!("unknown category \"{other}\"")),
        }
    }
}

/// Demand plus the `[min, max]` flexibility envelope for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryProfile {
    /// Expected demand.
    pub demand: Timeline,
    /// Upper bound demand may be steered to.
    #[serde(rename = "expectedFlexibilityMaxInWatts")]
    pub max_flex: Timeline,
    /// Lower bound demand may be steered to.
    #[serde(rename = "expectedFlexibilityMinInWatts")]
    pub min_flex: Timeline,
}

impl CategoryProfile {
    /// Three empty timelines anchored at `epoch`.
    pub fn empty(epoch: DateTime<Utc>) -> Self {
        Self {
            demand: Timeline::new(epoch),
            max_flex: Timeline::new(epoch),
            min_flex: Timeline::new(epoch),
        }
    }

    /// Applies `f` to each of the three timelines.
    pub(crate) fn map(self, mut f: impl FnMut(Timeline) -> Timeline) -> Self {
        Self {
            demand: f(self.demand),
            max_flex: f(self.max_flex),
            min_flex: f(self.min_flex),
        }
    }

    /// Combines matching timelines of `self` and `other` with `f`.
    pub(crate) fn zip_with(
        self,
        other: &CategoryProfile,
        mut f: impl FnMut(Timeline, &Timeline) -> Timeline,
    ) -> Self {
        Self {
            demand: f(self.demand, &other.demand),
            max_flex: f(self.max_flex, &other.max_flex),
            min_flex: f(self.min_flex, &other.min_flex),
        }
    }
}
