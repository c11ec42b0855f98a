//! Timestamped collection of category profiles.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::category::{Category, CategoryProfile};
use super::timeline::Timeline;

/// Power report of one node: a [`CategoryProfile`] per demand category.
///
/// The [`Category::All`] entry is not kept in sync automatically; call
/// [`PowerProfile::calc_all`] after composing or mutating categories and
/// before reading it. The combining operations below already do so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerProfile {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "reports", default)]
    categories: BTreeMap<Category, CategoryProfile>,
}

impl PowerProfile {
    /// Creates a profile with no categories.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            categories: BTreeMap::new(),
        }
    }

    /// Anchor used for lazily created categories.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the category if it has been created.
    pub fn category(&self, category: Category) -> Option<&CategoryProfile> {
        self.categories.get(&category)
    }

    /// Returns the category, creating three empty timelines on first access.
    pub fn category_mut(&mut self, category: Category) -> &mut CategoryProfile {
        let timestamp = self.timestamp;
        self.categories
            .entry(category)
            .or_insert_with(|| CategoryProfile::empty(timestamp))
    }

    /// Replaces a category wholesale.
    pub fn set_category(&mut self, category: Category, profile: CategoryProfile) {
        self.categories.insert(category, profile);
    }

    /// Iterates over present categories in declaration order.
    pub fn categories(&self) -> impl Iterator<Item = (Category, &CategoryProfile)> {
        self.categories.iter().map(|(cat, profile)| (*cat, profile))
    }

    /// The `All` category, or an empty one when it has never been computed.
    pub fn all(&self) -> Cow<'_, CategoryProfile> {
        match self.categories.get(&Category::All) {
            Some(all) => Cow::Borrowed(all),
            None => Cow::Owned(CategoryProfile::empty(self.timestamp)),
        }
    }

    /// Recomputes `All` as the sum of every other category.
    pub fn calc_all(&mut self) {
        let mut all = CategoryProfile::empty(self.timestamp);
        for cat in Category::CONCRETE {
            if let Some(part) = self.categories.get(&cat) {
                all = all.zip_with(part, |sum, t| sum.add(t));
            }
        }
        let all = all.map(Timeline::compact);
        self.categories.insert(Category::All, all);
    }

    /// Builder form of [`calc_all`](Self::calc_all).
    pub fn with_all(mut self) -> Self {
        self.calc_all();
        self
    }

    /// Replaces every category's content inside `[start, end)` with `other`'s.
    ///
    /// A category missing from `other` counts as zero inside the window.
    pub fn merge(mut self, other: &PowerProfile, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let blank = CategoryProfile::empty(other.timestamp);
        for cat in Category::CONCRETE {
            let theirs = other.categories.get(&cat);
            if theirs.is_none() && !self.categories.contains_key(&cat) {
                continue;
            }
            let theirs = theirs.unwrap_or(&blank);
            let mine = self
                .categories
                .remove(&cat)
                .unwrap_or_else(|| CategoryProfile::empty(self.timestamp));
            let merged = mine.zip_with(theirs, |tl, o| tl.merge(o, start, end).compact());
            self.categories.insert(cat, merged);
        }
        self.with_all()
    }

    /// Adds `other` category by category.
    pub fn add(mut self, other: &PowerProfile) -> Self {
        for (cat, theirs) in other.categories() {
            if cat == Category::All {
                continue;
            }
            let mine = self
                .categories
                .remove(&cat)
                .unwrap_or_else(|| CategoryProfile::empty(self.timestamp));
            let summed = mine.zip_with(theirs, |tl, o| tl.add(o).compact());
            self.categories.insert(cat, summed);
        }
        self.with_all()
    }

    /// Zeroes everything before `start` in every category.
    pub fn drop_history(mut self, start: DateTime<Utc>) -> Self {
        for cat in Category::CONCRETE {
            if let Some(profile) = self.categories.remove(&cat) {
                let trimmed = profile.map(|tl| tl.zero_before(start));
                self.categories.insert(cat, trimmed);
            }
        }
        self.with_all()
    }
}
