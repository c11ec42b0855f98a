//! Operating stance of a control node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Control mode of a node.
///
/// Serialized with capitalized names (`"Contract"`); parsing accepts any
/// letter case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", try_from = "String")]
pub enum ControlMode {
    /// Free running: requests are ignored and only reported on.
    Abstain,
    /// Flexibility is offered but nothing is steered yet.
    #[default]
    Nominal,
    /// Minimal comfort flexibility.
    Vacant,
    /// Partial control over comfort.
    Comfort,
    /// Full control over comfort.
    Economy,
    /// Tracking a contracted request profile.
    Contract,
    /// Tracking a demand forecast.
    Balance,
}

impl ControlMode {
    pub const ALL: [ControlMode; 7] = [
        ControlMode::Abstain,
        ControlMode::Nominal,
        ControlMode::Vacant,
        ControlMode::Comfort,
        ControlMode::Economy,
        ControlMode::Contract,
        ControlMode::Balance,
    ];

    /// Whether the mode grants control over devices and comfort.
    pub fn has_control(self) -> bool {
        matches!(
            self,
            ControlMode::Comfort | ControlMode::Economy | ControlMode::Contract | ControlMode::Balance
        )
    }

    /// Whether an aggregator in this mode actively steers its children.
    pub fn steers(self) -> bool {
        matches!(self, ControlMode::Contract | ControlMode::Balance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlMode::Abstain => "Abstain",
            ControlMode::Nominal => "Nominal",
            ControlMode::Vacant => "Vacant",
            ControlMode::Comfort => "Comfort",
            ControlMode::Economy => "Economy",
            ControlMode::Contract => "Contract",
            ControlMode::Balance => "Balance",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown control mode \"{s}\""))
    }
}

impl TryFrom<String> for ControlMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
