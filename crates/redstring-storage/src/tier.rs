// tier.rs — Names for the three persistence tiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Remote,
    Cache,
}

impl Tier {
    /// Fallback order used after the declared source of truth.
    pub const PRIORITY: [Tier; 3] = [Tier::Local, Tier::Remote, Tier::Cache];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
            Tier::Cache => write!(f, "cache"),
        }
    }
}

/// The tier that is authoritative for a workspace.
///
/// Serializes as `"local"`, `"remote"` or `"cache"`; the older spelling
/// `"git"` is accepted for remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOfTruth {
    Local,
    #[serde(alias = "git")]
    Remote,
    #[default]
    Cache,
}

impl SourceOfTruth {
    pub fn tier(self) -> Tier {
        match self {
            SourceOfTruth::Local => Tier::Local,
            SourceOfTruth::Remote => Tier::Remote,
            SourceOfTruth::Cache => Tier::Cache,
        }
    }

    pub fn from_tier(tier: Tier) -> Self {
        match tier {
            Tier::Local => SourceOfTruth::Local,
            Tier::Remote => SourceOfTruth::Remote,
            Tier::Cache => SourceOfTruth::Cache,
        }
    }
}

impl fmt::Display for SourceOfTruth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.tier().fmt(f)
    }
}
