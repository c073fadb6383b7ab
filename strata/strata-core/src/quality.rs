//! Ordered quality grades attached to participant data, snapshots and requests.

use crate::error::StrataError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Freshness/completeness grade, ordered from worst to best.
///
/// `None` doubles as the sentinel quality of an empty snapshot: it is the
/// only quality a project without participants can ever satisfy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Nothing was loaded
    #[default]
    None,
    /// Synthesized data standing in for a participant that could not load
    Fallback,
    /// Loaded, but with errors
    Broken,
    /// Basic structure loaded without resolution
    Simple,
    /// Fully loaded, dependencies not resolved
    Loaded,
    /// Fully loaded and resolved
    Resolved,
}

impl Quality {
    /// The quality reported when a snapshot holds no participant data.
    pub const EMPTY: Quality = Quality::None;

    pub fn is_at_least(self, other: Quality) -> bool {
        self >= other
    }

    pub fn is_worse_than(self, other: Quality) -> bool {
        self < other
    }

    /// Worst quality of the sequence, or [`Quality::EMPTY`] when it is empty.
    pub fn worst<I>(qualities: I) -> Quality
    where
        I: IntoIterator<Item = Quality>,
    {
        qualities.into_iter().min().unwrap_or(Self::EMPTY)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fallback => "fallback",
            Self::Broken => "broken",
            Self::Simple => "simple",
            Self::Loaded => "loaded",
            Self::Resolved => "resolved",
        }
    }

    /// Compact encoding used for atomic storage.
    pub fn to_index(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Quality::to_index`]; out-of-range values saturate.
    pub fn from_u8(index: u8) -> Quality {
        match index {
            0 => Self::None,
            1 => Self::Fallback,
            2 => Self::Broken,
            3 => Self::Simple,
            4 => Self::Loaded,
            _ => Self::Resolved,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Quality {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fallback" => Ok(Self::Fallback),
            "broken" => Ok(Self::Broken),
            "simple" => Ok(Self::Simple),
            "loaded" => Ok(Self::Loaded),
            "resolved" => Ok(Self::Resolved),
            _ => Err(StrataError::invalid_input(format!("Unknown quality '{}'", s))),
        }
    }
}
