//! Streaming hints passed through to the store with every scan.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How eagerly the store should fill each chunk.
///
/// The iterator forwards the hint untouched; only `Iterator` and `Exact` get
/// special handling when materializing a whole range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    /// Return everything in as few chunks as possible.
    WantAll,
    /// Chunk sizes grow as the iteration counter climbs.
    #[default]
    Iterator,
    /// Return exactly the row limit in one chunk.
    Exact,
    Small,
    Medium,
    Large,
    /// Like `WantAll`, without parallel prefetch inside the store.
    Serial,
}

impl StreamingMode {
    pub const ALL: [StreamingMode; 7] = [
        StreamingMode::WantAll,
        StreamingMode::Iterator,
        StreamingMode::Exact,
        StreamingMode::Small,
        StreamingMode::Medium,
        StreamingMode::Large,
        StreamingMode::Serial,
    ];

    /// Wire code understood by the store.
    pub fn code(self) -> i32 {
        match self {
            StreamingMode::WantAll => -2,
            StreamingMode::Iterator => -1,
            StreamingMode::Exact => 0,
            StreamingMode::Small => 1,
            StreamingMode::Medium => 2,
            StreamingMode::Large => 3,
            StreamingMode::Serial => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamingMode::WantAll => "want_all",
            StreamingMode::Iterator => "iterator",
            StreamingMode::Exact => "exact",
            StreamingMode::Small => "small",
            StreamingMode::Medium => "medium",
            StreamingMode::Large => "large",
            StreamingMode::Serial => "serial",
        }
    }

    /// Mode used when a whole range is collected at once: an iterator-paced
    /// scan becomes `WantAll` without a row limit and `Exact` with one.
    pub fn for_materialize(self, row_limit: usize) -> Self {
        match self {
            StreamingMode::Iterator if row_limit == 0 => StreamingMode::WantAll,
            StreamingMode::Iterator => StreamingMode::Exact,
            other => other,
        }
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamingMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| anyhow::anyhow!("unknown streaming mode `{raw}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for mode in StreamingMode::ALL {
            assert_eq!(StreamingMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(StreamingMode::from_code(99), None);
    }

    #[test]
    fn parses_names_loosely() {
        assert_eq!("want-all".parse::<StreamingMode>().unwrap(), StreamingMode::WantAll);
        assert_eq!(" EXACT ".parse::<StreamingMode>().unwrap(), StreamingMode::Exact);
        assert!("huge".parse::<StreamingMode>().is_err());
    }

    #[test]
    fn iterator_mode_resolves_by_row_limit() {
        assert_eq!(StreamingMode::Iterator.for_materialize(0), StreamingMode::WantAll);
        assert_eq!(StreamingMode::Iterator.for_materialize(10), StreamingMode::Exact);
        assert_eq!(StreamingMode::Small.for_materialize(10), StreamingMode::Small);
        assert_eq!(StreamingMode::Exact.for_materialize(0), StreamingMode::Exact);
    }
}
