//! Mutation-testing configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque numeric identifier of one mutation-testing variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Mutant(pub u64);

impl fmt::Display for Mutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutant {}", self.0)
    }
}

/// A contiguous run of mutants.
///
/// `end` is exclusive; a range without `end` denotes the single mutant `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// First mutant in the range.
    pub start: u64,
    /// One past the last mutant in the range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl Range {
    /// Half-open range `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range holding exactly one mutant.
    pub fn single(mutant: u64) -> Self {
        Self {
            start: mutant,
            end: None,
        }
    }

    /// Mutants in this range, in ascending order.
    pub fn mutants(&self) -> impl Iterator<Item = Mutant> + use<> {
        let (first, last) = match self.end {
            None => (self.start, self.start),
            Some(end) if end > self.start => (self.start, end - 1),
            // Empty: `1..=0` yields nothing.
            Some(_) => (1, 0),
        };
        (first..=last).map(Mutant)
    }

    /// Number of mutants in this range.
    pub fn len(&self) -> u64 {
        match self.end {
            None => 1,
            Some(end) => end.saturating_sub(self.start),
        }
    }

    /// True if the range holds no mutants.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Automatic mutant selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoConfig {
    /// Seconds each mutant stays selected before rotating; zero disables periodic rotation.
    #[serde(default)]
    pub change_after_secs: u64,
    /// Rotate to the next mutant as soon as the current one is killed.
    #[serde(default)]
    pub change_kill: bool,
}

impl AutoConfig {
    /// Periodic rotation interval, if enabled.
    pub fn change_after(&self) -> Option<Duration> {
        (self.change_after_secs > 0).then(|| Duration::from_secs(self.change_after_secs))
    }
}

/// Mutation-testing configuration attached to a machine and its plans.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Whether plans carrying this configuration are mutation tests.
    #[serde(default)]
    pub enabled: bool,
    /// Mutant ranges, expanded in order.
    #[serde(default)]
    pub ranges: Vec<Range>,
    /// Automatic selection policy.
    #[serde(default)]
    pub auto: AutoConfig,
}

impl Config {
    /// Enable mutation testing.
    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    /// Append a range.
    pub fn with_range(mut self, range: Range) -> Self {
        self.ranges.push(range);
        self
    }

    /// Set the periodic rotation interval in seconds (zero for kill-only rotation).
    pub fn with_change_after_secs(mut self, secs: u64) -> Self {
        self.auto.change_after_secs = secs;
        self
    }

    /// Set whether kills rotate the selected mutant.
    pub fn with_change_kill(mut self, change_kill: bool) -> Self {
        self.auto.change_kill = change_kill;
        self
    }

    /// All configured mutants: ranges expanded in order, duplicates kept.
    pub fn mutants(&self) -> Vec<Mutant> {
        self.ranges.iter().flat_map(Range::mutants).collect()
    }
}
