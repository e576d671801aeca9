//! Plan model: the corpus and compiler snapshot a cycle operates on.
//!
//! Every cycle works on its own copy of a machine's initial plan, so the types here are plain
//! owned values with no interior sharing.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cycle::{StageKind, now_timestamp_ms};
use crate::mutation::{Config as MutationConfig, Mutant};

/// Outcome classification of one compilation of one subject.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not yet compiled or run, or ran without incident.
    #[default]
    Ok,
    /// A known-benign failure, suppressed by a filter.
    Filtered,
    /// Ran and produced an observation worth flagging.
    Flagged,
    /// Compiler failed.
    CompileFail,
    /// Compiler timed out.
    CompileTimeout,
    /// Compiled binary failed at run time.
    RunFail,
    /// Compiled binary timed out.
    RunTimeout,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Status; 7] = [
        Status::Ok,
        Status::Filtered,
        Status::Flagged,
        Status::CompileFail,
        Status::CompileTimeout,
        Status::RunFail,
        Status::RunTimeout,
    ];

    /// True for the outcome that counts towards a mutant kill.
    pub fn is_flagged(self) -> bool {
        self == Status::Flagged
    }

    /// True for statuses whose subjects are saved for postmortem inspection.
    pub fn is_saved(self) -> bool {
        !matches!(self, Status::Ok | Status::Filtered)
    }

    /// Stable lowercase name, used for directory and report keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Filtered => "filtered",
            Status::Flagged => "flagged",
            Status::CompileFail => "compile_fail",
            Status::CompileTimeout => "compile_timeout",
            Status::RunFail => "run_fail",
            Status::RunTimeout => "run_timeout",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiler configuration as resolved for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Compiler style (for example `gcc` or `clang`).
    pub style: String,
    /// Target architecture.
    pub arch: String,
    /// Selected optimisation level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt: Option<String>,
    /// Selected machine-specific optimisation profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mopt: Option<String>,
}

/// Mutant selected during one compilation, and how often its mutation site was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantSelection {
    /// Mutant active when compiling.
    pub mutant: Mutant,
    /// Number of times the mutation site was hit at run time.
    pub hits: u64,
}

/// Result of compiling and running a subject with one compiler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Compilation {
    /// Outcome classification.
    #[serde(default)]
    pub status: Status,
    /// Mutant selection, if the compiler was mutated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutant: Option<MutantSelection>,
}

/// One test case in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Subject {
    /// Source file of the test case.
    pub source: PathBuf,
    /// Compilations keyed by compiler name.
    #[serde(default)]
    pub compilations: BTreeMap<String, Compilation>,
}

/// Completion record appended by each stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage that completed.
    pub stage: StageKind,
    /// Unix timestamp millis at completion.
    pub completed_ms: i64,
    /// Runtime in milliseconds.
    pub duration_ms: u64,
}

/// Plan metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Seed used by randomised stages.
    pub seed: i64,
    /// Unix timestamp millis at creation.
    pub created_ms: i64,
    /// Stages that have completed over this plan, in order.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            seed: 0,
            created_ms: now_timestamp_ms(),
            stages: Vec::new(),
        }
    }
}

/// Corpus and compiler snapshot operated on by a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Plan metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Compilers keyed by name.
    #[serde(default)]
    pub compilers: BTreeMap<String, CompilerConfig>,
    /// Test cases keyed by name.
    #[serde(default)]
    pub corpus: BTreeMap<String, Subject>,
    /// Mutation-testing configuration, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<MutationConfig>,
    /// Currently selected mutant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutant: Option<Mutant>,
}

impl Plan {
    /// True if this plan carries an enabled mutation-testing configuration.
    pub fn is_mutation_test(&self) -> bool {
        self.mutation.as_ref().is_some_and(|m| m.enabled)
    }

    /// Overwrite the selected mutant.
    pub fn set_mutant(&mut self, mutant: Mutant) {
        self.mutant = Some(mutant);
    }

    /// Append a stage completion record.
    pub fn record_stage(&mut self, stage: StageKind, duration_ms: u64) {
        self.metadata.stages.push(StageRecord {
            stage,
            completed_ms: now_timestamp_ms(),
            duration_ms,
        });
    }

    /// Subject names grouped by the status of each of their compilations.
    pub fn subjects_by_status(&self) -> BTreeMap<Status, Vec<String>> {
        let mut by_status: BTreeMap<Status, Vec<String>> = BTreeMap::new();
        for (name, subject) in &self.corpus {
            for compilation in subject.compilations.values() {
                let names = by_status.entry(compilation.status).or_default();
                if names.last() != Some(name) {
                    names.push(name.clone());
                }
            }
        }
        by_status
    }
}
