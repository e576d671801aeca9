//! Per-cycle analysis of a plan, including mutant kill detection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::Mutant;
use crate::plan::{Plan, Status};

/// One compilation that selected a mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    /// Subject compiled.
    pub subject: String,
    /// Compiler that selected the mutant.
    pub compiler: String,
    /// Number of times the mutation site was hit.
    pub hits: u64,
    /// Outcome of the compilation.
    pub status: Status,
    /// Whether this selection killed the mutant.
    pub killed: bool,
}

impl SelectionRecord {
    /// A selection kills its mutant when the mutation site was hit and the outcome was flagged.
    pub fn is_kill(hits: u64, status: Status) -> bool {
        hits > 0 && status.is_flagged()
    }
}

/// Every selection of every mutant seen in one plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutantAnalysis {
    /// Selection records keyed by mutant.
    pub selections: BTreeMap<Mutant, Vec<SelectionRecord>>,
}

impl MutantAnalysis {
    /// Register one selection of `mutant`.
    pub fn register(
        &mut self,
        mutant: Mutant,
        subject: impl Into<String>,
        compiler: impl Into<String>,
        hits: u64,
        status: Status,
    ) {
        self.selections
            .entry(mutant)
            .or_default()
            .push(SelectionRecord {
                subject: subject.into(),
                compiler: compiler.into(),
                hits,
                status,
                killed: SelectionRecord::is_kill(hits, status),
            });
    }

    /// True if at least one selection of any mutant was a kill.
    pub fn has_kills(&self) -> bool {
        self.selections.values().flatten().any(|record| record.killed)
    }

    /// Mutants with at least one killing selection, ascending.
    pub fn killed_mutants(&self) -> Vec<Mutant> {
        self.selections
            .iter()
            .filter(|(_, records)| records.iter().any(|record| record.killed))
            .map(|(mutant, _)| *mutant)
            .collect()
    }

    /// True if no mutant was selected.
    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }
}

/// Analysis of one cycle's final plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Analysis {
    /// Subject names grouped by compilation status.
    pub by_status: BTreeMap<Status, Vec<String>>,
    /// Mutation-testing analysis.
    pub mutation: MutantAnalysis,
}

impl Analysis {
    /// Analyse a plan.
    pub fn of(plan: &Plan) -> Self {
        let mut mutation = MutantAnalysis::default();
        for (subject, entry) in &plan.corpus {
            for (compiler, compilation) in &entry.compilations {
                if let Some(selection) = compilation.mutant {
                    mutation.register(
                        selection.mutant,
                        subject.as_str(),
                        compiler.as_str(),
                        selection.hits,
                        compilation.status,
                    );
                }
            }
        }
        Self {
            by_status: plan.subjects_by_status(),
            mutation,
        }
    }

    /// Number of subjects with at least one flagged compilation.
    pub fn flagged(&self) -> usize {
        self.by_status.get(&Status::Flagged).map_or(0, Vec::len)
    }
}
