//! Campaign statistics, persisted as a JSON file rewritten after every cycle outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::cycle::Cycle;
use crate::machine::MachineId;
use crate::mutation::{Analysis, Mutant};
use crate::observer::{CycleMessage, Handler, InstanceMessage, cause_chain};

/// Stats file errors.
#[derive(Debug, Error)]
pub enum StatsError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed stats file.
    #[error("invalid stats json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Counters for one mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutantStats {
    /// Compilations that selected the mutant.
    pub selections: u64,
    /// Total hits of the mutation site.
    pub hits: u64,
    /// Selections that killed the mutant.
    pub kills: u64,
}

/// Counters for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineStats {
    /// Cycles launched.
    pub started: u64,
    /// Cycles finished successfully.
    pub finished: u64,
    /// Cycles that failed.
    pub errored: u64,
    /// Cause chain of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Subjects flagged across all analysed cycles.
    pub flagged: u64,
    /// Mutant currently selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutant: Option<Mutant>,
    /// Per-mutant counters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mutants: BTreeMap<Mutant, MutantStats>,
    /// True once the machine's instance has closed.
    pub closed: bool,
}

/// Statistics for every machine in a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    /// Per-machine counters.
    pub machines: BTreeMap<MachineId, MachineStats>,
}

impl CampaignStats {
    /// Read a stats file written by [`StatsPersister`].
    pub fn load(path: &Path) -> Result<Self, StatsError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn machine(&mut self, cycle: &Cycle) -> &mut MachineStats {
        self.machines.entry(cycle.machine_id.clone()).or_default()
    }
}

/// [`Handler`] that keeps [`CampaignStats`] and rewrites them to a file after each change.
#[derive(Debug)]
pub struct StatsPersister {
    path: PathBuf,
    stats: CampaignStats,
}

impl StatsPersister {
    /// Persist to `path`, replacing its contents on every write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stats: CampaignStats::default(),
        }
    }

    /// Statistics so far.
    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    fn persist(&self) {
        let written = serde_json::to_vec_pretty(&self.stats)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "failed to write stats");
        }
    }
}

impl Handler for StatsPersister {
    fn on_cycle(&mut self, cycle: &Cycle, message: &CycleMessage) {
        let machine = self.stats.machine(cycle);
        match message {
            CycleMessage::Started => machine.started += 1,
            CycleMessage::Finished => machine.finished += 1,
            CycleMessage::Errored(err) => {
                machine.errored += 1;
                machine.last_error = Some(cause_chain(err.as_ref()));
            }
        }
        if !matches!(message, CycleMessage::Started) {
            self.persist();
        }
    }

    fn on_instance(&mut self, cycle: &Cycle, message: &InstanceMessage) {
        let machine = self.stats.machine(cycle);
        match message {
            InstanceMessage::Closed => machine.closed = true,
            InstanceMessage::MutantChanged(mutant) => machine.mutant = Some(*mutant),
        }
        self.persist();
    }

    fn on_analysis(&mut self, cycle: &Cycle, analysis: &Analysis) {
        let machine = self.stats.machine(cycle);
        machine.flagged += analysis.flagged() as u64;
        for (mutant, records) in &analysis.mutation.selections {
            let stats = machine.mutants.entry(*mutant).or_default();
            for record in records {
                stats.selections += 1;
                stats.hits += record.hits;
                stats.kills += u64::from(record.killed);
            }
        }
        self.persist();
    }
}
