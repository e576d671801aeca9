//! Machines: identifiers, per-machine configuration, quantities and output paths.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::mutation::{Config as MutationConfig, Mutant};
use crate::plan::{CompilerConfig, Plan, Status};

/// Identifier of a target machine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier made safe for use as a single path component.
    pub fn dir_name(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MachineId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Quantities for the perturb stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbQuantities {
    /// Target corpus size after sampling; zero keeps everything.
    pub corpus_size: usize,
}

/// Quantities for the fuzz stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzQuantities {
    /// Target corpus size after fuzzing.
    pub corpus_size: usize,
    /// Fuzzed variants generated per subject.
    pub subject_cycles: usize,
    /// Parallel fuzzer workers.
    pub workers: usize,
}

/// Quantities for compiling and running on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachQuantities {
    /// Per-compilation timeout in seconds.
    pub compile_timeout_secs: u64,
    /// Per-run timeout in seconds.
    pub run_timeout_secs: u64,
    /// Parallel compile/run workers.
    pub workers: usize,
}

/// All stage quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantitySet {
    /// Perturb stage quantities.
    pub perturb: PerturbQuantities,
    /// Fuzz stage quantities.
    pub fuzz: FuzzQuantities,
    /// Machine compile/run quantities.
    pub mach: MachQuantities,
}

fn override_nonzero<T: Copy + Default + PartialEq>(into: &mut T, from: T) {
    if from != T::default() {
        *into = from;
    }
}

impl QuantitySet {
    /// Replace every field with the corresponding non-zero field of `other`.
    pub fn override_with(&mut self, other: &QuantitySet) {
        override_nonzero(&mut self.perturb.corpus_size, other.perturb.corpus_size);
        override_nonzero(&mut self.fuzz.corpus_size, other.fuzz.corpus_size);
        override_nonzero(&mut self.fuzz.subject_cycles, other.fuzz.subject_cycles);
        override_nonzero(&mut self.fuzz.workers, other.fuzz.workers);
        override_nonzero(
            &mut self.mach.compile_timeout_secs,
            other.mach.compile_timeout_secs,
        );
        override_nonzero(&mut self.mach.run_timeout_secs, other.mach.run_timeout_secs);
        override_nonzero(&mut self.mach.workers, other.mach.workers);
    }
}

/// Configuration of one target machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Compilers available on the machine, keyed by name.
    #[serde(default)]
    pub compilers: BTreeMap<String, CompilerConfig>,
    /// Quantity overrides for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantities: Option<QuantitySet>,
    /// Mutation-testing configuration for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<MutationConfig>,
}

impl MachineConfig {
    /// Add a compiler.
    pub fn with_compiler(mut self, name: impl Into<String>, config: CompilerConfig) -> Self {
        self.compilers.insert(name.into(), config);
        self
    }

    /// Set quantity overrides.
    pub fn with_quantities(mut self, quantities: QuantitySet) -> Self {
        self.quantities = Some(quantities);
        self
    }

    /// Set the mutation-testing configuration.
    pub fn with_mutation(mut self, mutation: MutationConfig) -> Self {
        self.mutation = Some(mutation);
        self
    }
}

/// Per-cycle scratch directories, removed after each successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchPaths {
    /// Scratch root.
    pub root: PathBuf,
    /// Fuzzer output.
    pub fuzz: PathBuf,
    /// Lifter output.
    pub lift: PathBuf,
    /// Compile and run output.
    pub run: PathBuf,
}

impl ScratchPaths {
    fn new(root: PathBuf) -> Self {
        Self {
            fuzz: root.join("fuzz"),
            lift: root.join("lift"),
            run: root.join("run"),
            root,
        }
    }

    /// Stage directories inside the scratch root.
    pub fn dirs(&self) -> [&Path; 3] {
        [&self.fuzz, &self.lift, &self.run]
    }
}

/// Directories that keep interesting subjects across cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPaths {
    /// Saved root.
    pub root: PathBuf,
}

impl SavedPaths {
    /// Directory holding subjects saved with `status`.
    pub fn status_dir(&self, status: Status) -> PathBuf {
        self.root.join(status.as_str())
    }
}

/// Output directories for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pathset {
    /// Machine output root.
    pub root: PathBuf,
    /// Scratch directories.
    pub scratch: ScratchPaths,
    /// Saved directories.
    pub saved: SavedPaths,
}

impl Pathset {
    /// Paths for machine `id` under `out_dir`.
    pub fn new(out_dir: &Path, id: &MachineId) -> Self {
        let root = out_dir.join(id.dir_name());
        Self {
            scratch: ScratchPaths::new(root.join("scratch")),
            saved: SavedPaths {
                root: root.join("saved"),
            },
            root,
        }
    }

    /// Create the scratch directories.
    pub async fn prepare_scratch(&self) -> io::Result<()> {
        for dir in self.scratch.dirs() {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Create one saved directory per saved status.
    pub async fn prepare_saved(&self) -> io::Result<()> {
        for status in Status::ALL.into_iter().filter(|s| s.is_saved()) {
            tokio::fs::create_dir_all(self.saved.status_dir(status)).await?;
        }
        Ok(())
    }

    /// Remove the scratch directories. Saved directories are never touched.
    pub async fn cleanup_scratch(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.scratch.root).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// One target machine's execution state.
///
/// Mutable fields are written only by the owning instance's loop.
#[derive(Debug, Clone)]
pub struct Machine {
    /// Machine identifier.
    pub id: MachineId,
    /// Seed plan copied into every cycle at launch.
    pub initial_plan: Plan,
    /// Output paths.
    pub pathset: Pathset,
    /// Effective quantities (global set overridden by the machine's own).
    pub quantities: QuantitySet,
    /// Machine configuration.
    pub config: MachineConfig,
    cycle: u64,
}

impl Machine {
    /// Machine with an empty initial plan; the director fills the plan in once planning is done.
    pub fn new(
        id: MachineId,
        config: MachineConfig,
        pathset: Pathset,
        global_quantities: QuantitySet,
    ) -> Self {
        let mut quantities = global_quantities;
        if let Some(overrides) = &config.quantities {
            quantities.override_with(overrides);
        }
        Self {
            id,
            initial_plan: Plan::default(),
            pathset,
            quantities,
            config,
            cycle: 0,
        }
    }

    /// Number of successful cycles so far; also the iteration number of the next cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Count one successful cycle.
    pub fn advance_cycle(&mut self) {
        self.cycle += 1;
    }

    /// Select `mutant` for every cycle launched from now on.
    pub fn set_mutant(&mut self, mutant: Mutant) {
        self.initial_plan.set_mutant(mutant);
    }
}
