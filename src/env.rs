//! Collaborators a campaign is built from: stage runners, per-machine stage sets and the planner.

use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::config::{FilterSet, FuzzerConfig};
use crate::context::Context;
use crate::cycle::{Cycle, StageKind, now_timestamp_ms};
use crate::machine::{Machine, MachineConfig, MachineId, QuantitySet, SavedPaths, ScratchPaths};
use crate::observer::CycleObserver;
use crate::plan::{Metadata, Plan, Subject};

/// Opaque collaborator failure.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// One pipeline stage: takes a plan and returns the transformed plan.
pub trait Stage: Send + Sync {
    /// Which stage this is.
    fn kind(&self) -> StageKind;

    /// Transform `plan`.
    fn run<'a>(&'a self, cx: &'a Context, plan: Plan) -> BoxFuture<'a, Result<Plan, BoxError>>;
}

/// The five stages of one cycle.
pub struct Stages {
    /// Perturb stage.
    pub perturb: Box<dyn Stage>,
    /// Fuzz stage.
    pub fuzz: Box<dyn Stage>,
    /// Lift stage.
    pub lift: Box<dyn Stage>,
    /// Invoke stage.
    pub invoke: Box<dyn Stage>,
    /// Analyse stage.
    pub analyse: Box<dyn Stage>,
}

impl Stages {
    /// Stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Stage> {
        let ordered: [&dyn Stage; 5] = [
            &*self.perturb,
            &*self.fuzz,
            &*self.lift,
            &*self.invoke,
            &*self.analyse,
        ];
        ordered.into_iter()
    }
}

/// Everything a stage set needs to know to build the stages of one cycle.
#[derive(Debug, Clone)]
pub struct CycleEnv {
    /// Cycle being launched.
    pub cycle: Cycle,
    /// Effective quantities of the machine.
    pub quantities: QuantitySet,
    /// Scratch directories, already created.
    pub scratch: ScratchPaths,
    /// Saved directories.
    pub saved: SavedPaths,
    /// Observer stamped with this cycle.
    pub observer: CycleObserver,
    /// Fuzzer parameters, if configured.
    pub fuzzer: Option<Arc<FuzzerConfig>>,
    /// Known-benign failure filters.
    pub filters: Arc<FilterSet>,
}

/// Stage runners bound to one machine, owned by that machine's instance.
pub trait StageSet: Send + Sync {
    /// Build the stages for one cycle.
    fn stages(&self, env: &CycleEnv) -> Result<Stages, BoxError>;

    /// Release resources that need explicit shutdown. Called once, when the instance closes.
    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Campaign-wide source of per-machine stage sets.
pub trait StageFactory: Send + Sync {
    /// Stage set for `machine`.
    fn for_machine(&self, machine: &Machine) -> Result<Arc<dyn StageSet>, BoxError>;
}

/// Resolves one initial plan per machine. Invoked once per campaign.
pub trait Planner: Send + Sync {
    /// Plan every machine in `machines` over `inputs`.
    fn plan<'a>(
        &'a self,
        cx: &'a Context,
        machines: &'a BTreeMap<MachineId, MachineConfig>,
        inputs: &'a [PathBuf],
    ) -> BoxFuture<'a, Result<BTreeMap<MachineId, Plan>, BoxError>>;
}

/// Environment errors.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A required collaborator was not supplied.
    #[error("environment has no {0}")]
    Missing(&'static str),
}

/// Collaborators required to run a campaign.
#[derive(Clone, Default)]
pub struct Environment {
    /// Plan resolver.
    pub planner: Option<Arc<dyn Planner>>,
    /// Stage set factory.
    pub stages: Option<Arc<dyn StageFactory>>,
}

impl Environment {
    /// Environment with every collaborator present.
    pub fn new(planner: impl Planner + 'static, stages: impl StageFactory + 'static) -> Self {
        Self {
            planner: Some(Arc::new(planner)),
            stages: Some(Arc::new(stages)),
        }
    }

    /// Fail with the first missing collaborator.
    pub fn check(&self) -> Result<(), EnvError> {
        self.resolve().map(drop)
    }

    /// The planner and stage factory, or the first missing one.
    pub fn resolve(&self) -> Result<(Arc<dyn Planner>, Arc<dyn StageFactory>), EnvError> {
        let planner = self.planner.clone().ok_or(EnvError::Missing("planner"))?;
        let stages = self.stages.clone().ok_or(EnvError::Missing("stage factory"))?;
        Ok((planner, stages))
    }
}

/// Planner errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// An input file is missing or unreadable.
    #[error("cannot read input {path}")]
    Input {
        /// Offending input.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// Two inputs map to the same subject name.
    #[error("inputs {first} and {second} both map to subject {name:?}")]
    DuplicateSubject {
        /// Subject name.
        name: String,
        /// First input.
        first: PathBuf,
        /// Second input.
        second: PathBuf,
    },
}

/// Builds one plan per machine: one subject per input file, the machine's compilers and its
/// mutation configuration.
#[derive(Debug, Clone, Default)]
pub struct CorpusPlanner {
    seed: Option<i64>,
}

impl CorpusPlanner {
    /// Use a fixed seed instead of the launch timestamp.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    async fn corpus(inputs: &[PathBuf]) -> Result<BTreeMap<String, Subject>, PlanError> {
        let mut corpus: BTreeMap<String, Subject> = BTreeMap::new();
        for path in inputs {
            tokio::fs::metadata(path)
                .await
                .map_err(|source| PlanError::Input {
                    path: path.clone(),
                    source,
                })?;
            let name = subject_name(path);
            if let Some(existing) = corpus.get(&name) {
                return Err(PlanError::DuplicateSubject {
                    name,
                    first: existing.source.clone(),
                    second: path.clone(),
                });
            }
            corpus.insert(
                name,
                Subject {
                    source: path.clone(),
                    compilations: BTreeMap::new(),
                },
            );
        }
        Ok(corpus)
    }
}

fn subject_name(path: &Path) -> String {
    path.file_stem()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

impl Planner for CorpusPlanner {
    fn plan<'a>(
        &'a self,
        _cx: &'a Context,
        machines: &'a BTreeMap<MachineId, MachineConfig>,
        inputs: &'a [PathBuf],
    ) -> BoxFuture<'a, Result<BTreeMap<MachineId, Plan>, BoxError>> {
        Box::pin(async move {
            let corpus = Self::corpus(inputs).await?;
            let seed = self.seed.unwrap_or_else(now_timestamp_ms);
            debug!(subjects = corpus.len(), seed, "corpus planned");
            let plans = machines
                .iter()
                .map(|(id, config)| {
                    let plan = Plan {
                        metadata: Metadata {
                            seed,
                            ..Metadata::default()
                        },
                        compilers: config.compilers.clone(),
                        corpus: corpus.clone(),
                        mutation: config.mutation.clone(),
                        mutant: None,
                    };
                    (id.clone(), plan)
                })
                .collect();
            Ok(plans)
        })
    }
}
