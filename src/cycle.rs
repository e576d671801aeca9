//! Cycles: the identity of one attempt at one machine, and the executor that runs its stages.

use std::fmt;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::debug;

use crate::context::{Cancelled, Context};
use crate::env::{BoxError, Stages};
use crate::machine::MachineId;
use crate::plan::Plan;

/// Current Unix timestamp in milliseconds; zero if the clock is before the epoch.
pub fn now_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

/// Pipeline stage, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Sample and shuffle the corpus.
    Perturb,
    /// Generate fuzzed variants of each subject.
    Fuzz,
    /// Lift subjects into compilable harnesses.
    Lift,
    /// Compile and run harnesses on the machine.
    Invoke,
    /// Classify outcomes and analyse mutants.
    Analyse,
}

impl StageKind {
    /// Every stage, in the order a cycle runs them.
    pub const ALL: [StageKind; 5] = [
        StageKind::Perturb,
        StageKind::Fuzz,
        StageKind::Lift,
        StageKind::Invoke,
        StageKind::Analyse,
    ];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Perturb => "perturb",
            StageKind::Fuzz => "fuzz",
            StageKind::Lift => "lift",
            StageKind::Invoke => "invoke",
            StageKind::Analyse => "analyse",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt at one machine. A new value is made for every launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Index of the owning instance.
    pub instance: usize,
    /// Machine under test.
    pub machine_id: MachineId,
    /// Iteration number: the machine's successful-cycle count at launch.
    pub iter: u64,
    /// Unix timestamp millis at launch.
    pub start_time_ms: i64,
}

impl Cycle {
    /// Cycle starting now.
    pub fn new(instance: usize, machine_id: MachineId, iter: u64) -> Self {
        Self {
            instance,
            machine_id,
            iter,
            start_time_ms: now_timestamp_ms(),
        }
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} (iter {})",
            self.machine_id, self.instance, self.iter
        )
    }
}

/// Failures of a single cycle. All of them are retried by the owning instance.
#[derive(Debug, Error)]
pub enum CycleError {
    /// A stage returned an error; later stages did not run.
    #[error("{stage} stage failed")]
    Stage {
        /// Failing stage.
        stage: StageKind,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },
    /// The stage set could not build this cycle's stages.
    #[error("failed to build stages")]
    Build(#[source] BoxError),
    /// Scratch directories could not be created.
    #[error("failed to prepare scratch directories")]
    Scratch(#[source] io::Error),
    /// Scratch directories could not be removed after a successful run.
    #[error("failed to clean up scratch directories")]
    Cleanup(#[source] io::Error),
    /// The cycle was cancelled between stages.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    /// The cycle task panicked.
    #[error("cycle task panicked")]
    Panicked,
}

impl From<JoinError> for CycleError {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            CycleError::Cancelled(Cancelled::Cancelled)
        } else {
            CycleError::Panicked
        }
    }
}

/// Runs the fixed stage chain once over one plan copy.
pub struct CycleExecutor {
    cycle: Cycle,
    plan: Plan,
    stages: Stages,
}

impl CycleExecutor {
    /// Executor for `cycle`, owning its copy of the plan.
    pub fn new(cycle: Cycle, plan: Plan, stages: Stages) -> Self {
        Self {
            cycle,
            plan,
            stages,
        }
    }

    /// Cycle being executed.
    pub fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    /// Run every stage in order, threading the plan through; the first failure aborts the rest.
    pub async fn run(self, cx: &Context) -> Result<Plan, CycleError> {
        let mut plan = self.plan;
        for stage in self.stages.iter() {
            if let Some(cancelled) = cx.err() {
                return Err(cancelled.into());
            }
            let kind = stage.kind();
            debug!(cycle = %self.cycle, stage = %kind, "running stage");
            plan = stage
                .run(cx, plan)
                .await
                .map_err(|source| CycleError::Stage {
                    stage: kind,
                    source,
                })?;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;

    use super::*;
    use crate::env::Stage;
    use crate::observer::cause_chain;

    struct Step {
        kind: StageKind,
        fail: bool,
        seen: Arc<Mutex<Vec<StageKind>>>,
    }

    impl Stage for Step {
        fn kind(&self) -> StageKind {
            self.kind
        }

        fn run<'a>(&'a self, _cx: &'a Context, mut plan: Plan) -> BoxFuture<'a, Result<Plan, BoxError>> {
            Box::pin(async move {
                self.seen.lock().expect("seen lock").push(self.kind);
                if self.fail {
                    return Err("compiler exploded".into());
                }
                plan.record_stage(self.kind, 1);
                Ok(plan)
            })
        }
    }

    fn stages(failing: Option<StageKind>, seen: &Arc<Mutex<Vec<StageKind>>>) -> Stages {
        let step = |kind: StageKind| -> Box<dyn Stage> {
            Box::new(Step {
                kind,
                fail: failing == Some(kind),
                seen: seen.clone(),
            })
        };
        Stages {
            perturb: step(StageKind::Perturb),
            fuzz: step(StageKind::Fuzz),
            lift: step(StageKind::Lift),
            invoke: step(StageKind::Invoke),
            analyse: step(StageKind::Analyse),
        }
    }

    fn cycle() -> Cycle {
        Cycle::new(2, MachineId::from("localhost"), 7)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stages_run_in_fixed_order_threading_the_plan() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = CycleExecutor::new(cycle(), Plan::default(), stages(None, &seen));
        let plan = executor
            .run(&Context::background())
            .await
            .expect("cycle should succeed");

        let recorded: Vec<StageKind> = plan.metadata.stages.iter().map(|r| r.stage).collect();
        assert_eq!(recorded, StageKind::ALL.to_vec());
        assert_eq!(*seen.lock().expect("seen lock"), StageKind::ALL.to_vec());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn first_failure_aborts_and_names_the_stage() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = CycleExecutor::new(
            cycle(),
            Plan::default(),
            stages(Some(StageKind::Lift), &seen),
        );
        let err = executor
            .run(&Context::background())
            .await
            .expect_err("lift should fail the cycle");

        assert!(matches!(
            err,
            CycleError::Stage {
                stage: StageKind::Lift,
                ..
            }
        ));
        assert_eq!(cause_chain(&err), "lift stage failed: compiler exploded");
        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![StageKind::Perturb, StageKind::Fuzz, StageKind::Lift]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_context_stops_before_the_next_stage() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (cancel, cx) = Context::background().with_cancel();
        cancel.cancel();
        let err = CycleExecutor::new(cycle(), Plan::default(), stages(None, &seen))
            .run(&cx)
            .await
            .expect_err("cancelled cycle should not run");
        assert!(matches!(err, CycleError::Cancelled(Cancelled::Cancelled)));
        assert!(seen.lock().expect("seen lock").is_empty());
    }

    #[test]
    fn cycle_display_names_machine_instance_and_iteration() {
        assert_eq!(cycle().to_string(), "localhost #2 (iter 7)");
        let json = serde_json::to_string(&StageKind::ALL).expect("kinds should serialize");
        assert_eq!(json, r#"["perturb","fuzz","lift","invoke","analyse"]"#);
    }
}
