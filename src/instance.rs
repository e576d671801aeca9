//! Per-machine control loop.
//!
//! An [`Instance`] owns one [`Machine`] for the whole campaign. It keeps at most one cycle task in
//! flight, relaunching immediately after a success and after [`BACKOFF`] after a failure, and
//! applies mutant selections from its mutation automator to the next cycle it launches. Cycle
//! failures never leave the instance; only cancellation and setup or shutdown failures do.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::config::{FilterSet, FuzzerConfig};
use crate::context::{Cancelled, Canceller, Context};
use crate::cycle::{Cycle, CycleError, CycleExecutor};
use crate::env::{BoxError, CycleEnv, StageSet};
use crate::machine::{Machine, MachineId};
use crate::mutation::{Automator, KillObserver, Mutant, MutationError};
use crate::observer::{
    CycleMessage, CycleObserver, Event, Forward, InstanceMessage, Observer, cause_chain,
    observe_all,
};
use crate::plan::Plan;

/// Cooldown between a failed cycle and its relaunch.
pub const BACKOFF: Duration = Duration::from_secs(5);

/// Reasons an instance stops.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The campaign was cancelled or ran out of time.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    /// The machine's saved directories could not be created.
    #[error("failed to prepare saved directories for {machine}")]
    Prepare {
        /// Machine.
        machine: MachineId,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The mutation automator could not be built.
    #[error("failed to start mutation automator")]
    Mutation(#[from] MutationError),
    /// The stage set failed to shut down.
    #[error("failed to close stages")]
    Close(#[source] BoxError),
    /// The mutation automator task panicked.
    #[error("mutation automator panicked")]
    AutomatorPanicked,
}

impl InstanceError {
    /// True if the instance only stopped because its context finished.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, InstanceError::Cancelled(_))
    }
}

struct Running {
    cycle: Cycle,
    task: JoinHandle<Result<Plan, CycleError>>,
}

struct Mutation {
    mutants: Option<mpsc::Receiver<Mutant>>,
    task: JoinHandle<()>,
    cancel: Canceller,
}

/// Control loop for one machine.
pub struct Instance {
    index: usize,
    machine: Machine,
    stages: Arc<dyn StageSet>,
    observers: Vec<Arc<dyn Observer>>,
    fuzzer: Option<Arc<FuzzerConfig>>,
    filters: Arc<FilterSet>,
}

impl Instance {
    /// Instance `index` driving `machine` with `stages`.
    pub fn new(index: usize, machine: Machine, stages: Arc<dyn StageSet>) -> Self {
        Self {
            index,
            machine,
            stages,
            observers: Vec::new(),
            fuzzer: None,
            filters: Arc::default(),
        }
    }

    /// Add an observer for this instance's events.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Add several observers.
    pub fn with_observers(mut self, observers: impl IntoIterator<Item = Arc<dyn Observer>>) -> Self {
        self.observers.extend(observers);
        self
    }

    /// Set fuzzer parameters passed to every cycle.
    pub fn with_fuzzer(mut self, fuzzer: Arc<FuzzerConfig>) -> Self {
        self.fuzzer = Some(fuzzer);
        self
    }

    /// Set benign-failure filters passed to every cycle.
    pub fn with_filters(mut self, filters: Arc<FilterSet>) -> Self {
        self.filters = filters;
        self
    }

    /// Instance index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Machine driven by this instance.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Replace the seed plan copied into every launched cycle.
    pub fn set_initial_plan(&mut self, plan: Plan) {
        self.machine.initial_plan = plan;
    }

    /// Run cycles until `cx` is done or setup fails.
    ///
    /// Always ends by emitting [`InstanceMessage::Closed`], closing the stage set and stopping the
    /// mutation automator. The loop's own error wins over shutdown errors.
    pub async fn run(&mut self, cx: &Context) -> Result<(), InstanceError> {
        info!(machine = %self.machine.id, instance = self.index, "instance starting");
        let mut observers = self.observers.clone();
        let started = self.start_mutation(cx, &mut observers);
        let observers: Arc<[Arc<dyn Observer>]> = observers.into();

        let (result, mutation) = match started {
            Ok(mut mutation) => {
                let mutants = mutation.as_mut().and_then(|m| m.mutants.take());
                (self.run_loop(cx, &observers, mutants).await, mutation)
            }
            Err(err) => (Err(err), None),
        };
        let closed = self.close(observers, mutation).await;

        match &result {
            Err(err) if err.is_cancellation() => {
                info!(machine = %self.machine.id, reason = %err, "instance stopped");
            }
            Err(err) => {
                warn!(machine = %self.machine.id, error = %cause_chain(err), "instance failed");
            }
            Ok(()) => {}
        }
        result.and(closed)
    }

    fn start_mutation(
        &self,
        cx: &Context,
        observers: &mut Vec<Arc<dyn Observer>>,
    ) -> Result<Option<Mutation>, InstanceError> {
        let plan = &self.machine.initial_plan;
        let Some(config) = plan.mutation.as_ref().filter(|_| plan.is_mutation_test()) else {
            return Ok(None);
        };
        let (automator, handles) = Automator::new(config)?;
        info!(
            machine = %self.machine.id,
            mutants = automator.mutants().len(),
            "mutation testing enabled"
        );

        let (cancel, automator_cx) = cx.with_cancel();
        if let Some(kills) = handles.kills {
            observers.push(Arc::new(KillObserver::new(kills, automator_cx.clone())));
        }
        let task = tokio::spawn(async move { automator.run(&automator_cx).await });
        Ok(Some(Mutation {
            mutants: Some(handles.mutants),
            task,
            cancel,
        }))
    }

    async fn run_loop(
        &mut self,
        cx: &Context,
        observers: &Arc<[Arc<dyn Observer>]>,
        mut mutants: Option<mpsc::Receiver<Mutant>>,
    ) -> Result<(), InstanceError> {
        self.machine
            .pathset
            .prepare_saved()
            .await
            .map_err(|source| InstanceError::Prepare {
                machine: self.machine.id.clone(),
                source,
            })?;

        // The automator announces its first mutant straight away; cycle 0 runs under it.
        if mutants.is_some() {
            tokio::select! {
                biased;
                cancelled = cx.done() => return Err(cancelled.into()),
                mutant = recv_mutant(&mut mutants) => match mutant {
                    Some(mutant) => self.change_mutant(observers, mutant).await,
                    None => mutants = None,
                },
            }
        }

        let mut running = Some(self.launch(cx, observers).await);
        let mut backoff: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                biased;
                cancelled = cx.done() => {
                    if let Some(running) = running.take() {
                        debug!(cycle = %running.cycle, "abandoning in-flight cycle");
                        running.task.abort();
                        // Joining guarantees the task is gone before the instance closes.
                        let _ = running.task.await;
                    }
                    return Err(cancelled.into());
                }
                mutant = recv_mutant(&mut mutants) => match mutant {
                    Some(mutant) => self.change_mutant(observers, mutant).await,
                    None => mutants = None,
                },
                result = join_cycle(&mut running) => {
                    let Some(Running { cycle, .. }) = running.take() else {
                        continue;
                    };
                    // A cycle that ends at the deadline may finish before the timer behind
                    // `cx.done()` fires; its outcome is discarded either way.
                    let cancelled = match &result {
                        Err(CycleError::Cancelled(cancelled)) => cx.err().or(Some(*cancelled)),
                        _ => cx.err(),
                    };
                    if let Some(cancelled) = cancelled {
                        debug!(%cycle, reason = %cancelled, "discarding cycle outcome");
                        return Err(cancelled.into());
                    }
                    let result = match result {
                        Ok(plan) => match self.machine.pathset.cleanup_scratch().await {
                            Ok(()) => Ok(plan),
                            Err(err) => Err(CycleError::Cleanup(err)),
                        },
                        Err(err) => Err(err),
                    };
                    match result {
                        Ok(plan) => {
                            info!(%cycle, subjects = plan.corpus.len(), "cycle finished");
                            emit(observers, &cycle, CycleMessage::Finished).await;
                            self.machine.advance_cycle();
                            running = Some(self.launch(cx, observers).await);
                        }
                        Err(err) => {
                            warn!(
                                %cycle,
                                error = %cause_chain(&err),
                                backoff = ?BACKOFF,
                                "cycle failed; backing off"
                            );
                            emit(observers, &cycle, CycleMessage::Errored(Arc::new(err))).await;
                            backoff = Some(Box::pin(tokio::time::sleep(BACKOFF)));
                        }
                    }
                }
                () = wait_backoff(&mut backoff) => {
                    backoff = None;
                    running = Some(self.launch(cx, observers).await);
                }
            }
        }
    }

    async fn launch(&self, cx: &Context, observers: &Arc<[Arc<dyn Observer>]>) -> Running {
        let cycle = self.stamp();
        let observer = CycleObserver::new(cycle.clone(), observers.clone());
        observer.emit(CycleMessage::Started).await;
        debug!(%cycle, mutant = ?self.machine.initial_plan.mutant, "launching cycle");

        let env = CycleEnv {
            cycle: cycle.clone(),
            quantities: self.machine.quantities,
            scratch: self.machine.pathset.scratch.clone(),
            saved: self.machine.pathset.saved.clone(),
            observer,
            fuzzer: self.fuzzer.clone(),
            filters: self.filters.clone(),
        };
        let plan = self.machine.initial_plan.clone();
        let pathset = self.machine.pathset.clone();
        let stages = self.stages.clone();
        let cx = cx.clone();
        let task = tokio::spawn(async move {
            pathset.prepare_scratch().await.map_err(CycleError::Scratch)?;
            let stages = stages.stages(&env).map_err(CycleError::Build)?;
            CycleExecutor::new(env.cycle.clone(), plan, stages)
                .run(&cx)
                .await
        });
        Running { cycle, task }
    }

    async fn change_mutant(&mut self, observers: &Arc<[Arc<dyn Observer>]>, mutant: Mutant) {
        self.machine.set_mutant(mutant);
        info!(machine = %self.machine.id, %mutant, "mutant changed");
        emit(observers, &self.stamp(), InstanceMessage::MutantChanged(mutant)).await;
    }

    async fn close(
        &self,
        observers: Arc<[Arc<dyn Observer>]>,
        mutation: Option<Mutation>,
    ) -> Result<(), InstanceError> {
        emit(&observers, &self.stamp(), InstanceMessage::Closed).await;
        let closed = self.stages.close().await.map_err(InstanceError::Close);
        // Drops the kill input held by the kill observer, which lets the automator finish.
        drop(observers);

        let stopped = match mutation {
            Some(mutation) => {
                mutation.cancel.cancel();
                drop(mutation.mutants);
                mutation
                    .task
                    .await
                    .map_err(|_| InstanceError::AutomatorPanicked)
            }
            None => Ok(()),
        };
        debug!(machine = %self.machine.id, "instance closed");
        closed.and(stopped)
    }

    fn stamp(&self) -> Cycle {
        Cycle::new(self.index, self.machine.id.clone(), self.machine.cycle())
    }
}

async fn emit(observers: &[Arc<dyn Observer>], cycle: &Cycle, event: impl Into<Event>) {
    observe_all(observers, &Forward::new(cycle.clone(), event.into())).await;
}

async fn recv_mutant(mutants: &mut Option<mpsc::Receiver<Mutant>>) -> Option<Mutant> {
    match mutants {
        Some(mutants) => mutants.recv().await,
        None => future::pending().await,
    }
}

async fn join_cycle(running: &mut Option<Running>) -> Result<Plan, CycleError> {
    match running {
        Some(running) => match (&mut running.task).await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        },
        None => future::pending().await,
    }
}

async fn wait_backoff(backoff: &mut Option<Pin<Box<Sleep>>>) {
    match backoff {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use tempfile::tempdir;

    use super::*;
    use crate::cycle::StageKind;
    use crate::env::{Stage, Stages};
    use crate::machine::{MachineConfig, Pathset, QuantitySet};
    use crate::observer::Kind;

    struct Pass(StageKind);

    impl Stage for Pass {
        fn kind(&self) -> StageKind {
            self.0
        }

        fn run<'a>(&'a self, _cx: &'a Context, plan: Plan) -> BoxFuture<'a, Result<Plan, BoxError>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(plan)
            })
        }
    }

    struct PassSet {
        closed: Arc<Mutex<bool>>,
    }

    impl StageSet for PassSet {
        fn stages(&self, _env: &CycleEnv) -> Result<Stages, BoxError> {
            Ok(Stages {
                perturb: Box::new(Pass(StageKind::Perturb)),
                fuzz: Box::new(Pass(StageKind::Fuzz)),
                lift: Box::new(Pass(StageKind::Lift)),
                invoke: Box::new(Pass(StageKind::Invoke)),
                analyse: Box::new(Pass(StageKind::Analyse)),
            })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move {
                *self.closed.lock().expect("closed lock") = true;
                Ok(())
            })
        }
    }

    struct Kinds(Mutex<Vec<Kind>>);

    impl Observer for Kinds {
        fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.0.lock().expect("kinds lock").push(message.kind());
            })
        }
    }

    fn machine(out: &Path) -> Machine {
        let id = MachineId::from("localhost");
        let pathset = Pathset::new(out, &id);
        Machine::new(id, MachineConfig::default(), pathset, QuantitySet::default())
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancellation_closes_stages_and_emits_closed_last() {
        let tmp = tempdir().expect("tempdir should be created");
        let closed = Arc::new(Mutex::new(false));
        let kinds = Arc::new(Kinds(Mutex::new(Vec::new())));
        let mut instance = Instance::new(
            0,
            machine(tmp.path()),
            Arc::new(PassSet {
                closed: closed.clone(),
            }),
        )
        .with_observer(kinds.clone());

        let cx = Context::background().with_timeout(Duration::from_secs(1));
        let err = instance.run(&cx).await.expect_err("deadline should stop the instance");
        assert!(err.is_cancellation());
        assert!(*closed.lock().expect("closed lock"));
        assert!(instance.machine().cycle() > 0);
        let kinds = kinds.0.lock().expect("kinds lock");
        assert_eq!(kinds.last(), Some(&Kind::Instance));
        assert!(tmp.path().join("localhost").join("saved").join("flagged").is_dir());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn empty_mutant_set_fails_setup_but_still_closes() {
        let tmp = tempdir().expect("tempdir should be created");
        let closed = Arc::new(Mutex::new(false));
        let kinds = Arc::new(Kinds(Mutex::new(Vec::new())));
        let mut instance = Instance::new(
            0,
            machine(tmp.path()),
            Arc::new(PassSet {
                closed: closed.clone(),
            }),
        )
        .with_observer(kinds.clone());
        let mut plan = Plan::default();
        plan.mutation = Some(crate::mutation::Config::default().enabled());
        instance.set_initial_plan(plan);

        let err = instance
            .run(&Context::background())
            .await
            .expect_err("no mutants should fail");
        assert!(matches!(err, InstanceError::Mutation(MutationError::NoMutants)));
        assert!(*closed.lock().expect("closed lock"));
        assert_eq!(*kinds.0.lock().expect("kinds lock"), vec![Kind::Instance]);
    }
}
