//! Campaign director: builds one instance per machine, plans them, and runs them as a group.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{FilterSet, FuzzerConfig};
use crate::context::{Cancelled, Context};
use crate::env::{BoxError, Environment, EnvError, Planner};
use crate::instance::{Instance, InstanceError};
use crate::machine::{Machine, MachineConfig, MachineId, Pathset, QuantitySet};
use crate::observer::{
    DirectorObserver, MachineRecord, Observer, PrepareMessage, Progress, cause_chain,
};

/// Director errors. Everything except cancellation is fatal to the campaign.
#[derive(Debug, Error)]
pub enum DirectorError {
    /// No machines were configured.
    #[error("no machines configured")]
    NoMachines,
    /// No input files were given.
    #[error("no input files given")]
    NoInputs,
    /// No output directory was configured.
    #[error("no output directory configured")]
    NoOutDir,
    /// The global timeout is zero.
    #[error("global timeout must be positive")]
    ZeroTimeout,
    /// A required collaborator is missing.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// The stage factory rejected a machine.
    #[error("cannot build stages for {machine}")]
    Stages {
        /// Machine.
        machine: MachineId,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },
    /// Planning failed.
    #[error("planning failed")]
    Plan(#[source] BoxError),
    /// The planner returned no plan for a machine.
    #[error("planner returned no plan for {0}")]
    MissingPlan(MachineId),
    /// An instance stopped with an error.
    #[error("instance for {machine} stopped")]
    Instance {
        /// Machine.
        machine: MachineId,
        /// Underlying failure.
        #[source]
        source: InstanceError,
    },
    /// An instance task panicked.
    #[error("instance for {0} panicked")]
    Panicked(MachineId),
    /// Cancelled before instances started.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl DirectorError {
    /// True if the campaign merely stopped because of its deadline or an external cancel.
    pub fn is_cancellation(&self) -> bool {
        match self {
            DirectorError::Cancelled(_) => true,
            DirectorError::Instance { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

type InstanceObservers = Box<dyn FnMut(usize, &MachineId) -> Vec<Arc<dyn Observer>> + Send>;

/// Campaign-wide director options.
#[derive(Default)]
pub struct Options {
    out_dir: Option<PathBuf>,
    global_timeout: Option<Duration>,
    quantities: QuantitySet,
    observers: Vec<Box<dyn DirectorObserver>>,
    instance_observers: Option<InstanceObservers>,
    fuzzer: Option<FuzzerConfig>,
    filters: FilterSet,
}

impl Options {
    /// Set output root.
    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    /// Set the campaign deadline, measured from the start of [`Director::direct`].
    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    /// Set global quantities.
    pub fn with_quantities(mut self, quantities: QuantitySet) -> Self {
        self.quantities = quantities;
        self
    }

    /// Add a director-level observer.
    pub fn with_observer(mut self, observer: Box<dyn DirectorObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Mint per-instance observers; called once per machine, in machine order, with the
    /// instance index.
    pub fn with_instance_observers(
        mut self,
        mint: impl FnMut(usize, &MachineId) -> Vec<Arc<dyn Observer>> + Send + 'static,
    ) -> Self {
        self.instance_observers = Some(Box::new(mint));
        self
    }

    /// Set fuzzer parameters.
    pub fn with_fuzzer(mut self, fuzzer: FuzzerConfig) -> Self {
        self.fuzzer = Some(fuzzer);
        self
    }

    /// Set benign-failure filters.
    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("out_dir", &self.out_dir)
            .field("global_timeout", &self.global_timeout)
            .field("quantities", &self.quantities)
            .field("observers", &self.observers.len())
            .field("instance_observers", &self.instance_observers.is_some())
            .field("fuzzer", &self.fuzzer)
            .field("filters", &self.filters)
            .finish()
    }
}

/// Top-level campaign controller.
pub struct Director {
    planner: Arc<dyn Planner>,
    machines: BTreeMap<MachineId, MachineConfig>,
    inputs: Vec<PathBuf>,
    instances: Vec<Instance>,
    observers: Vec<Box<dyn DirectorObserver>>,
    quantities: QuantitySet,
    global_timeout: Option<Duration>,
}

impl Director {
    /// Validate the campaign and pre-build one instance per machine.
    pub fn new(
        env: Environment,
        machines: BTreeMap<MachineId, MachineConfig>,
        inputs: Vec<PathBuf>,
        options: Options,
    ) -> Result<Self, DirectorError> {
        if machines.is_empty() {
            return Err(DirectorError::NoMachines);
        }
        if inputs.is_empty() {
            return Err(DirectorError::NoInputs);
        }
        let (planner, factory) = env.resolve()?;
        let Options {
            out_dir,
            global_timeout,
            quantities,
            mut observers,
            mut instance_observers,
            fuzzer,
            filters,
        } = options;
        let out_dir = out_dir.ok_or(DirectorError::NoOutDir)?;
        if global_timeout == Some(Duration::ZERO) {
            return Err(DirectorError::ZeroTimeout);
        }

        let fuzzer = fuzzer.map(Arc::new);
        let filters = Arc::new(filters);
        let mut instances = Vec::with_capacity(machines.len());
        for (index, (id, config)) in machines.iter().enumerate() {
            let pathset = Pathset::new(&out_dir, id);
            let machine = Machine::new(id.clone(), config.clone(), pathset, quantities);
            let stages = factory
                .for_machine(&machine)
                .map_err(|source| DirectorError::Stages {
                    machine: id.clone(),
                    source,
                })?;
            let mut instance = Instance::new(index, machine, stages).with_filters(filters.clone());
            if let Some(fuzzer) = &fuzzer {
                instance = instance.with_fuzzer(fuzzer.clone());
            }
            if let Some(mint) = instance_observers.as_mut() {
                instance = instance.with_observers(mint(index, id));
            }
            instances.push(instance);
        }

        for observer in observers.iter_mut() {
            observer.on_machines(&Progress::Start {
                total: machines.len(),
            });
            for (index, (id, config)) in machines.iter().enumerate() {
                observer.on_machines(&Progress::Step {
                    index,
                    item: MachineRecord {
                        id: id.clone(),
                        config: config.clone(),
                    },
                });
            }
            observer.on_machines(&Progress::End);
            observer.on_prepare(&PrepareMessage::Instances(instances.len()));
        }

        Ok(Self {
            planner,
            machines,
            inputs,
            instances,
            observers,
            quantities,
            global_timeout,
        })
    }

    /// Number of instances the campaign will run.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Plan every machine, then run all instances until one fails or `cx` is done.
    ///
    /// The first non-cancellation error cancels every other instance and is returned once all of
    /// them have stopped. If every instance stopped because of cancellation, the cancellation
    /// error is returned.
    pub async fn direct(mut self, cx: &Context) -> Result<(), DirectorError> {
        let mut plans = tokio::select! {
            biased;
            cancelled = cx.done() => return Err(cancelled.into()),
            plans = self.planner.plan(cx, &self.machines, &self.inputs) => {
                plans.map_err(DirectorError::Plan)?
            }
        };
        for instance in &mut self.instances {
            let id = &instance.machine().id;
            let plan = plans
                .remove(id)
                .ok_or_else(|| DirectorError::MissingPlan(id.clone()))?;
            instance.set_initial_plan(plan);
        }

        for observer in self.observers.iter_mut() {
            observer.on_prepare(&PrepareMessage::Quantities(self.quantities));
            for instance in &self.instances {
                observer.on_prepare(&PrepareMessage::Paths {
                    machine: instance.machine().id.clone(),
                    pathset: instance.machine().pathset.clone(),
                });
            }
        }

        let cx = match self.global_timeout {
            Some(timeout) => cx.with_timeout(timeout),
            None => cx.clone(),
        };
        let (cancel, group_cx) = cx.with_cancel();
        info!(
            instances = self.instances.len(),
            timeout = ?self.global_timeout,
            "campaign starting"
        );

        let mut tasks = FuturesUnordered::new();
        for mut instance in self.instances.drain(..) {
            let id = instance.machine().id.clone();
            let cx = group_cx.clone();
            let handle = tokio::spawn(async move { instance.run(&cx).await });
            tasks.push(async move { (id, handle.await) });
        }

        let mut fatal: Option<DirectorError> = None;
        let mut cancelled: Option<DirectorError> = None;
        while let Some((machine, joined)) = tasks.next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => DirectorError::Instance { machine, source },
                Err(_) => DirectorError::Panicked(machine),
            };
            if err.is_cancellation() {
                cancelled.get_or_insert(err);
            } else if fatal.is_none() {
                error!(error = %cause_chain(&err), "instance failed; stopping campaign");
                fatal = Some(err);
            }
            cancel.cancel();
        }

        match (fatal, cancelled) {
            (Some(err), _) | (None, Some(err)) => Err(err),
            (None, None) => Ok(()),
        }
    }
}
