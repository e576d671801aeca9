//! Scripted stages and recording observers shared by the scenario tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use campaign_director::prelude::*;
use campaign_director::plan::{Compilation, MutantSelection, Subject};
use futures::future::BoxFuture;
use tokio::time::Instant;

/// How long the perturb stage of every scripted cycle takes.
pub const STAGE_TIME: Duration = Duration::from_millis(50);

/// File the perturb stage leaves in the run scratch directory.
pub const MARKER: &str = "marker";

/// What one scripted cycle saw at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub iter: u64,
    pub mutant: Option<Mutant>,
    pub subjects: usize,
}

/// Shared state of a scripted stage set.
#[derive(Debug, Default)]
pub struct Script {
    failures: AtomicUsize,
    kill: bool,
    block: Option<Duration>,
    clobber: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    launches: Mutex<Vec<Launch>>,
}

impl Script {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the fuzz stage of the first `failures` cycles.
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        })
    }

    /// Flag a subject hit by the selected mutant in every cycle.
    pub fn killing() -> Arc<Self> {
        Arc::new(Self {
            kill: true,
            ..Self::default()
        })
    }

    /// Block the runtime thread in the perturb stage for `block`, then fail if the context is
    /// done by then.
    pub fn blocking(block: Duration) -> Arc<Self> {
        Arc::new(Self {
            block: Some(block),
            ..Self::default()
        })
    }

    /// Replace the scratch root with a plain file during analysis, so it cannot be removed.
    pub fn clobbering_scratch() -> Arc<Self> {
        Arc::new(Self {
            clobber: true,
            ..Self::default()
        })
    }

    pub fn stage_set(self: &Arc<Self>) -> Arc<dyn StageSet> {
        Arc::new(ScriptedSet {
            script: self.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().expect("launches lock").clone()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Counts a cycle as in flight from stage construction until its stages are dropped.
struct InFlight(Arc<Script>);

impl InFlight {
    fn enter(script: &Arc<Script>) -> Arc<Self> {
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Arc::new(Self(script.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedSet {
    script: Arc<Script>,
}

impl StageSet for ScriptedSet {
    fn stages(&self, env: &CycleEnv) -> Result<Stages, BoxError> {
        let guard = InFlight::enter(&self.script);
        let stage = |kind: StageKind| -> Box<dyn Stage> {
            Box::new(ScriptedStage {
                kind,
                script: self.script.clone(),
                env: env.clone(),
                _guard: guard.clone(),
            })
        };
        Ok(Stages {
            perturb: stage(StageKind::Perturb),
            fuzz: stage(StageKind::Fuzz),
            lift: stage(StageKind::Lift),
            invoke: stage(StageKind::Invoke),
            analyse: stage(StageKind::Analyse),
        })
    }
}

struct ScriptedStage {
    kind: StageKind,
    script: Arc<Script>,
    env: CycleEnv,
    _guard: Arc<InFlight>,
}

impl Stage for ScriptedStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn run<'a>(&'a self, cx: &'a Context, mut plan: Plan) -> BoxFuture<'a, Result<Plan, BoxError>> {
        Box::pin(async move {
            match self.kind {
                StageKind::Perturb => {
                    self.script.launches.lock().expect("launches lock").push(Launch {
                        iter: self.env.cycle.iter,
                        mutant: plan.mutant,
                        subjects: plan.corpus.len(),
                    });
                    tokio::fs::write(self.env.scratch.run.join(MARKER), "").await?;
                    if let Some(block) = self.script.block {
                        // Starves the timer driver, so the stage sees the deadline first.
                        std::thread::sleep(block);
                        if let Some(cancelled) = cx.err() {
                            return Err(format!("stage gave up: {cancelled}").into());
                        }
                    }
                    tokio::time::sleep(STAGE_TIME).await;
                }
                StageKind::Fuzz if self.script.take_failure() => {
                    return Err("injected fuzz failure".into());
                }
                StageKind::Analyse => {
                    if self.script.clobber {
                        tokio::fs::remove_dir_all(&self.env.scratch.root).await?;
                        tokio::fs::write(&self.env.scratch.root, "").await?;
                    }
                    if let Some(mutant) = plan.mutant.filter(|_| self.script.kill) {
                        let mut subject = Subject::default();
                        subject.compilations.insert(
                            "gcc".to_string(),
                            Compilation {
                                status: Status::Flagged,
                                mutant: Some(MutantSelection { mutant, hits: 1 }),
                            },
                        );
                        plan.corpus.insert("victim".to_string(), subject);
                    }
                    self.env.observer.emit(Analysis::of(&plan)).await;
                }
                _ => {}
            }
            Ok(plan)
        })
    }
}

/// Hands every machine its own scripted stage set.
#[derive(Clone, Default)]
pub struct ScriptFactory {
    scripts: Arc<Mutex<BTreeMap<MachineId, Arc<Script>>>>,
}

impl ScriptFactory {
    pub fn script(&self, machine: &str) -> Arc<Script> {
        self.scripts.lock().expect("scripts lock")[&MachineId::from(machine)].clone()
    }
}

impl StageFactory for ScriptFactory {
    fn for_machine(&self, machine: &Machine) -> Result<Arc<dyn StageSet>, BoxError> {
        let script = Script::passing();
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(machine.id.clone(), script.clone());
        Ok(script.stage_set())
    }
}

/// One observed instance or cycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum What {
    Started,
    Finished,
    Errored,
    MutantChanged(Mutant),
    Closed,
    Other(Kind),
}

impl What {
    pub fn of(event: &Event) -> Self {
        match event {
            Event::Cycle(CycleMessage::Started) => What::Started,
            Event::Cycle(CycleMessage::Finished) => What::Finished,
            Event::Cycle(CycleMessage::Errored(_)) => What::Errored,
            Event::Instance(InstanceMessage::MutantChanged(mutant)) => What::MutantChanged(*mutant),
            Event::Instance(InstanceMessage::Closed) => What::Closed,
            other => What::Other(other.kind()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seen {
    pub at: Instant,
    pub machine: String,
    pub iter: u64,
    pub what: What,
    pub error: Option<Arc<CycleError>>,
}

/// Observer recording every message together with the (possibly paused) clock.
#[derive(Default)]
pub struct Recorder(Mutex<Vec<Seen>>);

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.0.lock().expect("recorder lock").clone()
    }

    pub fn mutant_changes(&self) -> Vec<Mutant> {
        self.seen()
            .into_iter()
            .filter_map(|seen| match seen.what {
                What::MutantChanged(mutant) => Some(mutant),
                _ => None,
            })
            .collect()
    }
}

impl Observer for Recorder {
    fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.0.lock().expect("recorder lock").push(Seen {
                at: Instant::now(),
                machine: message.cycle.machine_id.to_string(),
                iter: message.cycle.iter,
                what: What::of(&message.event),
                error: match &message.event {
                    Event::Cycle(CycleMessage::Errored(err)) => Some(err.clone()),
                    _ => None,
                },
            });
        })
    }
}

/// Records, at every cycle outcome, whether the marker left in scratch still exists.
pub struct ScratchWatch {
    marker: PathBuf,
    seen: Mutex<Vec<(What, bool)>>,
}

impl ScratchWatch {
    pub fn new(machine: &Machine) -> Arc<Self> {
        Arc::new(Self {
            marker: machine.pathset.scratch.run.join(MARKER),
            seen: Mutex::default(),
        })
    }

    pub fn seen(&self) -> Vec<(What, bool)> {
        self.seen.lock().expect("scratch watch lock").clone()
    }
}

impl Observer for ScratchWatch {
    fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let what = What::of(&message.event);
            if matches!(what, What::Finished | What::Errored) {
                let present = self.marker.exists();
                self.seen.lock().expect("scratch watch lock").push((what, present));
            }
        })
    }
}

/// Handler collecting forwarded messages in delivery order.
#[derive(Clone, Default)]
pub struct Collect(pub Arc<Mutex<Vec<(String, u64, What)>>>);

impl Collect {
    pub fn delivered(&self) -> Vec<(String, u64, What)> {
        self.0.lock().expect("collect lock").clone()
    }

    fn push(&self, cycle: &Cycle, what: What) {
        self.0
            .lock()
            .expect("collect lock")
            .push((cycle.machine_id.to_string(), cycle.iter, what));
    }
}

impl Handler for Collect {
    fn on_cycle(&mut self, cycle: &Cycle, message: &CycleMessage) {
        self.push(cycle, What::of(&Event::Cycle(message.clone())));
    }

    fn on_instance(&mut self, cycle: &Cycle, message: &InstanceMessage) {
        self.push(cycle, What::of(&Event::Instance(*message)));
    }

    fn on_analysis(&mut self, cycle: &Cycle, _analysis: &Analysis) {
        self.push(cycle, What::Other(Kind::Analysis));
    }
}

pub fn machine(out: &Path, name: &str) -> Machine {
    let id = MachineId::from(name);
    let pathset = Pathset::new(out, &id);
    Machine::new(id, MachineConfig::default(), pathset, QuantitySet::default())
}
