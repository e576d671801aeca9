//! Progress events and the two observer surfaces that carry them.
//!
//! Instance-side code (the instance loop and its stage runners) reports through [`Observer`]s,
//! which are shared across tasks and may be called concurrently. Sink-side consumers (dashboards,
//! log files, statistics files) implement [`Handler`] instead: handlers take `&mut self`, are not
//! required to be thread-safe, and only ever see one message at a time because the
//! [`Forwarder`](crate::forward::Forwarder) delivers serially.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cycle::{Cycle, CycleError};
use crate::machine::{MachineConfig, MachineId, Pathset, QuantitySet};
use crate::mutation::{Analysis, Mutant};
use crate::plan::{CompilerConfig, Status};

/// Start, per-item step and end of a multi-step operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    /// Operation started with `total` items.
    Start {
        /// Number of items expected.
        total: usize,
    },
    /// One item processed.
    Step {
        /// Zero-based item index.
        index: usize,
        /// Item details.
        item: T,
    },
    /// Operation finished.
    End,
}

/// Corpus build step: one subject added to the corpus under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    /// Subject name.
    pub subject: String,
}

/// Compiler configuration step: one compiler resolved for the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerStep {
    /// Compiler name.
    pub name: String,
    /// Resolved configuration.
    pub config: CompilerConfig,
}

/// Archive step: one subject saved for postmortem inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveStep {
    /// Subject name.
    pub subject: String,
    /// Status it was saved under.
    pub status: Status,
    /// Archive written.
    pub path: PathBuf,
}

/// File copy step: one file copied to or from the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStep {
    /// Source path.
    pub src: PathBuf,
    /// Destination path.
    pub dst: PathBuf,
}

/// Cycle lifecycle.
#[derive(Debug, Clone)]
pub enum CycleMessage {
    /// Cycle launched.
    Started,
    /// Cycle finished and its scratch space was cleaned up.
    Finished,
    /// Cycle failed; the instance backs off before relaunching.
    Errored(Arc<CycleError>),
}

/// Instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceMessage {
    /// The instance has stopped; no further messages follow from it.
    Closed,
    /// A new mutant will be used from the next launched cycle on.
    MutantChanged(Mutant),
}

/// Tag of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// [`Event::Cycle`].
    Cycle,
    /// [`Event::Instance`].
    Instance,
    /// [`Event::Analysis`].
    Analysis,
    /// [`Event::CompilerConfig`].
    CompilerConfig,
    /// [`Event::Save`].
    Save,
    /// [`Event::Build`].
    Build,
    /// [`Event::Copy`].
    Copy,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Cycle => "cycle",
            Kind::Instance => "instance",
            Kind::Analysis => "analysis",
            Kind::CompilerConfig => "compiler-config",
            Kind::Save => "save",
            Kind::Build => "build",
            Kind::Copy => "copy",
        };
        f.write_str(name)
    }
}

/// Payload of a forwarded message; exactly one variant is populated.
#[derive(Debug, Clone)]
pub enum Event {
    /// Cycle lifecycle.
    Cycle(CycleMessage),
    /// Instance lifecycle.
    Instance(InstanceMessage),
    /// Analysis of a finished cycle.
    Analysis(Arc<Analysis>),
    /// Compiler configuration progress.
    CompilerConfig(Progress<CompilerStep>),
    /// Archive progress.
    Save(Progress<SaveStep>),
    /// Corpus build progress.
    Build(Progress<BuildStep>),
    /// File copy progress.
    Copy(Progress<CopyStep>),
}

impl Event {
    /// Tag of this event.
    pub fn kind(&self) -> Kind {
        match self {
            Event::Cycle(_) => Kind::Cycle,
            Event::Instance(_) => Kind::Instance,
            Event::Analysis(_) => Kind::Analysis,
            Event::CompilerConfig(_) => Kind::CompilerConfig,
            Event::Save(_) => Kind::Save,
            Event::Build(_) => Kind::Build,
            Event::Copy(_) => Kind::Copy,
        }
    }
}

impl From<CycleMessage> for Event {
    fn from(message: CycleMessage) -> Self {
        Event::Cycle(message)
    }
}

impl From<InstanceMessage> for Event {
    fn from(message: InstanceMessage) -> Self {
        Event::Instance(message)
    }
}

impl From<Analysis> for Event {
    fn from(analysis: Analysis) -> Self {
        Event::Analysis(Arc::new(analysis))
    }
}

impl From<Progress<CompilerStep>> for Event {
    fn from(message: Progress<CompilerStep>) -> Self {
        Event::CompilerConfig(message)
    }
}

impl From<Progress<SaveStep>> for Event {
    fn from(message: Progress<SaveStep>) -> Self {
        Event::Save(message)
    }
}

impl From<Progress<BuildStep>> for Event {
    fn from(message: Progress<BuildStep>) -> Self {
        Event::Build(message)
    }
}

impl From<Progress<CopyStep>> for Event {
    fn from(message: Progress<CopyStep>) -> Self {
        Event::Copy(message)
    }
}

/// An event stamped with the cycle it belongs to. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct Forward {
    /// Cycle context.
    pub cycle: Cycle,
    /// Payload.
    pub event: Event,
}

impl Forward {
    /// Stamp `event` with `cycle`.
    pub fn new(cycle: Cycle, event: Event) -> Self {
        Self { cycle, event }
    }

    /// Tag of the payload.
    pub fn kind(&self) -> Kind {
        self.event.kind()
    }
}

/// Instance-side observer, shared between an instance loop and its cycle tasks.
pub trait Observer: Send + Sync {
    /// Observe one message.
    fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()>;
}

/// Deliver `message` to each observer in turn.
pub async fn observe_all(observers: &[Arc<dyn Observer>], message: &Forward) {
    for observer in observers {
        observer.observe(message).await;
    }
}

/// Stamps events from one cycle and hands them to the instance's observers.
#[derive(Clone)]
pub struct CycleObserver {
    cycle: Cycle,
    observers: Arc<[Arc<dyn Observer>]>,
}

impl CycleObserver {
    /// Bind `cycle` to `observers`.
    pub fn new(cycle: Cycle, observers: Arc<[Arc<dyn Observer>]>) -> Self {
        Self { cycle, observers }
    }

    /// Cycle this observer stamps onto events.
    pub fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    /// Emit one event.
    pub async fn emit(&self, event: impl Into<Event>) {
        let message = Forward::new(self.cycle.clone(), event.into());
        observe_all(&self.observers, &message).await;
    }
}

impl fmt::Debug for CycleObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleObserver")
            .field("cycle", &self.cycle)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Sink-side consumer of forwarded messages; one method per [`Kind`].
#[allow(unused_variables)]
pub trait Handler: Send {
    /// Cycle lifecycle.
    fn on_cycle(&mut self, cycle: &Cycle, message: &CycleMessage) {}
    /// Instance lifecycle.
    fn on_instance(&mut self, cycle: &Cycle, message: &InstanceMessage) {}
    /// Cycle analysis.
    fn on_analysis(&mut self, cycle: &Cycle, analysis: &Analysis) {}
    /// Compiler configuration progress.
    fn on_compiler_config(&mut self, cycle: &Cycle, message: &Progress<CompilerStep>) {}
    /// Archive progress.
    fn on_save(&mut self, cycle: &Cycle, message: &Progress<SaveStep>) {}
    /// Corpus build progress.
    fn on_build(&mut self, cycle: &Cycle, message: &Progress<BuildStep>) {}
    /// File copy progress.
    fn on_copy(&mut self, cycle: &Cycle, message: &Progress<CopyStep>) {}
}

/// Route `message` to the handler method matching its kind.
pub fn dispatch(handler: &mut dyn Handler, message: &Forward) {
    let cycle = &message.cycle;
    match &message.event {
        Event::Cycle(m) => handler.on_cycle(cycle, m),
        Event::Instance(m) => handler.on_instance(cycle, m),
        Event::Analysis(a) => handler.on_analysis(cycle, a),
        Event::CompilerConfig(m) => handler.on_compiler_config(cycle, m),
        Event::Save(m) => handler.on_save(cycle, m),
        Event::Build(m) => handler.on_build(cycle, m),
        Event::Copy(m) => handler.on_copy(cycle, m),
    }
}

/// Machine configuration record announced before a campaign starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    /// Machine identifier.
    pub id: MachineId,
    /// Machine configuration.
    pub config: MachineConfig,
}

/// Machine configuration progress, one step per machine.
pub type MachineMessage = Progress<MachineRecord>;

/// Campaign preparation announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareMessage {
    /// Number of instances the campaign will run.
    Instances(usize),
    /// Global quantities in effect.
    Quantities(QuantitySet),
    /// Output paths of one machine.
    Paths {
        /// Machine identifier.
        machine: MachineId,
        /// Its paths.
        pathset: Pathset,
    },
}

/// Director-level observer, called only from the director before instances start.
#[allow(unused_variables)]
pub trait DirectorObserver: Send {
    /// Machine configuration progress.
    fn on_machines(&mut self, message: &MachineMessage) {}
    /// Campaign preparation.
    fn on_prepare(&mut self, message: &PrepareMessage) {}
}

/// Render `err` followed by each of its sources, separated by `": "`.
pub fn cause_chain(err: &(dyn Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Tally {
        kinds: Vec<Kind>,
    }

    impl Handler for Tally {
        fn on_cycle(&mut self, _: &Cycle, _: &CycleMessage) {
            self.kinds.push(Kind::Cycle);
        }
        fn on_instance(&mut self, _: &Cycle, _: &InstanceMessage) {
            self.kinds.push(Kind::Instance);
        }
        fn on_analysis(&mut self, _: &Cycle, _: &Analysis) {
            self.kinds.push(Kind::Analysis);
        }
        fn on_compiler_config(&mut self, _: &Cycle, _: &Progress<CompilerStep>) {
            self.kinds.push(Kind::CompilerConfig);
        }
        fn on_save(&mut self, _: &Cycle, _: &Progress<SaveStep>) {
            self.kinds.push(Kind::Save);
        }
        fn on_build(&mut self, _: &Cycle, _: &Progress<BuildStep>) {
            self.kinds.push(Kind::Build);
        }
        fn on_copy(&mut self, _: &Cycle, _: &Progress<CopyStep>) {
            self.kinds.push(Kind::Copy);
        }
    }

    fn cycle() -> Cycle {
        Cycle::new(1, MachineId::from("m"), 3)
    }

    #[test]
    fn dispatch_selects_the_method_for_each_kind() {
        let events: Vec<Event> = vec![
            CycleMessage::Started.into(),
            InstanceMessage::Closed.into(),
            Analysis::default().into(),
            Progress::<CompilerStep>::End.into(),
            Progress::<SaveStep>::Start { total: 1 }.into(),
            Progress::Step {
                index: 0,
                item: BuildStep {
                    subject: "sb".to_string(),
                },
            }
            .into(),
            Progress::<CopyStep>::End.into(),
        ];
        let expected: Vec<Kind> = events.iter().map(Event::kind).collect();

        let mut tally = Tally::default();
        for event in events {
            dispatch(&mut tally, &Forward::new(cycle(), event));
        }
        assert_eq!(tally.kinds, expected);
    }

    struct Recorder(Mutex<Vec<Kind>>);

    impl Observer for Recorder {
        fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.0
                    .lock()
                    .expect("recorder lock should not be poisoned")
                    .push(message.kind());
            })
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cycle_observer_stamps_and_fans_out() {
        let first = Arc::new(Recorder(Mutex::new(Vec::new())));
        let second = Arc::new(Recorder(Mutex::new(Vec::new())));
        let observers: Arc<[Arc<dyn Observer>]> =
            Arc::from(vec![first.clone() as Arc<dyn Observer>, second.clone()]);
        let observer = CycleObserver::new(cycle(), observers);

        observer.emit(CycleMessage::Started).await;
        observer.emit(Progress::<CopyStep>::End).await;

        for recorder in [&first, &second] {
            let kinds = recorder.0.lock().expect("lock").clone();
            assert_eq!(kinds, vec![Kind::Cycle, Kind::Copy]);
        }
        assert_eq!(observer.cycle().iter, 3);
    }

    #[test]
    fn cause_chain_walks_sources() {
        let io = std::io::Error::other("disk on fire");
        let err = CycleError::Cleanup(io);
        assert_eq!(
            cause_chain(&err),
            "failed to clean up scratch directories: disk on fire"
        );
    }
}
