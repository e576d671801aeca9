//! Append-only campaign log: one line per event.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;

use tracing::warn;

use crate::cycle::{Cycle, now_timestamp_ms};
use crate::mutation::Analysis;
use crate::observer::{
    BuildStep, CompilerStep, CopyStep, CycleMessage, DirectorObserver, Handler, InstanceMessage,
    MachineMessage, PrepareMessage, Progress, SaveStep, cause_chain,
};

/// [`Handler`] and [`DirectorObserver`] writing human-readable lines to an append-only sink.
#[derive(Debug)]
pub struct LogHandler<W: Write + Send = LineWriter<File>> {
    out: W,
    failed: bool,
}

impl LogHandler {
    /// Append to the file at `path`, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(LineWriter::new(file)))
    }
}

impl<W: Write + Send> LogHandler<W> {
    /// Log to `out`.
    pub fn new(out: W) -> Self {
        Self { out, failed: false }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, scope: &dyn Display, text: &dyn Display) {
        if let Err(err) = writeln!(self.out, "{} [{scope}] {text}", now_timestamp_ms()) {
            // Report the first failure only; a broken log would otherwise warn on every event.
            if !self.failed {
                warn!(error = %err, "campaign log write failed");
                self.failed = true;
            }
        }
    }

    fn progress<T>(&mut self, cycle: &Cycle, what: &str, message: &Progress<T>, item: impl Fn(&T) -> String) {
        let text = match message {
            Progress::Start { total } => format!("{what}: starting ({total})"),
            Progress::Step { index, item: step } => format!("{what}: {} {}", index + 1, item(step)),
            Progress::End => format!("{what}: done"),
        };
        self.line(cycle, &text);
    }
}

impl<W: Write + Send> Handler for LogHandler<W> {
    fn on_cycle(&mut self, cycle: &Cycle, message: &CycleMessage) {
        let text = match message {
            CycleMessage::Started => "cycle started".to_string(),
            CycleMessage::Finished => "cycle finished".to_string(),
            CycleMessage::Errored(err) => format!("cycle failed: {}", cause_chain(err.as_ref())),
        };
        self.line(cycle, &text);
    }

    fn on_instance(&mut self, cycle: &Cycle, message: &InstanceMessage) {
        let text = match message {
            InstanceMessage::Closed => "instance closed".to_string(),
            InstanceMessage::MutantChanged(mutant) => format!("now testing {mutant}"),
        };
        self.line(cycle, &text);
    }

    fn on_analysis(&mut self, cycle: &Cycle, analysis: &Analysis) {
        let counts: Vec<String> = analysis
            .by_status
            .iter()
            .map(|(status, subjects)| format!("{status}={}", subjects.len()))
            .collect();
        self.line(cycle, &format!("analysis: {}", counts.join(" ")));
        for mutant in analysis.mutation.killed_mutants() {
            self.line(cycle, &format!("killed {mutant}"));
        }
    }

    fn on_compiler_config(&mut self, cycle: &Cycle, message: &Progress<CompilerStep>) {
        self.progress(cycle, "compilers", message, |step| {
            format!("{} ({} on {})", step.name, step.config.style, step.config.arch)
        });
    }

    fn on_save(&mut self, cycle: &Cycle, message: &Progress<SaveStep>) {
        self.progress(cycle, "save", message, |step| {
            format!("{} [{}] -> {}", step.subject, step.status, step.path.display())
        });
    }

    fn on_build(&mut self, cycle: &Cycle, message: &Progress<BuildStep>) {
        self.progress(cycle, "build", message, |step| step.subject.clone());
    }

    fn on_copy(&mut self, cycle: &Cycle, message: &Progress<CopyStep>) {
        self.progress(cycle, "copy", message, |step| {
            format!("{} -> {}", step.src.display(), step.dst.display())
        });
    }
}

impl<W: Write + Send> DirectorObserver for LogHandler<W> {
    fn on_machines(&mut self, message: &MachineMessage) {
        let text = match message {
            Progress::Start { total } => format!("configuring {total} machine(s)"),
            Progress::Step { item, .. } => format!(
                "machine {}: {} compiler(s){}",
                item.id,
                item.config.compilers.len(),
                if item.config.mutation.as_ref().is_some_and(|m| m.enabled) {
                    ", mutation testing"
                } else {
                    ""
                }
            ),
            Progress::End => "machines configured".to_string(),
        };
        self.line(&"director", &text);
    }

    fn on_prepare(&mut self, message: &PrepareMessage) {
        let text = match message {
            PrepareMessage::Instances(n) => format!("running {n} instance(s)"),
            PrepareMessage::Quantities(quantities) => format!("quantities {quantities:?}"),
            PrepareMessage::Paths { machine, pathset } => {
                format!("{machine} writes to {}", pathset.root.display())
            }
        };
        self.line(&"director", &text);
    }
}
