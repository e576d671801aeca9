//! Stage runners backed by external programs.
//!
//! Each configured stage is a program that reads the plan as JSON on stdin and writes the
//! transformed plan as JSON on stdout. Stages without a program pass the plan through unchanged.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

use crate::context::{Cancelled, Context};
use crate::cycle::StageKind;
use crate::env::{BoxError, CycleEnv, Stage, StageFactory, StageSet, Stages};
use crate::machine::{Machine, SavedPaths};
use crate::mutation::Analysis;
use crate::observer::{BuildStep, CompilerStep, CopyStep, CycleObserver, Progress, SaveStep};
use crate::plan::{Plan, Status};

/// External stage failures.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started.
    #[error("failed to spawn {program}")]
    Spawn {
        /// Program path.
        program: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Waiting for the program failed.
    #[error("failed to wait for {program}")]
    Wait {
        /// Program path.
        program: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        /// Program path.
        program: PathBuf,
        /// Exit status.
        status: ExitStatus,
        /// Trimmed standard error.
        stderr: String,
    },
    /// The program did not finish within its timeout.
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// Program path.
        program: PathBuf,
        /// Configured timeout.
        timeout: Duration,
    },
    /// Plan (de)serialisation failed.
    #[error("plan json: {0}")]
    Json(#[from] serde_json::Error),
    /// Archiving a subject failed.
    #[error("failed to save {subject}")]
    Save {
        /// Subject name.
        subject: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Copying a subject into the stage's scratch directory failed.
    #[error("failed to copy {src} to {dst}")]
    Copy {
        /// Source path.
        src: PathBuf,
        /// Destination path.
        dst: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Cancelled while the program ran; the child is killed.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Program run for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-run timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    /// Run `program` without arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Append an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the per-run timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// [`StageFactory`] that runs one external program per stage.
#[derive(Debug, Clone, Default)]
pub struct CommandStages {
    specs: Arc<BTreeMap<StageKind, CommandSpec>>,
}

impl CommandStages {
    /// Use `specs`; stages missing from it pass the plan through.
    pub fn new(specs: BTreeMap<StageKind, CommandSpec>) -> Self {
        Self {
            specs: Arc::new(specs),
        }
    }
}

impl StageFactory for CommandStages {
    fn for_machine(&self, _machine: &Machine) -> Result<Arc<dyn StageSet>, BoxError> {
        Ok(Arc::new(CommandStageSet {
            specs: self.specs.clone(),
        }))
    }
}

struct CommandStageSet {
    specs: Arc<BTreeMap<StageKind, CommandSpec>>,
}

impl CommandStageSet {
    fn stage(&self, kind: StageKind, env: &CycleEnv) -> Result<Box<dyn Stage>, BoxError> {
        Ok(Box::new(CommandStage {
            kind,
            spec: self.specs.get(&kind).cloned(),
            vars: stage_vars(kind, env)?,
            scratch: stage_scratch(kind, env).to_path_buf(),
            observer: env.observer.clone(),
            saved: env.saved.clone(),
        }))
    }
}

impl StageSet for CommandStageSet {
    fn stages(&self, env: &CycleEnv) -> Result<Stages, BoxError> {
        Ok(Stages {
            perturb: self.stage(StageKind::Perturb, env)?,
            fuzz: self.stage(StageKind::Fuzz, env)?,
            lift: self.stage(StageKind::Lift, env)?,
            invoke: self.stage(StageKind::Invoke, env)?,
            analyse: self.stage(StageKind::Analyse, env)?,
        })
    }
}

fn stage_scratch(kind: StageKind, env: &CycleEnv) -> &Path {
    match kind {
        StageKind::Fuzz => &env.scratch.fuzz,
        StageKind::Lift => &env.scratch.lift,
        StageKind::Invoke => &env.scratch.run,
        StageKind::Perturb | StageKind::Analyse => &env.scratch.root,
    }
}

fn stage_vars(kind: StageKind, env: &CycleEnv) -> Result<Vec<(String, String)>, serde_json::Error> {
    let scratch = stage_scratch(kind, env);
    let mut vars = vec![
        ("CAMPAIGN_STAGE".to_string(), kind.to_string()),
        ("CAMPAIGN_MACHINE".to_string(), env.cycle.machine_id.to_string()),
        ("CAMPAIGN_ITER".to_string(), env.cycle.iter.to_string()),
        ("CAMPAIGN_SCRATCH".to_string(), scratch.display().to_string()),
        ("CAMPAIGN_SAVED".to_string(), env.saved.root.display().to_string()),
        (
            "CAMPAIGN_QUANTITIES".to_string(),
            serde_json::to_string(&env.quantities)?,
        ),
    ];
    match kind {
        StageKind::Fuzz => {
            if let Some(fuzzer) = &env.fuzzer {
                vars.push(("CAMPAIGN_FUZZER".to_string(), serde_json::to_string(&**fuzzer)?));
            }
        }
        StageKind::Invoke => {
            vars.push((
                "CAMPAIGN_FILTERS".to_string(),
                serde_json::to_string(&*env.filters)?,
            ));
        }
        _ => {}
    }
    Ok(vars)
}

struct CommandStage {
    kind: StageKind,
    spec: Option<CommandSpec>,
    vars: Vec<(String, String)>,
    scratch: PathBuf,
    observer: CycleObserver,
    saved: SavedPaths,
}

impl Stage for CommandStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn run<'a>(&'a self, cx: &'a Context, plan: Plan) -> BoxFuture<'a, Result<Plan, BoxError>> {
        Box::pin(async move {
            let started = Instant::now();
            if self.kind == StageKind::Invoke {
                report_compilers(&self.observer, &plan).await;
                if self.spec.is_some() {
                    copy_subjects(&self.observer, &self.scratch, &plan).await?;
                }
            }
            let mut plan = match &self.spec {
                Some(spec) => self.execute(cx, spec, &plan).await?,
                None => plan,
            };
            match self.kind {
                StageKind::Fuzz => report_corpus(&self.observer, &plan).await,
                StageKind::Analyse => {
                    save_subjects(&self.observer, &self.saved, &plan).await?;
                    self.observer.emit(Analysis::of(&plan)).await;
                }
                _ => {}
            }
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            plan.record_stage(self.kind, elapsed);
            Ok(plan)
        })
    }
}

impl CommandStage {
    async fn execute(&self, cx: &Context, spec: &CommandSpec, plan: &Plan) -> Result<Plan, CommandError> {
        let input = serde_json::to_vec(plan)?;
        let cx = match spec.timeout() {
            Some(timeout) => cx.with_timeout(timeout),
            None => cx.clone(),
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(self.vars.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        debug!(
            cycle = %self.observer.cycle(),
            stage = %self.kind,
            program = %spec.program.display(),
            "stage program started"
        );

        let stdin = child.stdin.take();
        let finished = async {
            let (_, output) = tokio::join!(feed(stdin, &input), child.wait_with_output());
            output
        };
        let output: Output = tokio::select! {
            biased;
            cancelled = cx.done() => {
                return Err(match (cancelled, spec.timeout()) {
                    (Cancelled::DeadlineExceeded, Some(timeout)) => CommandError::Timeout {
                        program: spec.program.clone(),
                        timeout,
                    },
                    _ => cancelled.into(),
                });
            }
            output = finished => output.map_err(|source| CommandError::Wait {
                program: spec.program.clone(),
                source,
            })?,
        };

        if !output.status.success() {
            return Err(CommandError::Exit {
                program: spec.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

async fn feed(stdin: Option<ChildStdin>, input: &[u8]) {
    let Some(mut stdin) = stdin else {
        return;
    };
    let written = async {
        stdin.write_all(input).await?;
        stdin.shutdown().await
    };
    // A program that ignores its input may close stdin early.
    if let Err(err) = written.await {
        if err.kind() != io::ErrorKind::BrokenPipe {
            warn!(error = %err, "failed to write plan to stage program");
        }
    }
}

async fn report_compilers(observer: &CycleObserver, plan: &Plan) {
    if plan.compilers.is_empty() {
        return;
    }
    observer
        .emit(Progress::<CompilerStep>::Start {
            total: plan.compilers.len(),
        })
        .await;
    for (index, (name, config)) in plan.compilers.iter().enumerate() {
        observer
            .emit(Progress::Step {
                index,
                item: CompilerStep {
                    name: name.clone(),
                    config: config.clone(),
                },
            })
            .await;
    }
    observer.emit(Progress::<CompilerStep>::End).await;
}

/// Report the corpus a fuzz stage handed on, one step per subject.
async fn report_corpus(observer: &CycleObserver, plan: &Plan) {
    if plan.corpus.is_empty() {
        return;
    }
    observer
        .emit(Progress::<BuildStep>::Start {
            total: plan.corpus.len(),
        })
        .await;
    for (index, subject) in plan.corpus.keys().enumerate() {
        observer
            .emit(Progress::Step {
                index,
                item: BuildStep {
                    subject: subject.clone(),
                },
            })
            .await;
    }
    observer.emit(Progress::<BuildStep>::End).await;
}

/// Copy every subject's source into `dir` so the stage program finds them next to its scratch
/// output.
async fn copy_subjects(
    observer: &CycleObserver,
    dir: &Path,
    plan: &Plan,
) -> Result<(), CommandError> {
    if plan.corpus.is_empty() {
        return Ok(());
    }
    observer
        .emit(Progress::<CopyStep>::Start {
            total: plan.corpus.len(),
        })
        .await;
    for (index, (name, subject)) in plan.corpus.iter().enumerate() {
        let src = subject.source.clone();
        let dst = dir.join(archive_name(name, &src));
        let copied = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::copy(&src, &dst).await
        };
        if let Err(source) = copied.await {
            return Err(CommandError::Copy { src, dst, source });
        }
        observer
            .emit(Progress::Step {
                index,
                item: CopyStep { src, dst },
            })
            .await;
    }
    observer.emit(Progress::<CopyStep>::End).await;
    Ok(())
}

fn archive_name(subject: &str, source: &Path) -> std::ffi::OsString {
    source
        .file_name()
        .map_or_else(|| subject.into(), |name| name.to_os_string())
}

async fn save_subjects(
    observer: &CycleObserver,
    saved: &SavedPaths,
    plan: &Plan,
) -> Result<(), CommandError> {
    let mut to_save: Vec<(&str, Status, &Path)> = Vec::new();
    for (status, subjects) in plan.subjects_by_status() {
        if !status.is_saved() {
            continue;
        }
        for name in subjects {
            if let Some((name, subject)) = plan.corpus.get_key_value(&name) {
                to_save.push((name.as_str(), status, subject.source.as_path()));
            }
        }
    }
    if to_save.is_empty() {
        return Ok(());
    }

    observer
        .emit(Progress::<SaveStep>::Start {
            total: to_save.len(),
        })
        .await;
    for (index, (subject, status, source)) in to_save.into_iter().enumerate() {
        let dir = saved.status_dir(status);
        let path = dir.join(archive_name(subject, source));
        let copied = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::copy(source, &path).await
        };
        copied.await.map_err(|source| CommandError::Save {
            subject: subject.to_string(),
            source,
        })?;
        observer
            .emit(Progress::Step {
                index,
                item: SaveStep {
                    subject: subject.to_string(),
                    status,
                    path,
                },
            })
            .await;
    }
    observer.emit(Progress::<SaveStep>::End).await;
    Ok(())
}
