//! Mutation scheduler.
//!
//! An [`Automator`] owns the expanded mutant list of one machine and emits the currently selected
//! mutant on a stream: once at start-up, then every time the periodic timer fires or a kill is
//! reported. The owning instance applies each selection to the next cycle it launches.

use std::time::Duration;

use futures::future::{self, BoxFuture};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::config::{Config, Mutant};
use crate::context::Context;
use crate::observer::{Event, Forward, Observer};

/// Mutation scheduler errors.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The configuration expands to zero mutants.
    #[error("mutation configuration selects no mutants")]
    NoMutants,
}

/// Channel ends held by the consumer of an [`Automator`].
#[derive(Debug)]
pub struct AutomatorHandles {
    /// Stream of mutant selections.
    pub mutants: mpsc::Receiver<Mutant>,
    /// Kill-signal input, present when kill reaction is configured.
    ///
    /// The consumer owns this end and must drop every clone of it once it has fully closed; the
    /// automator never closes it.
    pub kills: Option<mpsc::Sender<()>>,
}

/// Round-robin mutant scheduler.
#[derive(Debug)]
pub struct Automator {
    mutants: Vec<Mutant>,
    index: usize,
    period: Option<Duration>,
    out: mpsc::Sender<Mutant>,
    kills: Option<mpsc::Receiver<()>>,
}

impl Automator {
    /// Build a scheduler from `config`, returning it alongside the consumer's channel ends.
    pub fn new(config: &Config) -> Result<(Self, AutomatorHandles), MutationError> {
        let mutants = config.mutants();
        if mutants.is_empty() {
            return Err(MutationError::NoMutants);
        }

        let (out, mutant_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = if config.auto.change_kill {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let automator = Self {
            mutants,
            index: 0,
            period: config.auto.change_after(),
            out,
            kills: kill_rx,
        };
        let handles = AutomatorHandles {
            mutants: mutant_rx,
            kills: kill_tx,
        };
        Ok((automator, handles))
    }

    /// Expanded mutant list.
    pub fn mutants(&self) -> &[Mutant] {
        &self.mutants
    }

    /// Currently selected mutant.
    pub fn current(&self) -> Mutant {
        self.mutants[self.index]
    }

    /// Advance the round-robin index and return the newly selected mutant.
    pub fn rotate(&mut self) -> Mutant {
        self.index = (self.index + 1) % self.mutants.len();
        self.current()
    }

    /// Run until `cx` is done or the consumer drops the mutant stream.
    pub async fn run(mut self, cx: &Context) {
        let first = self.current();
        if self.send(cx, first).await {
            self.select_loop(cx).await;
        }
        self.drain_kills().await;
        debug!("mutation automator stopped");
    }

    async fn select_loop(&mut self, cx: &Context) {
        let mut ticker = self.period.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                _ = cx.done() => return,
                kill = recv_kill(&mut self.kills) => match kill {
                    Some(()) => {
                        let mutant = self.rotate();
                        info!(%mutant, "mutant killed; rotating");
                        if !self.send(cx, mutant).await {
                            return;
                        }
                        // Give the new mutant a full time-slice. Resetting also discards a tick
                        // that elapsed while we were sending.
                        if let Some(ticker) = ticker.as_mut() {
                            ticker.reset();
                        }
                    }
                    None => self.kills = None,
                },
                () = tick(&mut ticker) => {
                    let mutant = self.rotate();
                    info!(%mutant, "mutant time-slice elapsed; rotating");
                    if !self.send(cx, mutant).await {
                        return;
                    }
                }
            }
        }
    }

    async fn send(&self, cx: &Context, mutant: Mutant) -> bool {
        tokio::select! {
            biased;
            _ = cx.done() => false,
            sent = self.out.send(mutant) => sent.is_ok(),
        }
    }

    async fn drain_kills(&mut self) {
        if let Some(kills) = self.kills.as_mut() {
            while kills.recv().await.is_some() {}
        }
        self.kills = None;
    }
}

async fn recv_kill(kills: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match kills {
        Some(kills) => kills.recv().await,
        None => future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

/// Observer that signals a kill whenever a cycle's analysis shows a killed mutant.
#[derive(Debug, Clone)]
pub struct KillObserver {
    kills: mpsc::Sender<()>,
    cx: Context,
}

impl KillObserver {
    /// Forward kills into `kills` until `cx` is done.
    pub fn new(kills: mpsc::Sender<()>, cx: Context) -> Self {
        Self { kills, cx }
    }
}

impl Observer for KillObserver {
    fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Event::Analysis(analysis) = &message.event else {
                return;
            };
            if !analysis.mutation.has_kills() {
                return;
            }
            info!(
                cycle = %message.cycle,
                killed = ?analysis.mutation.killed_mutants(),
                "cycle killed a mutant"
            );
            tokio::select! {
                biased;
                _ = self.cx.done() => {}
                _ = self.kills.send(()) => {}
            }
        })
    }
}
