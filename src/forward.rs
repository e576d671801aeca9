//! Fan-in forwarding of instance events to single-threaded handler sinks.
//!
//! Every instance gets its own [`InstanceForwarder`], an [`Observer`] holding one sender of a
//! shared bounded channel. The [`Forwarder`] owns the receiving end and delivers each message to
//! every [`Handler`] in turn, so handlers never run concurrently and need no locking. Messages from
//! one instance keep their submission order; messages from different instances interleave.

use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::context::Context;
use crate::machine::MachineId;
use crate::observer::{Event, Forward, Handler, InstanceMessage, Observer, dispatch};

/// Forwarder construction errors.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The fan-in channel needs room for at least one message.
    #[error("forward buffer capacity must be positive")]
    ZeroCapacity,
}

/// Serial dispatcher feeding every registered handler.
pub struct Forwarder {
    tx: mpsc::Sender<Forward>,
    rx: mpsc::Receiver<Forward>,
    handlers: Vec<Box<dyn Handler>>,
}

impl Forwarder {
    /// Forwarder with a fan-in buffer of `capacity` messages.
    pub fn new(capacity: usize, handlers: Vec<Box<dyn Handler>>) -> Result<Self, ForwardError> {
        if capacity == 0 {
            return Err(ForwardError::ZeroCapacity);
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok(Self { tx, rx, handlers })
    }

    /// Add a handler.
    pub fn with_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Handle for minting per-instance sinks.
    ///
    /// The registrar does not keep the channel open: once [`Forwarder::run`] has started and every
    /// instance sink has closed, sinks minted afterwards discard their messages.
    pub fn registrar(&self) -> Registrar {
        Registrar {
            tx: self.tx.downgrade(),
        }
    }

    /// Mint a sink for the instance driving `machine`.
    pub fn instance(&self, machine: &MachineId) -> InstanceForwarder {
        InstanceForwarder::new(machine.clone(), self.tx.clone())
    }

    /// Deliver messages until every instance sink has closed; returns the number delivered.
    ///
    /// Cancellation of `cx` does not stop delivery: instances still emit their final messages
    /// while shutting down, and the loop drains them before returning.
    pub async fn run(self, cx: &Context) -> u64 {
        let Self {
            tx,
            mut rx,
            mut handlers,
        } = self;
        drop(tx);
        debug!(handlers = handlers.len(), "forwarder started");

        let mut delivered = 0u64;
        let mut draining = false;
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        trace!(cycle = %message.cycle, kind = %message.kind(), "forwarding");
                        for handler in handlers.iter_mut() {
                            dispatch(handler.as_mut(), &message);
                        }
                        delivered += 1;
                    }
                    None => break,
                },
                cancelled = cx.done(), if !draining => {
                    debug!(reason = %cancelled, "forwarder draining");
                    draining = true;
                }
            }
        }
        debug!(delivered, "forwarder stopped");
        delivered
    }
}

/// Mints [`InstanceForwarder`]s without holding the fan-in channel open.
#[derive(Debug, Clone)]
pub struct Registrar {
    tx: mpsc::WeakSender<Forward>,
}

impl Registrar {
    /// Mint a sink for the instance driving `machine`.
    pub fn instance(&self, machine: &MachineId) -> InstanceForwarder {
        match self.tx.upgrade() {
            Some(tx) => InstanceForwarder::new(machine.clone(), tx),
            None => {
                debug!(%machine, "forwarder already stopped; instance events will be discarded");
                InstanceForwarder {
                    machine: machine.clone(),
                    tx: Mutex::new(None),
                }
            }
        }
    }
}

/// Per-instance sink: forwards every message into the fan-in channel and closes itself right
/// after forwarding [`InstanceMessage::Closed`].
#[derive(Debug)]
pub struct InstanceForwarder {
    machine: MachineId,
    tx: Mutex<Option<mpsc::Sender<Forward>>>,
}

impl InstanceForwarder {
    fn new(machine: MachineId, tx: mpsc::Sender<Forward>) -> Self {
        Self {
            machine,
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Machine whose instance this sink serves.
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// True once the instance-closed message has been forwarded.
    pub fn is_closed(&self) -> bool {
        self.slot().is_none()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Forward>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Observer for InstanceForwarder {
    fn observe<'a>(&'a self, message: &'a Forward) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let closing = matches!(message.event, Event::Instance(InstanceMessage::Closed));
            let tx = if closing {
                self.slot().take()
            } else {
                self.slot().clone()
            };
            let Some(tx) = tx else {
                trace!(
                    machine = %self.machine,
                    cycle = %message.cycle,
                    "sink closed; message discarded"
                );
                return;
            };
            if tx.send(message.clone()).await.is_err() {
                trace!(
                    machine = %self.machine,
                    cycle = %message.cycle,
                    "forwarder gone; message discarded"
                );
            }
            if closing {
                debug!(machine = %self.machine, "instance sink closed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cycle::Cycle;
    use crate::observer::{CycleMessage, Kind};

    type Log = Arc<Mutex<Vec<(String, u64, Kind)>>>;

    struct Collect(Log);

    impl Handler for Collect {
        fn on_cycle(&mut self, cycle: &Cycle, _: &CycleMessage) {
            self.0
                .lock()
                .expect("log lock")
                .push((cycle.machine_id.to_string(), cycle.iter, Kind::Cycle));
        }

        fn on_instance(&mut self, cycle: &Cycle, _: &InstanceMessage) {
            self.0
                .lock()
                .expect("log lock")
                .push((cycle.machine_id.to_string(), cycle.iter, Kind::Instance));
        }
    }

    fn message(machine: &str, iter: u64, event: impl Into<Event>) -> Forward {
        Forward::new(Cycle::new(0, MachineId::from(machine), iter), event.into())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            Forwarder::new(0, Vec::new()),
            Err(ForwardError::ZeroCapacity)
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_returns_once_every_sink_has_closed() {
        let log: Log = Arc::default();
        let forwarder =
            Forwarder::new(2, vec![Box::new(Collect(log.clone()))]).expect("forwarder should build");
        let registrar = forwarder.registrar();
        let a = registrar.instance(&MachineId::from("a"));
        let b = forwarder.instance(&MachineId::from("b"));
        assert_eq!(a.machine().as_str(), "a");
        let run = tokio::spawn(async move { forwarder.run(&Context::background()).await });

        for iter in 0..5 {
            a.observe(&message("a", iter, CycleMessage::Started)).await;
            b.observe(&message("b", iter, CycleMessage::Started)).await;
        }
        a.observe(&message("a", 5, InstanceMessage::Closed)).await;
        assert!(a.is_closed());
        // Messages after close are discarded.
        a.observe(&message("a", 6, CycleMessage::Started)).await;
        b.observe(&message("b", 5, InstanceMessage::Closed)).await;

        let delivered = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("forwarder should stop")
            .expect("forwarder should not panic");
        assert_eq!(delivered, 12);
        drop(registrar);

        let log = log.lock().expect("log lock");
        for machine in ["a", "b"] {
            let iters: Vec<u64> = log
                .iter()
                .filter(|(m, _, _)| m == machine)
                .map(|(_, iter, _)| *iter)
                .collect();
            assert_eq!(iters, vec![0, 1, 2, 3, 4, 5]);
        }
        assert_eq!(log.last().map(|(_, _, kind)| *kind), Some(Kind::Instance));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_drains_instead_of_dropping() {
        let log: Log = Arc::default();
        let forwarder =
            Forwarder::new(8, vec![Box::new(Collect(log.clone()))]).expect("forwarder should build");
        let sink = forwarder.instance(&MachineId::from("a"));
        let (cancel, cx) = Context::background().with_cancel();
        cancel.cancel();
        let run = tokio::spawn(async move { forwarder.run(&cx).await });

        sink.observe(&message("a", 0, CycleMessage::Finished)).await;
        sink.observe(&message("a", 0, InstanceMessage::Closed)).await;
        let delivered = run.await.expect("forwarder should not panic");
        assert_eq!(delivered, 2);
        assert_eq!(log.lock().expect("log lock").len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sinks_minted_after_shutdown_discard() {
        let forwarder = Forwarder::new(1, Vec::new()).expect("forwarder should build");
        let registrar = forwarder.registrar();
        assert_eq!(forwarder.run(&Context::background()).await, 0);

        let late = registrar.instance(&MachineId::from("late"));
        assert!(late.is_closed());
        assert_eq!(late.machine().as_str(), "late");
        late.observe(&message("late", 0, CycleMessage::Started)).await;
    }
}
