//! Cancellation and deadline propagation shared by the director, its instances and their cycles.
//!
//! A [`Context`] is a cheap, clonable view onto a set of cancellation signals plus an optional
//! deadline. Children inherit every signal of their parent, so cancelling a parent reaches every
//! descendant, while cancelling a child leaves the parent untouched.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Reason a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Cancelled {
    /// Cancelled explicitly through a [`Canceller`].
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Handle that cancels the [`Context`] it was created with (and that context's children).
///
/// Dropping a canceller without calling [`Canceller::cancel`] never cancels anything.
#[derive(Debug, Clone)]
pub struct Canceller {
    signal: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Cancel the associated context. Idempotent.
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    /// True once [`Canceller::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }
}

/// Cancellation scope with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// Root context: never cancelled and without deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context that is additionally cancelled by the returned [`Canceller`].
    pub fn with_cancel(&self) -> (Canceller, Context) {
        let (tx, rx) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(rx);
        let child = Context {
            signals,
            deadline: self.deadline,
        };
        (
            Canceller {
                signal: Arc::new(tx),
            },
            child,
        )
    }

    /// Child context whose deadline is the earlier of `deadline` and this context's deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Context {
            signals: self.signals.clone(),
            deadline: Some(deadline),
        }
    }

    /// Child context that times out `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check of whether the context is done.
    pub fn err(&self) -> Option<Cancelled> {
        if self.signals.iter().any(|signal| *signal.borrow()) {
            return Some(Cancelled::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Cancelled::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is done.
    ///
    /// Cancel-safe: a fresh future may be created on every loop iteration of a `select!`.
    pub async fn done(&self) -> Cancelled {
        if let Some(cancelled) = self.err() {
            return cancelled;
        }
        let signalled = async {
            if self.signals.is_empty() {
                future::pending::<()>().await;
            }
            let waits = self
                .signals
                .iter()
                .cloned()
                .map(|signal| wait_cancelled(signal).boxed());
            future::select_all(waits).await;
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                () = signalled => Cancelled::Cancelled,
                () = tokio::time::sleep_until(deadline) => Cancelled::DeadlineExceeded,
            },
            None => {
                signalled.await;
                Cancelled::Cancelled
            }
        }
    }

    /// Sleep for `duration`, returning early with the reason if the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            cancelled = self.done() => Err(cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

async fn wait_cancelled(mut signal: watch::Receiver<bool>) {
    // A dropped canceller can no longer cancel.
    if signal.wait_for(|cancelled| *cancelled).await.is_err() {
        future::pending::<()>().await;
    }
}
