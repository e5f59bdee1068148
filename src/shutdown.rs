//! Cooperative cancellation for measurement delays.
//!
//! A `ShutdownSignal` is a cloneable handle around a `tokio::sync::watch`
//! channel. Controllers hold one and race their settling delays against it,
//! so a Ctrl-C (or any other trigger) aborts a sweep at the next delay
//! instead of after the full settling interval.

use crate::error::{AppResult, DaqError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Cloneable cancellation signal shared by controllers and sweep drivers.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Fires the signal for every clone.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once `trigger` has been called on any clone.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when the signal fires.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives in `self`, so `wait_for` can only fail after drop.
        let _ = receiver.wait_for(|fired| *fired).await;
    }

    /// Returns `Cancelled` if the signal has fired.
    pub fn check(&self) -> AppResult<()> {
        if self.is_triggered() {
            Err(DaqError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless the signal fires first.
    pub async fn sleep(&self, duration: Duration) -> AppResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(DaqError::Cancelled),
        }
    }
}

/// Why [`forward_interrupts`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// A second interrupt arrived after the signal had been triggered.
    Forced,
    /// The interrupt source failed before a second interrupt arrived.
    SourceClosed,
}

/// Triggers `shutdown` on the first interrupt and waits for a second one.
///
/// `next_interrupt` resolves once per interrupt (e.g. `tokio::signal::ctrl_c`).
/// The caller decides what a [`InterruptOutcome::Forced`] return means,
/// typically exiting without waiting for teardown.
pub async fn forward_interrupts<F, Fut>(
    shutdown: &ShutdownSignal,
    mut next_interrupt: F,
) -> InterruptOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = next_interrupt().await {
        warn!("Interrupt handler unavailable: {}", e);
        return InterruptOutcome::SourceClosed;
    }
    warn!("Interrupt received, stopping sweep and releasing instruments (interrupt again to force exit)");
    shutdown.trigger();

    match next_interrupt().await {
        Ok(()) => InterruptOutcome::Forced,
        Err(e) => {
            warn!("Interrupt handler unavailable: {}", e);
            InterruptOutcome::SourceClosed
        }
    }
}
