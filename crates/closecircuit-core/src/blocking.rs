//! Cancellable bridge for blocking work.
//!
//! Blocking calls run on tokio's blocking pool while the async caller waits
//! for either the result or its cancellation token. A cancelled caller returns
//! immediately with [`BlockingError::Cancelled`]; the worker sees the raised
//! [`Interrupt`] and is expected to bail out at its next check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Errors surfaced by [`run_blocking_cancellable`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockingError {
    /// The caller was cancelled before the work finished
    #[error("Blocking operation cancelled")]
    Cancelled,

    /// The blocking closure panicked
    #[error("Blocking operation panicked")]
    Panicked,
}

impl BlockingError {
    /// Cancellation is a normal unwind path, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BlockingError::Cancelled)
    }
}

/// Interrupt flag handed to the blocking closure.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Returns true once the waiting caller has been cancelled
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs `work` on the blocking pool, abandoning it if `cancel` fires first.
pub async fn run_blocking_cancellable<T, F>(
    cancel: &CancellationToken,
    work: F,
) -> Result<T, BlockingError>
where
    F: FnOnce(&Interrupt) -> T + Send + 'static,
    T: Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(BlockingError::Cancelled);
    }

    let interrupt = Interrupt::default();
    let worker_interrupt = interrupt.clone();
    let mut handle = tokio::task::spawn_blocking(move || work(&worker_interrupt));

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            interrupt.raise();
            // Only prevents the closure from starting; a running closure
            // observes the interrupt instead.
            handle.abort();
            debug!("Blocking operation interrupted");
            Err(BlockingError::Cancelled)
        }
        joined = &mut handle => match joined {
            Ok(value) => Ok(value),
            Err(e) if e.is_cancelled() => Err(BlockingError::Cancelled),
            Err(e) => {
                error!(error = %e, "Blocking operation panicked");
                Err(BlockingError::Panicked)
            }
        },
    }
}
