//! OS signal handling.
//!
//! SIGINT/SIGTERM are turned into a single message on a channel; the async
//! side consumes it and runs cleanup. A second signal while cleanup is
//! still running exits the process immediately.

use async_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Exit status used when a repeated signal cuts cleanup short.
pub const FORCED_EXIT_CODE: i32 = 130;

/// What the signal handler should do for one received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cleanup has been requested
    Cleanup,
    /// Repeated signal: exit without waiting
    ForceExit,
}

/// Sending side, owned by the OS signal handler.
#[derive(Debug, Clone)]
pub struct SignalTrigger {
    tx: Sender<()>,
    received: Arc<AtomicUsize>,
}

impl SignalTrigger {
    /// Record one signal and decide how to react to it.
    pub fn raise(&self) -> SignalAction {
        let count = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 {
            let _ = self.tx.try_send(());
            SignalAction::Cleanup
        } else {
            SignalAction::ForceExit
        }
    }
}

/// Receiving side: resolves once a termination signal has been raised.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
    received: Arc<AtomicUsize>,
}

impl ShutdownSignal {
    /// Wait for the first termination signal without polling.
    pub async fn recv(&self) {
        if self.rx.recv().await.is_err() {
            // Trigger dropped without firing; never resolve
            futures::future::pending::<()>().await;
        }
    }

    pub fn was_raised(&self) -> bool {
        self.received.load(Ordering::Acquire) > 0
    }
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (SignalTrigger, ShutdownSignal) {
    let (tx, rx) = async_channel::bounded(1);
    let received = Arc::new(AtomicUsize::new(0));
    (
        SignalTrigger {
            tx,
            received: received.clone(),
        },
        ShutdownSignal { rx, received },
    )
}

/// Register the process-wide SIGINT/SIGTERM handler.
///
/// Can only be called once per process.
pub fn install() -> Result<ShutdownSignal, ctrlc::Error> {
    let (trigger, signal) = channel();

    ctrlc::set_handler(move || match trigger.raise() {
        SignalAction::Cleanup => {
            tracing::warn!("Termination signal received, releasing tunnel and pool");
        }
        SignalAction::ForceExit => {
            eprintln!("Second termination signal received, exiting without cleanup");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })?;

    Ok(signal)
}
