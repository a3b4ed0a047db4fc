//! Background worker for timed operations
//!
//! Wakes every tick and starts the timed operations that have become due.
//! Holds only a weak reference to the manager, and exits when the manager is
//! dropped or asks it to stop.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{EtxError, Result};
use super::manager::{Shared, TransactionManager};

/// Handle to the worker thread
pub(crate) struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(shared: Weak<Shared>, tick: Duration) -> Result<Self> {
        let (shutdown, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(String::from("etx-worker"))
            .spawn(move || worker_loop(shared, rx, tick))
            .map_err(|e| EtxError::Internal(format!("cannot start worker: {}", e)))?;

        Ok(Self { shutdown, thread })
    }

    /// Stop the worker and wait for it, unless called from the worker itself
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        if self.thread.thread().id() != thread::current().id() && self.thread.join().is_err() {
            log::error!("etx worker panicked");
        }
    }
}

fn worker_loop(shared: Weak<Shared>, shutdown: mpsc::Receiver<()>, tick: Duration) {
    log::info!("etx worker started (tick {:?})", tick);

    loop {
        match shutdown.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let shared: Arc<Shared> = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        TransactionManager::from_shared(shared).poll_timed();
    }

    log::info!("etx worker shutting down");
}
