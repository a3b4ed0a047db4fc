//! Extended transaction manager
//!
//! An extended transaction is a sequence of operations that may span server
//! restarts. A request handler typically makes its database changes, adds the
//! rest of the work as operations, commits, and then asks the manager to run
//! them. Each operation is logged in the redo store before it is relied upon and
//! its record is deleted when the operation ends, so after a crash every
//! operation that had not ended runs again.
//!
//! ## Operation kinds
//! - **Next** operations run in the order they were added, each as soon as the
//!   previous operation of the transaction has ended.
//! - **Timed** operations run in due order, no earlier than their delay after
//!   the transaction began. Pending next operations always go first.
//!
//! At most one operation per transaction runs at a time. Resource managers are
//! called without the manager's lock held, so they may block, do I/O, or call
//! back into the manager from any thread.
//!
//! ## Usage
//! 1. `begin` a transaction
//! 2. make database changes and `add_next`/`add_timed` operations, with the
//!    redo records written in the same database transaction
//! 3. commit, then `execute`
//! 4. each operation calls `end` when its effects are durable
//!
//! ## Recovery
//! On startup `recover` reads the whole redo store, rebuilds the cache and
//! restarts the first operation of each transaction. The rest of each
//! transaction follows as operations end, exactly as in normal running, so a
//! restart with many pending transactions does not start everything at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::error::{EtxError, Result};
use crate::store::RedoStore;
use super::cache::{CachedOp, EtxOps, PendingOp};
use super::config::EtxConfig;
use super::log::{Redo, RedoKind};
use super::recovery::{self, RecoveryReport};
use super::rm::{Op, ResourceManager};
use super::types::{nanos_since_epoch, OpId, OpType, TxId, TxState};
use super::worker::WorkerHandle;

/// Cache and id counter, guarded by one mutex
pub(crate) struct TmState {
    pub etxs: HashMap<TxId, EtxOps>,
    pub last_id: i64,
}

pub(crate) struct Shared {
    store: Arc<dyn RedoStore>,
    config: EtxConfig,
    state: Mutex<TmState>,
    worker: Mutex<Option<WorkerHandle>>,
}

/// The transaction manager.
///
/// Cloning gives another handle to the same manager. The background worker
/// stops when the last handle is dropped, or on [`TransactionManager::shutdown`].
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<Shared>,
}

impl TransactionManager {
    /// Create a transaction manager over a redo store with default config
    pub fn new(store: Arc<dyn RedoStore>) -> Result<Self> {
        Self::with_config(store, EtxConfig::default())
    }

    /// Create a transaction manager and start its background worker, if configured
    pub fn with_config(store: Arc<dyn RedoStore>, config: EtxConfig) -> Result<Self> {
        let tick = config.worker_tick();
        let tm = Self {
            shared: Arc::new(Shared {
                store,
                config,
                state: Mutex::new(TmState {
                    etxs: HashMap::with_capacity(8),
                    last_id: 0,
                }),
                worker: Mutex::new(None),
            }),
        };

        if let Some(tick) = tick {
            let handle = WorkerHandle::spawn(Arc::downgrade(&tm.shared), tick)?;
            *lock(&tm.shared.worker) = Some(handle);
        }

        Ok(tm)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Configuration the manager was created with
    pub fn config(&self) -> &EtxConfig {
        &self.shared.config
    }

    /// Begin a new extended transaction.
    ///
    /// Nothing is stored until an operation is added.
    pub fn begin(&self) -> TxId {
        TxId::from(self.new_id())
    }

    /// Add an operation to run after the previous one.
    ///
    /// Database changes for the current step may have been requested but must not
    /// be committed yet: the redo record goes into the store first.
    pub fn add_next(
        &self,
        tx: TxId,
        rm: &Arc<dyn ResourceManager>,
        op_type: OpType,
        op: impl Op,
    ) -> Result<OpId> {
        self.add_op(tx, rm, RedoKind::Next, 0, op_type, Arc::new(op))
    }

    /// Add an operation to run `after` the transaction began.
    ///
    /// The delay has a resolution of one second, at least one second, and is
    /// clamped to the configured maximum.
    pub fn add_timed(
        &self,
        tx: TxId,
        rm: &Arc<dyn ResourceManager>,
        op_type: OpType,
        op: impl Op,
        after: Duration,
    ) -> Result<OpId> {
        let mut delay = (after.as_secs_f64().round() as u64).max(1);
        if delay > self.shared.config.max_delay_secs {
            log::warn!(
                "Delay of {}s for {} operation {} clamped to {}s",
                delay,
                rm.name(),
                op_type,
                self.shared.config.max_delay_secs
            );
            delay = self.shared.config.max_delay_secs;
        }
        let delay = i64::try_from(delay).unwrap_or(i64::MAX);
        self.add_op(tx, rm, RedoKind::Timed, delay, op_type, Arc::new(op))
    }

    /// Run the transaction's next operations.
    ///
    /// Call after committing the database changes of the first step. Operations
    /// that end synchronously are followed by the next one, until one runs
    /// asynchronously or none is ready.
    pub fn execute(&self, tx: TxId) {
        self.run(tx, false);
    }

    /// End the current operation of its transaction.
    ///
    /// The caller guarantees the operation's effects are durable, so it will not
    /// run again. If the operation was running asynchronously the transaction
    /// continues from here with its next ready operation.
    pub fn end(&self, id: OpId) -> Result<()> {
        let tx = id.tx();

        {
            let mut state = self.lock_state();
            let etx = match state.etxs.get_mut(&tx) {
                Some(etx) => etx,
                None => return Err(EtxError::InvalidOperation(id)),
            };
            check_current(etx, id)?;
        }

        // the record goes first: if this fails the operation is still running
        self.shared.store.delete_id(id.seq())?;

        let resume = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let etx = match state.etxs.get_mut(&tx) {
                Some(etx) => etx,
                None => return Err(EtxError::AlreadyEnded(id)),
            };
            check_current(etx, id).map_err(|_| EtxError::AlreadyEnded(id))?;

            if let Some(op) = etx.current_op_mut() {
                op.rm = None;
            }
            etx.active = false;
            log::debug!("Ended operation {}", id);

            if etx.dispatching {
                // the dispatch loop that called the manager carries on
                false
            } else if etx.is_exhausted() {
                state.etxs.remove(&tx);
                false
            } else {
                true
            }
        };

        if resume {
            self.run(tx, true);
        }
        Ok(())
    }

    /// Discard every pending operation of a manager and type in a transaction.
    ///
    /// Forgetting operations that don't exist, or were already forgotten, does
    /// nothing. An operation that is already running is not affected.
    pub fn forget(&self, tx: TxId, rm: &Arc<dyn ResourceManager>, op_type: OpType) -> Result<()> {
        let ids = {
            let state = self.lock_state();
            match state.etxs.get(&tx) {
                Some(etx) => etx.matching(rm.name(), op_type),
                None => return Ok(()),
            }
        };
        if ids.is_empty() {
            return Ok(());
        }

        let mut deleted = Vec::with_capacity(ids.len());
        let mut failure = None;
        for id in ids {
            match self.shared.store.delete_id(id) {
                Ok(()) => deleted.push(id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if let Some(etx) = state.etxs.get_mut(&tx) {
                for id in &deleted {
                    etx.tombstone(*id);
                }
                if etx.is_exhausted() {
                    state.etxs.remove(&tx);
                }
            }
        }
        log::debug!("Forgot {} {} operation(s) of type {} in {}", deleted.len(), rm.name(), op_type, tx);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rebuild the cache from the redo store after a restart, and restart the
    /// first operation of each transaction.
    ///
    /// Every manager named in the store must be supplied. A record whose
    /// operation can't be decoded is logged and left in the store.
    pub fn recover(&self, managers: &[Arc<dyn ResourceManager>]) -> Result<RecoveryReport> {
        let records = self.shared.store.all()?;
        let (recovered, report) = recovery::replay(records, managers)?;

        let txs: Vec<TxId> = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            state.last_id = state.last_id.max(report.max_id);

            let txs: Vec<TxId> = recovered.keys().copied().collect();
            for (tx, ops) in recovered {
                let etx = state.etxs.entry(tx).or_insert_with(EtxOps::new);
                for (kind, op) in ops {
                    if !etx.contains(op.id) {
                        etx.push(kind, op);
                    }
                }
            }
            txs
        };

        for tx in txs {
            self.run(tx, false);
        }
        Ok(report)
    }

    /// Start every timed operation that is due, in every transaction.
    ///
    /// Called by the background worker on each tick.
    pub fn poll_timed(&self) {
        let txs: Vec<TxId> = self.lock_state().etxs.keys().copied().collect();
        for tx in txs {
            self.run(tx, true);
        }
    }

    /// Redo records of a manager for transactions started before `before`.
    ///
    /// Transactions that stay in the store long after they began have usually
    /// stalled on an operation that never ended.
    pub fn stalled(&self, manager: &str, before: SystemTime) -> Result<Vec<Redo>> {
        self.shared.store.for_manager(manager, nanos_since_epoch(before))
    }

    /// Whether the operation is still recorded in the redo store, i.e. has not ended
    pub fn is_pending(&self, id: OpId) -> Result<bool> {
        Ok(self.shared.store.get_if(id.seq())?.is_some())
    }

    /// Live cached operations of a transaction
    pub fn pending(&self, tx: TxId) -> Vec<PendingOp> {
        match self.lock_state().etxs.get(&tx) {
            Some(etx) => etx.pending(tx),
            None => Vec::new(),
        }
    }

    /// Scheduling state of a transaction
    pub fn state(&self, tx: TxId) -> TxState {
        match self.lock_state().etxs.get(&tx) {
            Some(etx) => etx.state(),
            None => TxState::NoEntry,
        }
    }

    /// Check if a transaction has operations pending or running
    pub fn contains(&self, tx: TxId) -> bool {
        self.lock_state().etxs.contains_key(&tx)
    }

    /// Number of transactions with operations pending or running
    pub fn transaction_count(&self) -> usize {
        self.lock_state().etxs.len()
    }

    /// Stop the background worker and wait for it to finish
    pub fn shutdown(&self) {
        let handle = lock(&self.shared.worker).take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TmState> {
        lock(&self.shared.state)
    }

    /// New transaction or operation id: the current time in nanoseconds, moved
    /// past the last id issued if the clock hasn't advanced
    fn new_id(&self) -> i64 {
        let now = nanos_since_epoch(SystemTime::now());
        let mut state = self.lock_state();
        let id = now.max(state.last_id + 1);
        state.last_id = id;
        id
    }

    fn add_op(
        &self,
        tx: TxId,
        rm: &Arc<dyn ResourceManager>,
        kind: RedoKind,
        delay: i64,
        op_type: OpType,
        op: Arc<dyn Op>,
    ) -> Result<OpId> {
        let id = self.new_id();
        let redo = Redo {
            id,
            tx: tx.into(),
            manager: rm.name().to_string(),
            kind,
            delay,
            op_type,
            operation: op.encode()?,
        };
        let due = redo.due().ok_or_else(|| {
            EtxError::Internal(format!("delay of {}s is beyond the clock's range", delay))
        })?;

        // logged before it is cached, so a store failure leaves no trace
        self.shared.store.insert(&redo)?;

        let mut state = self.lock_state();
        state.etxs.entry(tx).or_insert_with(EtxOps::new).push(
            kind,
            CachedOp {
                id,
                rm: Some(Arc::clone(rm)),
                due,
                op_type,
                op,
            },
        );
        log::debug!("Added {} {} operation {} to {}", kind, rm.name(), op_type, tx);

        Ok(OpId::new(tx, id))
    }

    /// Keep dispatching while operations end synchronously
    fn run(&self, tx: TxId, allow_timed: bool) {
        while self.do_next(tx, allow_timed) {}
    }

    /// Dispatch the transaction's next ready operation.
    ///
    /// Returns true if an operation ended before its resource manager returned,
    /// so the caller should look for another one. Looping in the caller rather
    /// than recursing through `end` keeps the stack flat however long the
    /// chain of synchronous operations.
    fn do_next(&self, tx: TxId, allow_timed: bool) -> bool {
        let dispatch = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let etx = match state.etxs.get_mut(&tx) {
                Some(etx) => etx,
                None => return false,
            };
            if etx.active {
                return false;
            }

            etx.compact();
            if etx.is_exhausted() {
                state.etxs.remove(&tx);
                return false;
            }

            let (is_timed, index) = match etx.next_ready(allow_timed, SystemTime::now()) {
                Some(next) => next,
                None => return false,
            };
            match etx.start(is_timed, index) {
                Some(dispatch) => dispatch,
                None => return false,
            }
        };

        let id = OpId::new(tx, dispatch.id);
        log::debug!("Dispatching {} operation {} as {}", dispatch.rm.name(), dispatch.op_type, id);
        dispatch.rm.operation(self, id, dispatch.op_type, dispatch.op.as_ref());

        let mut state = self.lock_state();
        match state.etxs.get_mut(&tx) {
            Some(etx) => {
                etx.dispatching = false;
                !etx.active
            }
            None => false,
        }
    }
}

/// Check that `id` is the running operation of its transaction
fn check_current(etx: &mut EtxOps, id: OpId) -> Result<()> {
    let active = etx.active;
    match etx.current_op_mut() {
        Some(op) if op.id == id.seq() => {
            if active && op.rm.is_some() {
                Ok(())
            } else {
                Err(EtxError::AlreadyEnded(id))
            }
        }
        _ => Err(EtxError::InvalidOperation(id)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
