//! Per-transaction operation cache
//!
//! The cache is derived state: it can be rebuilt at any time by replaying the
//! redo store. Ended and forgotten operations are tombstoned in place (their
//! resource manager is cleared) and only drained from the front of a sequence
//! while the transaction is idle, so that the index of the running operation
//! never moves.

use std::sync::Arc;
use std::time::SystemTime;

use super::log::RedoKind;
use super::rm::{Op, ResourceManager};
use super::types::{OpId, OpType, TxId, TxState};

/// A cached operation
pub(crate) struct CachedOp {
    pub id: i64,
    /// None once the operation has ended or been forgotten
    pub rm: Option<Arc<dyn ResourceManager>>,
    pub due: SystemTime,
    pub op_type: OpType,
    pub op: Arc<dyn Op>,
}

impl CachedOp {
    fn is_live(&self) -> bool {
        self.rm.is_some()
    }
}

/// Everything needed to call a resource manager outside the lock
pub(crate) struct Dispatch {
    pub id: i64,
    pub rm: Arc<dyn ResourceManager>,
    pub op_type: OpType,
    pub op: Arc<dyn Op>,
}

/// A live operation, as reported to monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub id: OpId,
    pub manager: String,
    pub kind: RedoKind,
    pub op_type: OpType,
    pub due: SystemTime,
}

/// Cached operations and scheduling state for one transaction
pub(crate) struct EtxOps {
    pub immediate: Vec<CachedOp>,
    pub timed: Vec<CachedOp>,
    /// Index of the last dispatched operation, in `timed` if `is_timed`
    pub current: Option<usize>,
    pub is_timed: bool,
    /// An operation has been dispatched and not ended
    pub active: bool,
    /// `timed` is in due order
    pub sorted: bool,
    /// A resource manager call for this transaction is still on the stack.
    /// An `end` arriving meanwhile leaves continuation to the dispatch loop.
    pub dispatching: bool,
}

impl EtxOps {
    pub fn new() -> Self {
        Self {
            immediate: Vec::with_capacity(4),
            timed: Vec::with_capacity(4),
            current: None,
            is_timed: false,
            active: false,
            sorted: true,
            dispatching: false,
        }
    }

    pub fn push(&mut self, kind: RedoKind, op: CachedOp) {
        match kind {
            RedoKind::Next => self.immediate.push(op),
            RedoKind::Timed => {
                self.timed.push(op);
                self.sorted = false;
            }
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.immediate.iter().chain(self.timed.iter()).any(|op| op.id == id)
    }

    pub fn has_live(&self) -> bool {
        self.immediate.iter().chain(self.timed.iter()).any(CachedOp::is_live)
    }

    /// True when the transaction has nothing left to run and nothing running
    pub fn is_exhausted(&self) -> bool {
        !self.active && !self.has_live()
    }

    pub fn state(&self) -> TxState {
        match (self.active, self.is_timed) {
            (false, _) => TxState::Idle,
            (true, false) => TxState::ActiveImmediate,
            (true, true) => TxState::ActiveTimed,
        }
    }

    /// Drop tombstones from the front of both sequences. Only while idle.
    pub fn compact(&mut self) {
        if self.active {
            return;
        }
        for ops in [&mut self.immediate, &mut self.timed] {
            let dead = ops.iter().take_while(|op| !op.is_live()).count();
            if dead > 0 {
                ops.drain(..dead);
            }
        }
        self.current = None;
    }

    /// Find the next operation to dispatch, as (is_timed, index).
    ///
    /// Immediate operations always come first. A timed operation is only
    /// considered when `allow_timed` is set and it is due by `now`.
    pub fn next_ready(&mut self, allow_timed: bool, now: SystemTime) -> Option<(bool, usize)> {
        if self.active {
            return None;
        }
        if let Some(index) = self.immediate.iter().position(CachedOp::is_live) {
            return Some((false, index));
        }
        if !allow_timed {
            return None;
        }
        if !self.sorted {
            // stable, so equal due times keep their append order
            self.timed.sort_by_key(|op| op.due);
            self.sorted = true;
        }
        let index = self.timed.iter().position(CachedOp::is_live)?;
        if self.timed[index].due > now {
            return None;
        }
        Some((true, index))
    }

    /// Mark the selected operation as running, returning what to call
    pub fn start(&mut self, is_timed: bool, index: usize) -> Option<Dispatch> {
        let ops = if is_timed { &self.timed } else { &self.immediate };
        let op = ops.get(index)?;
        let dispatch = Dispatch {
            id: op.id,
            rm: Arc::clone(op.rm.as_ref()?),
            op_type: op.op_type,
            op: Arc::clone(&op.op),
        };
        self.current = Some(index);
        self.is_timed = is_timed;
        self.active = true;
        self.dispatching = true;
        Some(dispatch)
    }

    /// The last dispatched operation
    pub fn current_op_mut(&mut self) -> Option<&mut CachedOp> {
        let index = self.current?;
        if self.is_timed {
            self.timed.get_mut(index)
        } else {
            self.immediate.get_mut(index)
        }
    }

    fn is_running(&self, is_timed: bool, index: usize) -> bool {
        self.active && self.is_timed == is_timed && self.current == Some(index)
    }

    /// Ids of live, not running operations of a manager and type
    pub fn matching(&self, manager: &str, op_type: OpType) -> Vec<i64> {
        let mut ids = Vec::new();
        for (is_timed, ops) in [(false, &self.immediate), (true, &self.timed)] {
            for (index, op) in ops.iter().enumerate() {
                let matches = match &op.rm {
                    Some(rm) => rm.name() == manager && op.op_type == op_type,
                    None => false,
                };
                if matches && !self.is_running(is_timed, index) {
                    ids.push(op.id);
                }
            }
        }
        ids
    }

    /// Tombstone a live operation that is not running. Returns false if there
    /// was nothing to tombstone.
    pub fn tombstone(&mut self, id: i64) -> bool {
        for is_timed in [false, true] {
            let position = {
                let ops = if is_timed { &self.timed } else { &self.immediate };
                ops.iter().position(|op| op.id == id)
            };
            if let Some(index) = position {
                if self.is_running(is_timed, index) {
                    return false;
                }
                let ops = if is_timed { &mut self.timed } else { &mut self.immediate };
                return ops[index].rm.take().is_some();
            }
        }
        false
    }

    pub fn pending(&self, tx: TxId) -> Vec<PendingOp> {
        let immediate = self.immediate.iter().map(|op| (RedoKind::Next, op));
        let timed = self.timed.iter().map(|op| (RedoKind::Timed, op));
        immediate
            .chain(timed)
            .filter_map(|(kind, op)| {
                op.rm.as_ref().map(|rm| PendingOp {
                    id: OpId::new(tx, op.id),
                    manager: rm.name().to_string(),
                    kind,
                    op_type: op.op_type,
                    due: op.due,
                })
            })
            .collect()
    }
}
