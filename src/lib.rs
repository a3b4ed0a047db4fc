//! etx - extended transactions over a redo log
//!
//! An extended transaction is a chain of operations that must all eventually
//! run, even if the process crashes between them. Each operation is recorded in
//! a redo store before it can run and its record is deleted when it ends, so on
//! restart the manager replays whatever is left.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Application request handlers               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  begin / add_next / add_timed
//!                              ▼  execute / end / forget
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Transaction Manager                       │
//! │   (operation cache, dispatch loop, recovery, timed worker)  │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │    Resource Managers     │ │         Redo Store             │
//! │ (do the work, call end)  │ │   (memory or append-only file) │
//! └──────────────────────────┘ └────────────────────────────────┘

pub mod error;
pub mod etx;
pub mod store;

pub use error::{ErrorClass, EtxError, Result};
pub use etx::{
    EtxConfig, Op, OpId, OpType, PendingOp, RecoveryReport, Redo, RedoKind, ResourceManager,
    TransactionManager, TxId, TxState, MAX_DELAY_SECS,
};
pub use store::{FileRedoStore, FileStoreConfig, MemoryRedoStore, RedoStore};
