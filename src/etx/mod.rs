//! Extended transactions
//!
//! Multi-step operation sequences that survive restarts, driven by a redo log

pub mod types;
pub mod log;
pub mod rm;
pub mod config;
pub mod manager;
pub mod recovery;
pub(crate) mod cache;
mod worker;

// Public API
pub use types::*;
pub use log::{Redo, RedoKind};
pub use rm::{Op, ResourceManager};
pub use config::{EtxConfig, MAX_DELAY_SECS};
pub use manager::TransactionManager;
pub use recovery::RecoveryReport;
pub use cache::PendingOp;
