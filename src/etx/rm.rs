use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use super::manager::TransactionManager;
use super::types::{OpId, OpType};

/// Arguments of an operation.
///
/// The transaction manager never looks inside an operation. It only stores the
/// encoded form in the redo log and hands the value back to its resource manager.
/// Implemented for every serializable type, with JSON as the stored encoding.
pub trait Op: Any + Send + Sync + fmt::Debug {
    /// Encode for the redo log
    fn encode(&self) -> Result<Vec<u8>>;

    /// Replace this value with one decoded from the redo log
    fn decode(&mut self, data: &[u8]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> Op for T
where
    T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug,
{
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(&mut self, data: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(data)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<'a> dyn Op + 'a {
    /// Get the concrete operation, if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A resource manager implements one family of operations.
///
/// Operations must either be database transactions or idempotent: after a restart
/// an operation that had not reached [`TransactionManager::end`] runs again.
pub trait ResourceManager: Send + Sync {
    /// Manager name, stored in the redo log. Must never change once records
    /// exist under it.
    fn name(&self) -> &str;

    /// Return an empty operation of the given type, to receive decoded data
    fn for_operation(&self, op_type: OpType) -> Box<dyn Op>;

    /// Execute an operation.
    ///
    /// Must call `tm.end(id)` exactly once, either before returning or later from
    /// another thread (clone `tm` for that), even if the operation fails.
    /// The transaction stalls until it does.
    fn operation(&self, tm: &TransactionManager, id: OpId, op_type: OpType, op: &dyn Op);
}
