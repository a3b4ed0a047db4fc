//! Redo log record structures

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use super::types::{OpId, OpType, TxId};

/// How an operation is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedoKind {
    /// Runs as soon as the previous operation of the transaction has ended
    Next,
    /// Runs no earlier than a delay after the transaction began
    Timed,
}

impl RedoKind {
    /// Stable numeric code, for stores that keep the kind in an integer column
    pub fn code(&self) -> i32 {
        match self {
            RedoKind::Next => 1,
            RedoKind::Timed => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(RedoKind::Next),
            2 => Some(RedoKind::Timed),
            _ => None,
        }
    }
}

impl fmt::Display for RedoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedoKind::Next => write!(f, "next"),
            RedoKind::Timed => write!(f, "timed"),
        }
    }
}

/// Stored data for one pending operation.
///
/// A record exists in the store exactly as long as its operation has not ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redo {
    /// Operation id
    pub id: i64,
    /// Transaction id
    pub tx: i64,
    /// Resource manager name
    pub manager: String,
    /// Scheduling kind
    pub kind: RedoKind,
    /// Timed delay after the transaction start, in seconds
    pub delay: i64,
    /// Operation type, owned by the resource manager
    pub op_type: OpType,
    /// Operation arguments, in JSON
    pub operation: Vec<u8>,
}

impl Redo {
    pub fn op_id(&self) -> OpId {
        OpId::new(TxId::from(self.tx), self.id)
    }

    /// When the operation becomes ready to run, or None if the delay is
    /// beyond what the clock can represent
    pub fn due(&self) -> Option<SystemTime> {
        TxId::from(self.tx)
            .timestamp()
            .checked_add(Duration::from_secs(self.delay.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn sample() -> Redo {
        Redo {
            id: 1_000_000_005,
            tx: 1_000_000_000,
            manager: "uploader".to_string(),
            kind: RedoKind::Timed,
            delay: 30,
            op_type: 2,
            operation: br#"{"file":"P-abc-img.jpg"}"#.to_vec(),
        }
    }

    #[test]
    fn test_redo_serialization() {
        let redo = sample();
        let serialized = bincode::serialize(&redo).unwrap();
        let deserialized: Redo = bincode::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, redo);
    }

    #[test]
    fn test_redo_due_time() {
        let redo = sample();
        let expected = UNIX_EPOCH + Duration::from_nanos(1_000_000_000) + Duration::from_secs(30);
        assert_eq!(redo.due(), Some(expected));
    }

    #[test]
    fn test_redo_due_out_of_range() {
        let mut redo = sample();
        redo.delay = i64::MAX;
        assert_eq!(redo.due(), None);

        // a negative delay counts as none
        redo.delay = -5;
        assert_eq!(redo.due(), Some(TxId::from(redo.tx).timestamp()));
    }

    #[test]
    fn test_redo_op_id() {
        let redo = sample();
        let id = redo.op_id();
        assert_eq!(i64::from(id.tx()), redo.tx);
        assert_eq!(id.seq(), redo.id);
    }

    #[test]
    fn test_redo_kind_codes() {
        assert_eq!(RedoKind::from_code(RedoKind::Next.code()), Some(RedoKind::Next));
        assert_eq!(RedoKind::from_code(RedoKind::Timed.code()), Some(RedoKind::Timed));
        assert_eq!(RedoKind::from_code(0), None);
        assert_eq!(RedoKind::Timed.to_string(), "timed");
    }
}
