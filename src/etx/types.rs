//! Identifiers and per-transaction state

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{EtxError, Result};

/// Application-defined operation type, interpreted only by its resource manager
pub type OpType = i32;

/// Extended transaction identifier.
///
/// The id is the transaction's start time in nanoseconds since the Unix epoch,
/// so it also serves as a creation timestamp and a sortable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(i64);

impl TxId {
    /// Transaction id for a transaction started at `at`
    pub fn from_timestamp(at: SystemTime) -> Self {
        TxId(nanos_since_epoch(at))
    }

    /// Start time of the transaction
    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.0.max(0) as u64)
    }

    /// Compact textual code for the transaction.
    ///
    /// Base-36 with the characters reversed, so that codes for transactions
    /// started close together do not look alike (they end up in file names).
    pub fn to_code(&self) -> String {
        to_base36(self.0).chars().rev().collect()
    }

    /// Parse a code produced by [`TxId::to_code`].
    ///
    /// Only lowercase base-36 digits are accepted, so every transaction has
    /// exactly one code.
    pub fn from_code(code: &str) -> Result<Self> {
        let canonical = !code.is_empty()
            && code.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase());
        if !canonical {
            return Err(EtxError::BadCode(code.to_string()));
        }

        let forward: String = code.chars().rev().collect();
        i64::from_str_radix(&forward, 36)
            .map(TxId)
            .map_err(|_| EtxError::BadCode(code.to_string()))
    }
}

impl From<i64> for TxId {
    fn from(id: i64) -> Self {
        TxId(id)
    }
}

impl From<TxId> for i64 {
    fn from(tx: TxId) -> Self {
        tx.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_code())
    }
}

impl FromStr for TxId {
    type Err = EtxError;

    fn from_str(s: &str) -> Result<Self> {
        TxId::from_code(s)
    }
}

/// Operation identifier: one redo record, owned by one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    tx: TxId,
    seq: i64,
}

impl OpId {
    pub fn new(tx: TxId, seq: i64) -> Self {
        Self { tx, seq }
    }

    /// The transaction that owns this operation
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// The redo record id
    pub fn seq(&self) -> i64 {
        self.seq
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tx, self.seq)
    }
}

/// Scheduling state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No pending operations are cached for the transaction
    NoEntry,
    /// Operations are pending, none is running
    Idle,
    /// An immediate operation has been dispatched and not yet ended
    ActiveImmediate,
    /// A timed operation has been dispatched and not yet ended
    ActiveTimed,
}

impl TxState {
    pub fn is_active(&self) -> bool {
        matches!(self, TxState::ActiveImmediate | TxState::ActiveTimed)
    }
}

pub(crate) fn nanos_since_epoch(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_nanos() as i64,
        Err(_) => 0,
    }
}

fn to_base36(n: i64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }
    let mut v = n.unsigned_abs();
    let mut buf = Vec::with_capacity(14);
    while v > 0 {
        buf.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    if n < 0 {
        buf.push(b'-');
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}
