//! Redo log replay

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{EtxError, Result};
use super::cache::CachedOp;
use super::log::{Redo, RedoKind};
use super::rm::ResourceManager;
use super::types::TxId;

/// What recovery found in the redo store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records read from the store
    pub records: usize,
    /// Operations restored to the cache
    pub restored: usize,
    /// Records left in the store, either undecodable or behind an undecodable
    /// record of the same transaction
    pub skipped: usize,
    /// Transactions stopped at an undecodable record
    pub stalled: usize,
    /// Transactions with restored operations
    pub transactions: usize,
    /// Highest record id seen
    pub max_id: i64,
}

/// Operations to cache, per transaction, in record id order
pub(crate) type Recovered = BTreeMap<TxId, Vec<(RedoKind, CachedOp)>>;

/// Decode redo records into cached operations.
///
/// Fails if a record names a manager that isn't in `managers`. A record whose
/// operation fails to decode, or whose due time is out of range, is logged and
/// skipped; it stays in the store for the next recovery, and its transaction
/// stops there: later records of the same transaction are left in the store too.
pub(crate) fn replay(
    mut records: Vec<Redo>,
    managers: &[Arc<dyn ResourceManager>],
) -> Result<(Recovered, RecoveryReport)> {
    let rms: HashMap<&str, &Arc<dyn ResourceManager>> =
        managers.iter().map(|rm| (rm.name(), rm)).collect();

    if !records.is_empty() {
        log::info!("Starting recovery of {} redo records...", records.len());
    }

    records.sort_by_key(|r| r.id);

    let mut recovered: Recovered = BTreeMap::new();
    let mut stalled: HashSet<TxId> = HashSet::new();
    let mut report = RecoveryReport {
        records: records.len(),
        ..Default::default()
    };

    for r in records {
        report.max_id = report.max_id.max(r.id);

        let rm = match rms.get(r.manager.as_str()) {
            Some(rm) => Arc::clone(rm),
            None => return Err(EtxError::UnknownManager(r.manager)),
        };

        let tx = TxId::from(r.tx);
        if stalled.contains(&tx) {
            report.skipped += 1;
            continue;
        }

        let due = match r.due() {
            Some(due) => due,
            None => {
                log::warn!(
                    "Skipping {} operation {} in transaction {}: delay of {}s is out of range",
                    r.manager,
                    r.id,
                    tx,
                    r.delay
                );
                stalled.insert(tx);
                report.skipped += 1;
                continue;
            }
        };

        let mut op = rm.for_operation(r.op_type);
        if let Err(e) = op.decode(&r.operation) {
            log::warn!(
                "Skipping {} operation {} in transaction {}: {}",
                r.manager,
                r.id,
                tx,
                e
            );
            stalled.insert(tx);
            report.skipped += 1;
            continue;
        }

        let cached = CachedOp {
            id: r.id,
            rm: Some(rm),
            due,
            op_type: r.op_type,
            op: Arc::from(op),
        };
        recovered.entry(tx).or_default().push((r.kind, cached));
        report.restored += 1;
    }

    report.transactions = recovered.len();
    report.stalled = stalled.len();
    if report.records > 0 {
        log::info!(
            "Recovery complete: {} operations in {} transactions, {} skipped",
            report.restored,
            report.transactions,
            report.skipped
        );
    }
    if report.stalled > 0 {
        log::warn!("{} transactions stalled on undecodable operations", report.stalled);
    }

    Ok((recovered, report))
}
