//! The process-wide table of live transactions. Every lookup and mutation
//! happens under one mutex; the `being_written` flag combined with the
//! on-disk proto-rev lock cheaply rejects same-process double-writes.

use std::sync::Mutex;

use crate::error::CResult;

/// Shared in-process state for one transaction.
#[derive(Debug)]
pub struct SharedTxn {
    pub txn_id: String,
    /// True iff this process currently holds the proto-rev lock.
    pub being_written: bool,
}

/// The registry contents, only reachable through [`TxnRegistry::with_lock`].
#[derive(Debug, Default)]
pub struct TxnTable {
    /// Live transactions, newest first; there is typically exactly one.
    txns: Vec<Box<SharedTxn>>,
    /// Single-slot free list; removing a transaction keeps its allocation
    /// around for the next one.
    free: Option<Box<SharedTxn>>,
}

impl TxnTable {
    /// Looks up TXN_ID, inserting a fresh entry if absent.
    pub fn get_or_create(&mut self, txn_id: &str) -> &mut SharedTxn {
        if let Some(i) = self.txns.iter().position(|t| t.txn_id == txn_id) {
            return &mut self.txns[i];
        }
        let mut txn = match self.free.take() {
            Some(txn) => txn,
            None => Box::new(SharedTxn { txn_id: String::new(), being_written: false }),
        };
        txn.txn_id.clear();
        txn.txn_id.push_str(txn_id);
        txn.being_written = false;
        self.txns.insert(0, txn);
        &mut self.txns[0]
    }

    /// Looks up TXN_ID without inserting.
    pub fn get(&mut self, txn_id: &str) -> Option<&mut SharedTxn> {
        self.txns.iter_mut().find(|t| t.txn_id == txn_id).map(|t| &mut **t)
    }

    /// Removes TXN_ID, parking the entry on the free list. Does nothing if
    /// the transaction is not present.
    pub fn purge(&mut self, txn_id: &str) {
        if let Some(i) = self.txns.iter().position(|t| t.txn_id == txn_id) {
            let txn = self.txns.remove(i);
            if self.free.is_none() {
                self.free = Some(txn);
            }
        }
    }
}

/// Process-wide registry; one per store handle.
#[derive(Debug, Default)]
pub struct TxnRegistry {
    inner: Mutex<TxnTable>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs BODY with the transaction list locked.
    pub fn with_lock<T>(&self, body: impl FnOnce(&mut TxnTable) -> CResult<T>) -> CResult<T> {
        let mut table = self.inner.lock()?;
        body(&mut table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_purge() -> CResult<()> {
        let registry = TxnRegistry::new();
        registry.with_lock(|table| {
            assert!(table.get("1-a").is_none());
            table.get_or_create("1-a").being_written = true;
            assert!(table.get("1-a").unwrap().being_written);

            // A second get_or_create must not reset the flag.
            assert!(table.get_or_create("1-a").being_written);

            table.purge("1-a");
            assert!(table.get("1-a").is_none());

            // The freed slot is reused with a clean flag.
            let txn = table.get_or_create("1-b");
            assert_eq!(txn.txn_id, "1-b");
            assert!(!txn.being_written);
            Ok(())
        })
    }

    #[test]
    fn purge_missing_is_noop() -> CResult<()> {
        let registry = TxnRegistry::new();
        registry.with_lock(|table| {
            table.purge("nope");
            Ok(())
        })
    }
}
