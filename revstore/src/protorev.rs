//! Exclusive access to a transaction's proto-rev file. The in-process
//! `being_written` flag catches same-process contention before the advisory
//! file lock is even attempted; the file lock arbitrates between processes.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::paths;
use crate::store::Store;

/// Cookie returned by [`get_writable_proto_rev`]. Releasing it closes the
/// lock file and clears `being_written`; the proto-rev file itself must be
/// closed by the caller first. Dropping an unreleased cookie releases the
/// lock on a best-effort basis so that teardown mid-write cannot wedge the
/// transaction.
pub struct ProtoRevLock<'a> {
    store: &'a Store,
    txn_id: String,
    lockfile: Option<File>,
}

impl<'a> ProtoRevLock<'a> {
    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    /// Releases the lock, reporting any inconsistency with the registry.
    pub fn unlock(mut self) -> CResult<()> {
        self.release()
    }

    fn release(&mut self) -> CResult<()> {
        let lockfile = match self.lockfile.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        self.store.registry().with_lock(|table| {
            let txn = table.get(&self.txn_id).ok_or_else(|| {
                Error::Corrupt(format!("can't unlock unknown transaction '{}'", self.txn_id))
            })?;
            if !txn.being_written {
                return Err(Error::Corrupt(format!(
                    "can't unlock nonlocked transaction '{}'",
                    self.txn_id
                )));
            }
            lockfile.unlock()?;
            txn.being_written = false;
            Ok(())
        })
    }
}

impl<'a> Drop for ProtoRevLock<'a> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("failed to release proto-rev lock: {}", err);
        }
    }
}

/// Opens the proto-rev file of TXN_ID for writing and locks it. Returns the
/// file positioned at its end together with the lock cookie.
///
/// Fails with [`Error::RepBeingWritten`] when any writer, in this process
/// or another, already holds the lock.
pub fn get_writable_proto_rev<'a>(
    store: &'a Store,
    txn_id: &str,
) -> CResult<(File, ProtoRevLock<'a>)> {
    let lock_path = paths::txn_proto_rev_lock(store.path(), store.config(), txn_id);
    let lockfile = store.registry().with_lock(|table| {
        let txn = table.get_or_create(txn_id);
        if txn.being_written {
            return Err(Error::RepBeingWritten(format!(
                "cannot write to the prototype revision file of transaction '{}' because a \
                 previous representation is currently being written by this process",
                txn_id
            )));
        }

        // No thread of this process holds the lock, so it is safe to probe
        // the lock file and find out whether another process does.
        let lockfile = OpenOptions::new().write(true).create(true).open(&lock_path)?;
        if let Err(err) = lockfile.try_lock_exclusive() {
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::RepBeingWritten(format!(
                    "cannot write to the prototype revision file of transaction '{}' because a \
                     previous representation is currently being written by another process",
                    txn_id
                )));
            }
            return Err(err.into());
        }

        txn.being_written = true;
        Ok(lockfile)
    })?;

    let lock = ProtoRevLock { store, txn_id: txn_id.to_string(), lockfile: Some(lockfile) };

    // Open the proto-rev file and position it at the end. The lock guard
    // releases on the error paths.
    let mut file = OpenOptions::new()
        .write(true)
        .read(true)
        .open(paths::txn_proto_rev(store.path(), store.config(), txn_id))?;
    file.seek(SeekFrom::End(0))?;
    Ok((file, lock))
}

/// Truncates FILE back to OFFSET and repositions the write cursor there.
pub(crate) fn truncate_to(file: &mut File, offset: u64) -> CResult<()> {
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::txn::TxnFlags;

    #[test]
    fn exclusive_within_process() -> CResult<()> {
        let dir = tempdir::TempDir::new("protorev")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        let (file, lock) = get_writable_proto_rev(&store, &txn.id)?;
        match get_writable_proto_rev(&store, &txn.id) {
            Err(Error::RepBeingWritten(msg)) => assert!(msg.contains("this process")),
            other => panic!("expected RepBeingWritten, got {:?}", other.map(|_| ())),
        }

        drop(file);
        lock.unlock()?;
        let (_file, lock) = get_writable_proto_rev(&store, &txn.id)?;
        lock.unlock()?;
        Ok(())
    }

    #[test]
    fn drop_releases() -> CResult<()> {
        let dir = tempdir::TempDir::new("protorev")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        {
            let (_file, _lock) = get_writable_proto_rev(&store, &txn.id)?;
            // Dropped without an explicit unlock, as a torn-down writer
            // scope would.
        }
        let (_file, lock) = get_writable_proto_rev(&store, &txn.id)?;
        lock.unlock()?;
        Ok(())
    }

    #[test]
    fn stale_lock_from_dead_process_is_reacquirable() -> CResult<()> {
        // A crashed process leaves the lock file behind but no advisory
        // lock; a fresh store handle must be able to take it over.
        let dir = tempdir::TempDir::new("protorev")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        let other = Store::open(dir.path().join("repo"), Config::default())?;
        let (_file, lock) = get_writable_proto_rev(&other, &txn.id)?;
        lock.unlock()?;
        Ok(())
    }
}
