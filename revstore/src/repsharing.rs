//! Rep sharing: before a freshly written representation is kept, look for
//! an existing rep with the same SHA-1 among the reps of the commit in
//! progress, in the external rep index, or among the reps this transaction
//! has already written. Finding one lets the writer truncate the new bytes
//! off the proto-rev file and point the noderev at the old rep instead.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CResult, Error};
use crate::noderev::{NodeRev, RepLocation, Representation};
use crate::paths;
use crate::repcache::{RepIndex, RepIndexEntry};
use crate::store::Store;

impl Store {
    /// Finds an existing representation equivalent to REP, which must
    /// carry a SHA-1. REPS_HASH holds reps finalized earlier in the same
    /// commit. Returns None when sharing is disabled or nothing matches.
    ///
    /// A rep index entry pointing beyond the current head is corruption
    /// and propagates; any other index failure goes to the warning sink
    /// and is treated as "no match".
    pub(crate) fn get_shared_rep(
        &self,
        rep: &Representation,
        reps_hash: Option<&HashMap<[u8; 20], Representation>>,
    ) -> CResult<Option<Representation>> {
        if !self.config.rep_sharing_allowed {
            return Ok(None);
        }
        let sha1 = match rep.sha1 {
            Some(sha1) => sha1,
            None => return Ok(None),
        };

        // The in-memory hash is the cheapest source, so it goes first.
        let mut old_rep = reps_hash.and_then(|hash| hash.get(&sha1).cloned());

        if old_rep.is_none() {
            if let Some(index) = &self.rep_index {
                match self.lookup_rep_index(&sha1, index) {
                    Ok(found) => old_rep = found,
                    Err(err @ Error::Corrupt(_)) => return Err(err),
                    Err(err) => self.warn(&err),
                }
            }
        }

        // Finally, look for a match among the reps this transaction has
        // already written (usually data reps, but props can collide too).
        if old_rep.is_none() {
            if let RepLocation::Txn(txn_id) = &rep.location {
                let path = paths::txn_sha1(&self.path, txn_id, &hex::encode(sha1));
                if path.is_file() {
                    let text = std::fs::read_to_string(&path)?;
                    old_rep = Some(Representation::parse(text.trim_end_matches('\n'))?);
                }
            }
        }

        // The index stores neither MD5 nor uniquifier; carry them over
        // from the rep being replaced.
        if let Some(old_rep) = &mut old_rep {
            old_rep.md5 = rep.md5;
            old_rep.uniquifier = rep.uniquifier.clone();
            old_rep.sha1 = Some(sha1);
        }
        Ok(old_rep)
    }

    fn lookup_rep_index(
        &self,
        sha1: &[u8; 20],
        index: &Mutex<Box<dyn RepIndex + Send>>,
    ) -> CResult<Option<Representation>> {
        let encoded = match index.lock()?.get(sha1)? {
            None => return Ok(None),
            Some(encoded) => encoded,
        };
        let candidate = RepIndexEntry::decode(&encoded)?.into_rep();

        // An entry for a revision past the head would become wrong as soon
        // as head catches up with it, so treat it as corruption now.
        let head = self.youngest_rev()?;
        if candidate.rev() > head {
            return Err(Error::Corrupt(format!(
                "rep index references r{} beyond head r{}",
                candidate.rev(),
                head
            )));
        }
        self.check_rep(&candidate)?;
        Ok(Some(candidate))
    }

    /// Records the SHA-1 of NODEREV's freshly kept data rep in the
    /// transaction directory, feeding intra-txn matches.
    pub(crate) fn store_sha1_rep_mapping(&self, noderev: &NodeRev) -> CResult<()> {
        if !self.config.rep_sharing_allowed {
            return Ok(());
        }
        let rep = match &noderev.data_rep {
            Some(rep) => rep,
            None => return Ok(()),
        };
        if let (Some(sha1), Some(txn_id)) = (&rep.sha1, noderev.id.txn_id()) {
            let path = paths::txn_sha1(&self.path, txn_id, &hex::encode(sha1));
            std::fs::write(path, format!("{}\n", rep.unparse()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::id::NodeId;
    use crate::noderev::NodeKind;
    use crate::repcache::MemoryRepIndex;
    use crate::txn::TxnFlags;
    use std::io::Write as _;

    fn rep_with_sha1(txn_id: &str, sha1: [u8; 20]) -> Representation {
        let mut rep = Representation::new_mutable(txn_id);
        rep.sha1 = Some(sha1);
        rep.md5 = Some([7; 16]);
        rep.uniquifier = Some(format!("{}/_9", txn_id));
        rep
    }

    #[test]
    fn disabled_sharing_never_matches() -> CResult<()> {
        let dir = tempdir::TempDir::new("sharing")?;
        let config = Config { rep_sharing_allowed: false, ..Config::default() };
        let store = Store::create(dir.path().join("repo"), config)?;
        let txn = store.begin_txn(0, TxnFlags::default())?;
        assert_eq!(store.get_shared_rep(&rep_with_sha1(&txn.id, [1; 20]), None)?, None);
        Ok(())
    }

    #[test]
    fn reps_hash_wins() -> CResult<()> {
        let dir = tempdir::TempDir::new("sharing")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        let sha1 = [2; 20];
        let mut committed = RepIndexEntry { revision: 0, offset: 0, size: 4, expanded_size: 0 }
            .into_rep();
        committed.sha1 = Some(sha1);
        let mut hash = HashMap::new();
        hash.insert(sha1, committed.clone());

        let fresh = rep_with_sha1(&txn.id, sha1);
        let found = store.get_shared_rep(&fresh, Some(&hash))?.expect("match");
        assert_eq!(found.offset, committed.offset);
        // MD5 and uniquifier are backfilled from the fresh rep.
        assert_eq!(found.md5, fresh.md5);
        assert_eq!(found.uniquifier, fresh.uniquifier);
        Ok(())
    }

    #[test]
    fn index_entry_beyond_head_is_corrupt() -> CResult<()> {
        let dir = tempdir::TempDir::new("sharing")?;
        let mut store = Store::create(dir.path().join("repo"), Config::default())?;
        let sha1 = [3; 20];
        let mut index = MemoryRepIndex::new();
        index.set(
            &sha1,
            RepIndexEntry { revision: 99, offset: 0, size: 1, expanded_size: 1 }.encode()?,
        )?;
        store.set_rep_index(Box::new(index));

        let txn = store.begin_txn(0, TxnFlags::default())?;
        match store.get_shared_rep(&rep_with_sha1(&txn.id, sha1), None) {
            Err(Error::Corrupt(_)) => Ok(()),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn undecodable_index_entry_warns_and_misses() -> CResult<()> {
        let dir = tempdir::TempDir::new("sharing")?;
        let mut store = Store::create(dir.path().join("repo"), Config::default())?;
        let sha1 = [4; 20];
        let mut index = MemoryRepIndex::new();
        index.set(&sha1, vec![0xff])?;
        store.set_rep_index(Box::new(index));

        let warnings = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = warnings.clone();
        store.set_warning_sink(Box::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let txn = store.begin_txn(0, TxnFlags::default())?;
        assert_eq!(store.get_shared_rep(&rep_with_sha1(&txn.id, sha1), None)?, None);
        assert_eq!(warnings.load(std::sync::atomic::Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn sha1_scratch_file_roundtrips() -> CResult<()> {
        let dir = tempdir::TempDir::new("sharing")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        let mut node =
            NodeRev::new(NodeId::for_txn("0", "0", txn.id.clone()), NodeKind::File, "/a");
        store.create_node(&mut node, "0", &txn.id)?;
        let mut writer = store.set_contents(&mut node)?;
        writer.write_all(b"mapped")?;
        writer.close()?;

        let rep = node.data_rep.clone().unwrap();
        let fresh = rep_with_sha1(&txn.id, rep.sha1.unwrap());
        let found = store.get_shared_rep(&fresh, None)?.expect("intra-txn match");
        assert_eq!(found.offset, rep.offset);
        assert_eq!(found.size, rep.size);
        Ok(())
    }
}
