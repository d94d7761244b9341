//! The streaming representation writer. Bytes written to a [`RepWriter`]
//! are checksummed, delta-encoded against a chosen base and appended to
//! the transaction's proto-rev file; closing the writer finalizes the rep,
//! consults rep sharing and rewrites the owning noderev. A writer that is
//! dropped without being closed truncates the proto-rev file back to where
//! it started and releases the lock, so aborted writes leave the file
//! usable.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{CResult, Error};
use crate::noderev::{NodeKind, NodeRev, RepHeader, RepLocation, Representation};
use crate::protorev::{self, ProtoRevLock};
use crate::store::Store;
use crate::svndiff;

pub struct RepWriter<'a> {
    store: &'a Store,
    noderev: &'a mut NodeRev,
    txn_id: String,
    file: Option<File>,
    lock: Option<ProtoRevLock<'a>>,
    encoder: Option<svndiff::Encoder<File>>,
    /// Where this rep's header starts in the proto-rev file.
    rep_offset: u64,
    /// Where the svndiff data starts.
    delta_start: u64,
    /// Expanded bytes written so far.
    rep_size: u64,
    md5: Md5,
    sha1: Sha1,
    finished: bool,
}

impl Store {
    /// Returns a writable stream over the file contents of NODEREV. The
    /// rep becomes visible once the stream is closed.
    pub fn set_contents<'a>(&'a self, noderev: &'a mut NodeRev) -> CResult<RepWriter<'a>> {
        if noderev.kind != NodeKind::File {
            return Err(Error::Internal("can't set text contents of a directory".into()));
        }
        let txn_id = noderev
            .id
            .txn_id()
            .ok_or_else(|| {
                Error::Corrupt(format!("attempted to write to non-transaction '{}'", noderev.id))
            })?
            .to_string();

        let (mut file, lock) = protorev::get_writable_proto_rev(self, &txn_id)?;
        let rep_offset = file.stream_position()?;

        // Anything appended past rep_offset before the writer exists must
        // be rolled back if construction fails.
        let started = (|| -> CResult<(u64, svndiff::Encoder<File>)> {
            let base_rep = self.choose_delta_base(noderev, false)?;
            let source = match &base_rep {
                Some(rep) => self.rep_contents(rep)?,
                None => Vec::new(),
            };
            let header = match &base_rep {
                Some(rep) => RepHeader::Delta {
                    base_rev: rep.rev(),
                    base_offset: rep.offset,
                    base_length: rep.size,
                },
                None => RepHeader::SelfDelta,
            };
            header.write_to(&mut file)?;
            let delta_start = file.stream_position()?;
            let encoder =
                svndiff::Encoder::new(file.try_clone()?, source, self.config.svndiff_version())?;
            Ok((delta_start, encoder))
        })();

        let (delta_start, encoder) = match started {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(trunc_err) = protorev::truncate_to(&mut file, rep_offset) {
                    log::error!("failed to roll back proto-rev file: {}", trunc_err);
                }
                return Err(err);
            }
        };

        Ok(RepWriter {
            store: self,
            noderev,
            txn_id,
            file: Some(file),
            lock: Some(lock),
            encoder: Some(encoder),
            rep_offset,
            delta_start,
            rep_size: 0,
            md5: Md5::new(),
            sha1: Sha1::new(),
            finished: false,
        })
    }

    /// Picks the base representation for a new delta of NODEREV using
    /// skip-delta arithmetic over the predecessor count, with a linear
    /// chain close to the head and a reset once the walk gets too long.
    pub(crate) fn choose_delta_base(
        &self,
        noderev: &NodeRev,
        props: bool,
    ) -> CResult<Option<Representation>> {
        if noderev.predecessor_count == 0 {
            return Ok(None);
        }

        // Clearing the lowest set bit of the predecessor count yields the
        // index of the skip-delta base along the predecessor line.
        let mut count = noderev.predecessor_count & (noderev.predecessor_count - 1);
        let walk = noderev.predecessor_count - count;
        if walk < self.config.max_linear_deltification {
            count = noderev.predecessor_count - 1;
        }
        if walk > self.config.max_deltification_walk {
            return Ok(None);
        }

        let mut base = noderev.clone();
        let mut maybe_shared_rep = false;
        for _ in count..noderev.predecessor_count {
            let pred = base.predecessor_id.clone().ok_or_else(|| {
                Error::Corrupt(format!("predecessor chain of '{}' ends early", noderev.id))
            })?;
            base = self.node_revision(&pred)?;

            // A rep stored before its owner's revision was committed is
            // shared; copied nodes can false-positive here, which only
            // costs the extra chain length measurement below.
            let rep = if props { &base.prop_rep } else { &base.data_rep };
            if let Some(rep) = rep {
                if !rep.is_txn() && base.id.rev() > rep.rev() {
                    maybe_shared_rep = true;
                }
            }
        }

        let rep = match if props { base.prop_rep } else { base.data_rep } {
            Some(rep) if !rep.is_txn() => rep,
            _ => return Ok(None),
        };

        // Shared reps can splice delta chains from foreign predecessor
        // lines; refuse bases whose real chain already grew degenerate.
        if maybe_shared_rep {
            let chain_length = self.rep_chain_length(&rep)?;
            if chain_length >= 2 * self.config.max_linear_deltification + 2 {
                return Ok(None);
            }
        }
        Ok(Some(rep))
    }
}

impl<'a> RepWriter<'a> {
    /// Finalizes the rep: flushes the delta stream, fills in checksums and
    /// the uniquifier, deduplicates against existing reps, rewrites the
    /// noderev and releases the proto-rev file and lock.
    pub fn close(mut self) -> CResult<()> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| Error::Internal("representation writer already closed".into()))?;
        drop(encoder.finish()?);

        // The file stays under the drop guard until the dedup decision is
        // made, so a failure below still rolls the proto-rev file back.
        let end = match self.file.as_mut() {
            Some(file) => file.seek(SeekFrom::End(0))?,
            None => return Err(Error::Internal("representation writer already closed".into())),
        };

        let mut rep = Representation {
            location: RepLocation::Txn(self.txn_id.clone()),
            offset: self.rep_offset,
            size: end - self.delta_start,
            expanded_size: self.rep_size,
            md5: Some(std::mem::take(&mut self.md5).finalize().into()),
            sha1: Some(std::mem::take(&mut self.sha1).finalize().into()),
            uniquifier: None,
        };
        rep.uniquifier =
            Some(format!("{}/{}", self.txn_id, self.store.alloc_node_id(&self.txn_id)?));

        let old_rep = self.store.get_shared_rep(&rep, None)?;
        let shared = old_rep.is_some();
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::Internal("representation writer already closed".into()))?;
        match old_rep {
            Some(old_rep) => {
                // Identical content already exists; give the bytes back.
                protorev::truncate_to(&mut file, self.rep_offset)?;
                self.noderev.data_rep = Some(old_rep);
            }
            None => {
                file.write_all(b"ENDREP\n")?;
                self.noderev.data_rep = Some(rep);
            }
        }
        self.finished = true;

        self.store.put_node_revision(self.noderev, false)?;
        if !shared {
            self.store.store_sha1_rep_mapping(self.noderev)?;
        }

        drop(file);
        match self.lock.take() {
            Some(lock) => lock.unlock(),
            None => Ok(()),
        }
    }
}

impl Write for RepWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let encoder = self.encoder.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "representation writer closed")
        })?;
        self.md5.update(buf);
        self.sha1.update(buf);
        self.rep_size += buf.len() as u64;
        encoder
            .write(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for RepWriter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandon buffered delta windows, roll the proto-rev file back and
        // let the lock cookie release itself.
        drop(self.encoder.take());
        if let Some(mut file) = self.file.take() {
            if let Err(err) = protorev::truncate_to(&mut file, self.rep_offset) {
                log::error!("failed to roll back proto-rev file: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::noderev::NodeRev;
    use crate::txn::TxnFlags;

    fn file_node(store: &Store, txn_id: &str, path: &str) -> CResult<NodeRev> {
        let mut node = NodeRev::new(
            crate::id::NodeId::for_txn("0", "0", txn_id),
            NodeKind::File,
            path,
        );
        store.create_node(&mut node, "0", txn_id)?;
        Ok(node)
    }

    #[test]
    fn write_close_appends_one_rep() -> CResult<()> {
        let dir = tempdir::TempDir::new("repwriter")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;
        let mut node = file_node(&store, &txn.id, "/a")?;

        let mut writer = store.set_contents(&mut node)?;
        writer.write_all(b"hello\n")?;
        writer.close()?;

        let rep = node.data_rep.clone().expect("rep set on close");
        assert!(rep.is_txn());
        assert_eq!(rep.expanded_size, 6);
        assert!(rep.md5.is_some() && rep.sha1.is_some());
        assert!(rep.uniquifier.as_ref().unwrap().starts_with(&txn.id));

        // The noderev on disk was rewritten to match.
        let stored = store.node_revision(&node.id)?;
        assert_eq!(stored.data_rep, node.data_rep);
        Ok(())
    }

    #[test]
    fn intra_txn_duplicate_reuses_rep_and_truncates() -> CResult<()> {
        let dir = tempdir::TempDir::new("repwriter")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        let mut a = file_node(&store, &txn.id, "/a")?;
        let mut writer = store.set_contents(&mut a)?;
        writer.write_all(b"same bytes")?;
        writer.close()?;
        let proto = crate::paths::txn_proto_rev(store.path(), store.config(), &txn.id);
        let len_after_first = std::fs::metadata(&proto)?.len();

        let mut b = file_node(&store, &txn.id, "/b")?;
        let mut writer = store.set_contents(&mut b)?;
        writer.write_all(b"same bytes")?;
        writer.close()?;

        assert_eq!(std::fs::metadata(&proto)?.len(), len_after_first);
        let (a_rep, b_rep) = (a.data_rep.unwrap(), b.data_rep.unwrap());
        assert_eq!(a_rep.offset, b_rep.offset);
        assert_eq!(a_rep.sha1, b_rep.sha1);
        assert_ne!(a_rep.uniquifier, b_rep.uniquifier);
        Ok(())
    }

    #[test]
    fn dropped_writer_rolls_back() -> CResult<()> {
        let dir = tempdir::TempDir::new("repwriter")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;
        let proto = crate::paths::txn_proto_rev(store.path(), store.config(), &txn.id);

        let mut node = file_node(&store, &txn.id, "/a")?;
        {
            let mut writer = store.set_contents(&mut node)?;
            writer.write_all(&vec![7u8; 10 * 1024])?;
            // Dropped mid-stream.
        }
        assert_eq!(std::fs::metadata(&proto)?.len(), 0);

        // The lock was released, so a fresh writer works.
        let mut writer = store.set_contents(&mut node)?;
        writer.write_all(b"second try")?;
        writer.close()?;
        Ok(())
    }

    #[test]
    fn concurrent_writers_on_one_txn_are_rejected() -> CResult<()> {
        let dir = tempdir::TempDir::new("repwriter")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        let txn = store.begin_txn(0, TxnFlags::default())?;

        let mut a = file_node(&store, &txn.id, "/a")?;
        let mut b = file_node(&store, &txn.id, "/b")?;
        let writer = store.set_contents(&mut a)?;
        match store.set_contents(&mut b) {
            Err(Error::RepBeingWritten(_)) => {}
            other => panic!("expected RepBeingWritten, got {:?}", other.map(|_| ())),
        }
        writer.close()?;
        Ok(())
    }

    #[test]
    fn delta_base_skips_by_predecessor_count() -> CResult<()> {
        let dir = tempdir::TempDir::new("repwriter")?;
        let config = Config { max_linear_deltification: 1, ..Config::default() };
        let store = Store::create(dir.path().join("repo"), config)?;

        // With no predecessors there is no base.
        let txn = store.begin_txn(0, TxnFlags::default())?;
        let node = file_node(&store, &txn.id, "/a")?;
        assert_eq!(store.choose_delta_base(&node, false)?, None);
        Ok(())
    }
}
