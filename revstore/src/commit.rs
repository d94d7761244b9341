//! The committer. Under the repository write lock it re-checks the base
//! revision, re-verifies path locks, rewrites the transaction tree into
//! the proto-rev file with final offsets and ids, fuses the folded change
//! set, atomically promotes the proto-rev file to the next revision and
//! bumps `current`. Either `current` names the new revision afterwards or
//! the commit did not happen; there is no partial visibility.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::changes::{self, ChangeKind};
use crate::config::Config;
use crate::error::{CResult, Error};
use crate::hashfile;
use crate::id::{NodeId, Rev, INVALID_REV};
use crate::keys;
use crate::noderev::{
    unparse_dir_entries, NodeKind, NodeRev, RepHeader, RepLocation, Representation,
};
use crate::paths;
use crate::protorev;
use crate::repcache::{RepIndex, RepIndexEntry};
use crate::store::{move_into_place, timestamp_now, Store};
use crate::svndiff;
use crate::txn::{Txn, PROP_REVISION_DATE, PROP_TXN_CHECK_LOCKS, PROP_TXN_CHECK_OOD};

/// External inputs to a commit.
pub struct CommitOptions<'a> {
    /// Overwrite the `svn:date` prop with the commit time, keeping date
    /// props ordered across revisions.
    pub set_timestamp: bool,
    /// Re-verifies that the caller holds the path locks covering a changed
    /// path; called with `(path, recurse)` in depth-first order. Lock
    /// bookkeeping itself lives outside the engine.
    pub verify_paths_locked: Option<&'a dyn Fn(&str, bool) -> CResult<()>>,
}

impl Default for CommitOptions<'_> {
    fn default() -> Self {
        Self { set_timestamp: true, verify_paths_locked: None }
    }
}

impl Store {
    /// Promotes TXN into the next revision and returns its number. On any
    /// error the head is unchanged; transient artifacts may remain in the
    /// transaction for forensics or retry.
    pub fn commit(&self, txn: &Txn, opts: &CommitOptions) -> CResult<Rev> {
        let mut reps_to_cache = Vec::new();
        let mut reps_hash = HashMap::new();
        let new_rev = self.with_write_lock(|| {
            self.commit_body(txn, opts, &mut reps_to_cache, &mut reps_hash)
        })?;

        // The new reps go to the rep index outside the write lock, in one
        // batch; failures here cannot unpublish the revision.
        if let Some(index) = &self.rep_index {
            if let Err(err) = write_reps_to_index(&reps_to_cache, index) {
                self.warn(&err);
            }
        }
        Ok(new_rev)
    }

    fn commit_body(
        &self,
        txn: &Txn,
        opts: &CommitOptions,
        reps_to_cache: &mut Vec<Representation>,
        reps_hash: &mut HashMap<[u8; 20], Representation>,
    ) -> CResult<Rev> {
        let (old_rev, current_ids) = self.read_current()?;
        if txn.base_rev != old_rev {
            return Err(Error::TxnOutOfDate);
        }

        // Locks may have been added or stolen since the changes were made,
        // so every changed path gets re-verified under the write lock.
        if let Some(verify) = opts.verify_paths_locked {
            self.verify_locks(&txn.id, verify)?;
        }

        let start_ids = if self.config.modern_ids() {
            None
        } else {
            Some(current_ids.ok_or_else(|| Error::Corrupt("corrupt 'current' file".into()))?)
        };

        let new_rev = old_rev + 1;

        let (mut proto_file, proto_lock) = protorev::get_writable_proto_rev(self, &txn.id)?;
        let initial_offset = proto_file.stream_position()?;

        let root_id = NodeId::for_txn("0", "0", txn.id.clone());
        let new_root_id = self
            .write_final_rev(
                &mut proto_file,
                new_rev,
                &root_id,
                start_ids.as_ref(),
                initial_offset,
                reps_to_cache,
                reps_hash,
                true,
            )?
            .ok_or_else(|| Error::Internal("transaction root was not rewritten".into()))?;

        let changed_path_offset = proto_file.stream_position()?;
        let folded = self.txn_changed_paths(&txn.id)?;
        changes::write_changes(&mut proto_file, &folded)?;

        let root_offset = new_root_id
            .offset()
            .ok_or_else(|| Error::Internal("final root id has no offset".into()))?;
        write!(proto_file, "{} {}\n", root_offset, changed_path_offset)?;
        proto_file.sync_all()?;
        drop(proto_file);
        // The lock stays held until the proto-rev file is moved into
        // place, so no late writer can append to it in the meantime.

        // Strip the temporary flag props; optionally stamp the final date.
        let props = self.txn_proplist(&txn.id)?;
        let mut edits: Vec<(String, Option<String>)> = Vec::new();
        if props.contains_key(PROP_TXN_CHECK_OOD) {
            edits.push((PROP_TXN_CHECK_OOD.to_string(), None));
        }
        if props.contains_key(PROP_TXN_CHECK_LOCKS) {
            edits.push((PROP_TXN_CHECK_LOCKS.to_string(), None));
        }
        if opts.set_timestamp {
            edits.push((PROP_REVISION_DATE.to_string(), Some(timestamp_now())));
        }
        if !edits.is_empty() {
            self.change_txn_props(&txn.id, &edits)?;
        }

        // First revision of a new shard: create the shard directories.
        if self.config.max_files_per_dir > 0
            && new_rev as u64 % self.config.max_files_per_dir == 0
        {
            create_shard_dir(
                &paths::rev_shard_dir(&self.path, &self.config, new_rev),
                &paths::revs_dir(&self.path),
            )?;
            create_shard_dir(
                &paths::revprops_shard_dir(&self.path, &self.config, new_rev),
                &paths::revprops_dir(&self.path),
            )?;
        }

        // Promote the proto-rev file, then let go of its lock; further
        // writes would fail anyway since the file no longer exists.
        move_into_place(
            &paths::txn_proto_rev(&self.path, &self.config, &txn.id),
            &paths::rev_file(&self.path, &self.config, new_rev),
        )?;
        proto_lock.unlock()?;

        move_into_place(
            &paths::txn_props(&self.path, &txn.id),
            &paths::revprops_file(&self.path, &self.config, new_rev),
        )?;

        if self.config.verify_before_commit {
            // Read the new revision back through a fresh handle that
            // cannot serve anything from this one's state.
            let fresh = Store::open(
                self.path.clone(),
                Config { rep_sharing_allowed: false, ..self.config.clone() },
            )?;
            fresh.verify_root(new_rev)?;
        }

        match &start_ids {
            None => self.write_current(new_rev, None)?,
            Some((start_node_id, start_copy_id)) => {
                let (txn_node_id, txn_copy_id) = self.read_next_ids(&txn.id)?;
                let next_node_id = keys::add_keys(start_node_id, &txn_node_id)?;
                let next_copy_id = keys::add_keys(start_copy_id, &txn_copy_id)?;
                self.write_current(new_rev, Some((&next_node_id, &next_copy_id)))?;
            }
        }

        // The revision is published. A failed purge leaves a stale txn
        // directory behind but must not turn the commit into an error.
        if let Err(err) = self.purge_txn(&txn.id) {
            log::warn!("cleanup of committed transaction '{}' failed: {}", txn.id, err);
        }
        log::info!("committed r{}", new_rev);
        Ok(new_rev)
    }

    /// Recursively rewrites the transaction tree rooted at ID into the
    /// proto-rev file, bottom-up, assigning final ids and offsets. Returns
    /// None for nodes that were never touched by the transaction.
    #[allow(clippy::too_many_arguments)]
    fn write_final_rev(
        &self,
        file: &mut File,
        new_rev: Rev,
        id: &NodeId,
        start_ids: Option<&(String, String)>,
        initial_offset: u64,
        reps_to_cache: &mut Vec<Representation>,
        reps_hash: &mut HashMap<[u8; 20], Representation>,
        at_root: bool,
    ) -> CResult<Option<NodeId>> {
        if !id.is_txn() {
            return Ok(None);
        }
        let mut noderev = self.node_revision(id)?;

        if noderev.kind == NodeKind::Dir {
            // Children first, sorted by name so the output is
            // deterministic and repeatable.
            let mut entries = self.dir_entries(&noderev)?;
            for entry in entries.values_mut() {
                let new_id = self.write_final_rev(
                    file,
                    new_rev,
                    &entry.id,
                    start_ids,
                    initial_offset,
                    reps_to_cache,
                    reps_hash,
                    false,
                )?;
                if let Some(new_id) = new_id {
                    if new_id.rev() == new_rev {
                        entry.id = new_id;
                    }
                }
            }

            if noderev.data_rep.as_ref().map_or(false, Representation::is_txn) {
                let mut listing = Vec::new();
                hashfile::write_hash(&mut listing, &unparse_dir_entries(&entries), true)?;
                let rep = if self.config.deltify_directories {
                    self.write_hash_delta_rep(file, new_rev, &listing, &noderev, None, false)?
                } else {
                    self.write_hash_rep(file, new_rev, &listing, None)?
                };
                noderev.data_rep = Some(rep);
            }
        } else if let Some(rep) = &mut noderev.data_rep {
            if rep.is_txn() {
                // A rep past the commit-time end of the proto-rev file can
                // only mean the file lost bytes since it was written.
                if rep.offset + rep.size > initial_offset {
                    return Err(Error::Corrupt("truncated proto-rev file detected".into()));
                }
                rep.location = RepLocation::Rev(new_rev);
            }
        }

        if noderev.prop_rep.as_ref().map_or(false, Representation::is_txn) {
            let props = self.node_proplist(&noderev)?;
            let mut bytes = Vec::new();
            hashfile::write_hash(&mut bytes, &props, true)?;
            let rep = if self.config.deltify_properties {
                self.write_hash_delta_rep(file, new_rev, &bytes, &noderev, Some(&*reps_hash), true)?
            } else {
                self.write_hash_rep(file, new_rev, &bytes, Some(&*reps_hash))?
            };
            noderev.prop_rep = Some(rep);
        }

        let my_offset = file.stream_position()?;

        let node_id =
            final_key(&noderev.id.node_id, new_rev, start_ids.map(|(n, _)| n.as_str()), self.config.modern_ids())?;
        let copy_id =
            final_key(&noderev.id.copy_id, new_rev, start_ids.map(|(_, c)| c.as_str()), self.config.modern_ids())?;

        if let Some((rev, _)) = noderev.copyroot.as_mut() {
            if *rev == INVALID_REV {
                *rev = new_rev;
            }
        } else {
            noderev.copyroot = Some((new_rev, noderev.created_path.clone()));
        }

        let new_id = NodeId::for_rev(node_id, copy_id, new_rev, my_offset);
        noderev.id = new_id.clone();

        if self.config.rep_sharing_allowed {
            if noderev.kind == NodeKind::File {
                if let Some(rep) = &noderev.data_rep {
                    if rep.rev() == new_rev {
                        reps_to_cache.push(rep.clone());
                    }
                }
            }
            if let Some(rep) = &noderev.prop_rep {
                if rep.rev() == new_rev {
                    reps_to_cache.push(rep.clone());
                    if let Some(sha1) = rep.sha1 {
                        reps_hash.insert(sha1, rep.clone());
                    }
                }
            }
        }

        // SHA-1s of directory listings and prop lists are not persisted.
        if noderev.kind == NodeKind::Dir {
            if let Some(rep) = &mut noderev.data_rep {
                rep.sha1 = None;
            }
        }
        if let Some(rep) = &mut noderev.prop_rep {
            rep.sha1 = None;
        }

        // Workaround: the flag must never survive into a revision file.
        noderev.is_fresh_txn_root = false;

        if at_root {
            self.validate_root_noderev(&noderev, new_rev)?;
        }

        let mut w = BufWriter::new(&mut *file);
        noderev.write_to(&mut w)?;
        w.flush()?;
        drop(w);

        Ok(Some(new_id))
    }

    /// Writes BYTES as a plainly stored rep, deduplicating against earlier
    /// reps; on a match the fresh bytes are truncated away again.
    fn write_hash_rep(
        &self,
        file: &mut File,
        new_rev: Rev,
        bytes: &[u8],
        reps_hash: Option<&HashMap<[u8; 20], Representation>>,
    ) -> CResult<Representation> {
        let offset = file.stream_position()?;
        RepHeader::Plain.write_to(file)?;
        file.write_all(bytes)?;

        let mut md5 = Md5::new();
        md5.update(bytes);
        let mut sha1 = Sha1::new();
        sha1.update(bytes);
        let mut rep = Representation {
            location: RepLocation::Rev(new_rev),
            offset,
            size: bytes.len() as u64,
            expanded_size: 0,
            md5: Some(md5.finalize().into()),
            sha1: Some(sha1.finalize().into()),
            uniquifier: None,
        };

        match self.get_shared_rep(&rep, reps_hash)? {
            Some(old_rep) => {
                protorev::truncate_to(file, offset)?;
                rep = old_rep;
            }
            None => file.write_all(b"ENDREP\n")?,
        }
        Ok(rep)
    }

    /// Writes BYTES as a delta-encoded rep against the base chosen for
    /// NODEREV, with the same deduplication as [`Self::write_hash_rep`].
    fn write_hash_delta_rep(
        &self,
        file: &mut File,
        new_rev: Rev,
        bytes: &[u8],
        noderev: &NodeRev,
        reps_hash: Option<&HashMap<[u8; 20], Representation>>,
        props: bool,
    ) -> CResult<Representation> {
        let base_rep = self.choose_delta_base(noderev, props)?;
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

        let offset = file.stream_position()?;
        header.write_to(file)?;
        let delta_start = file.stream_position()?;

        let mut encoder =
            svndiff::Encoder::new(file.try_clone()?, source, self.config.svndiff_version())?;
        encoder.write(bytes)?;
        drop(encoder.finish()?);
        let rep_end = file.seek(SeekFrom::End(0))?;

        let mut md5 = Md5::new();
        md5.update(bytes);
        let mut sha1 = Sha1::new();
        sha1.update(bytes);
        let mut rep = Representation {
            location: RepLocation::Rev(new_rev),
            offset,
            size: rep_end - delta_start,
            expanded_size: bytes.len() as u64,
            md5: Some(md5.finalize().into()),
            sha1: Some(sha1.finalize().into()),
            uniquifier: None,
        };

        match self.get_shared_rep(&rep, reps_hash)? {
            Some(old_rep) => {
                protorev::truncate_to(file, offset)?;
                rep = old_rep;
            }
            None => file.write_all(b"ENDREP\n")?,
        }
        Ok(rep)
    }

    /// The continuity check on the candidate root: its predecessor count
    /// must exceed the head root's by exactly the revision step.
    fn validate_root_noderev(&self, root: &NodeRev, new_rev: Rev) -> CResult<()> {
        let head_rev = new_rev - 1;
        let head_root = self.node_revision(&self.rev_root_id(head_rev)?)?;
        let step = root.predecessor_count as i64 - head_root.predecessor_count as i64;
        if step != new_rev - head_rev {
            return Err(Error::Corrupt(format!(
                "predecessor count for the root node-revision is wrong: found ({}+{} != {}), \
                 committing r{}",
                head_root.predecessor_count,
                new_rev - head_rev,
                root.predecessor_count,
                new_rev
            )));
        }
        Ok(())
    }

    /// Walks the folded change set in depth-first order and re-verifies
    /// path locks, skipping children of paths already verified recursively.
    fn verify_locks(
        &self,
        txn_id: &str,
        verify: &dyn Fn(&str, bool) -> CResult<()>,
    ) -> CResult<()> {
        let folded = self.txn_changed_paths(txn_id)?;
        let mut sorted: Vec<&String> = folded.keys().collect();
        sorted.sort_by(|a, b| compare_paths(a, b));

        let mut last_recursed: Option<String> = None;
        for path in sorted {
            if let Some(last) = &last_recursed {
                if changes::is_child(last, path) {
                    continue;
                }
            }
            // Modifications only need the lock on the path itself; adds
            // and deletions cover the whole subtree.
            let recurse = folded[path.as_str()].kind != ChangeKind::Modify;
            verify(path, recurse)?;
            if recurse {
                last_recursed = Some(path.clone());
            }
        }
        Ok(())
    }
}

/// Assigns the final form of a txn-allocated node or copy id: modern
/// formats produce `<stem>-<rev>`, legacy formats add the stem to the
/// starting id taken from `current`.
fn final_key(key: &str, new_rev: Rev, start: Option<&str>, modern: bool) -> CResult<String> {
    let stem = match key.strip_prefix('_') {
        None => return Ok(key.to_string()),
        Some(stem) => stem,
    };
    if modern {
        Ok(format!("{}-{}", stem, new_rev))
    } else {
        let start = start
            .ok_or_else(|| Error::Corrupt("legacy format without starting ids".into()))?;
        keys::add_keys(start, stem)
    }
}

/// Depth-first path order: component-wise comparison, parents before
/// children.
fn compare_paths(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

fn create_shard_dir(new_dir: &Path, parent: &Path) -> CResult<()> {
    match std::fs::create_dir(new_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    let perms = std::fs::metadata(parent)?.permissions();
    std::fs::set_permissions(new_dir, perms)?;
    Ok(())
}

fn write_reps_to_index(
    reps: &[Representation],
    index: &Mutex<Box<dyn RepIndex + Send>>,
) -> CResult<()> {
    let mut index = index.lock()?;
    for rep in reps {
        if let Some(sha1) = rep.sha1 {
            index.set(&sha1, RepIndexEntry::from_rep(rep).encode()?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_order_is_depth_first() {
        let mut paths = vec!["/a+b", "/a/b", "/a", "/", "/a/b/c", "/ab"];
        paths.sort_by(|a, b| compare_paths(a, b));
        assert_eq!(paths, vec!["/", "/a", "/a/b", "/a/b/c", "/a+b", "/ab"]);
    }

    #[test]
    fn final_keys() -> CResult<()> {
        assert_eq!(final_key("0", 5, None, true)?, "0");
        assert_eq!(final_key("_3", 5, None, true)?, "3-5");
        assert_eq!(final_key("_3", 5, Some("z"), false)?, "12");
        assert!(final_key("_3", 5, None, false).is_err());
        Ok(())
    }
}
