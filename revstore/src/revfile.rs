//! Reading committed revision files: the trailer, noderev records at known
//! offsets, representation chains and directory listings. Mutable noderevs
//! and the append-only children files of an open transaction are resolved
//! here too, so callers need not care where a node currently lives.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read, Seek, SeekFrom};

use crate::changes::{self, Change};
use crate::error::{CResult, Error};
use crate::hashfile;
use crate::id::{NodeId, Origin, Rev};
use crate::noderev::{parse_dir_entries, DirEntry, NodeKind, NodeRev, RepHeader, RepLocation, Representation};
use crate::paths;
use crate::store::Store;
use crate::svndiff;

/// Upper bound on delta chain hops; a longer chain means a reference cycle
/// or corrupt headers.
const MAX_CHAIN: u64 = 1024;

impl Store {
    pub(crate) fn open_rev_file(&self, rev: Rev) -> CResult<File> {
        let path = paths::rev_file(&self.path, &self.config, rev);
        File::open(&path)
            .map_err(|err| Error::Internal(format!("can't open revision {}: {}", rev, err)))
    }

    /// Reads the trailer line `<root_offset> <changed_path_offset>`.
    pub(crate) fn read_rev_trailer(&self, file: &mut File) -> CResult<(u64, u64)> {
        let len = file.seek(SeekFrom::End(0))?;
        let tail_len = len.min(64);
        file.seek(SeekFrom::End(-(tail_len as i64)))?;
        let mut tail = vec![0u8; tail_len as usize];
        file.read_exact(&mut tail)?;

        if tail.pop() != Some(b'\n') {
            return Err(Error::Corrupt("revision file does not end with a newline".into()));
        }
        let start = tail.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        let line = std::str::from_utf8(&tail[start..])
            .map_err(|_| Error::Corrupt("malformed revision trailer".into()))?;
        let (root, changed) = line
            .split_once(' ')
            .ok_or_else(|| Error::Corrupt("malformed revision trailer".into()))?;
        let root = root.parse().map_err(|_| Error::Corrupt("malformed revision trailer".into()))?;
        let changed =
            changed.parse().map_err(|_| Error::Corrupt("malformed revision trailer".into()))?;
        Ok((root, changed))
    }

    /// The id of the root directory noderev of REV.
    pub fn rev_root_id(&self, rev: Rev) -> CResult<NodeId> {
        let mut file = self.open_rev_file(rev)?;
        let (root_offset, _) = self.read_rev_trailer(&mut file)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(root_offset))?;
        Ok(NodeRev::read_from(&mut reader)?.id)
    }

    /// Reads the noderev the id points at, from the revision file or from
    /// the transaction directory for mutable nodes.
    pub fn node_revision(&self, id: &NodeId) -> CResult<NodeRev> {
        match &id.origin {
            Origin::Txn(txn_id) => {
                let path = paths::txn_node_rev(&self.path, txn_id, id);
                let file = File::open(&path).map_err(|err| {
                    Error::Corrupt(format!("missing node revision '{}': {}", id, err))
                })?;
                NodeRev::read_from(&mut BufReader::new(file))
            }
            Origin::Rev { rev, offset } => {
                let mut reader = BufReader::new(self.open_rev_file(*rev)?);
                reader.seek(SeekFrom::Start(*offset))?;
                NodeRev::read_from(&mut reader)
            }
        }
    }

    /// Reads the header line and raw blob of a committed rep.
    fn read_rep_raw(&self, rev: Rev, offset: u64, size: u64) -> CResult<(RepHeader, Vec<u8>)> {
        let mut reader = BufReader::new(self.open_rev_file(rev)?);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let header = RepHeader::parse(&line)?;
        let mut data = vec![0u8; size as usize];
        reader
            .read_exact(&mut data)
            .map_err(|_| Error::Corrupt(format!("truncated representation in r{}", rev)))?;
        Ok((header, data))
    }

    /// Fully expands a committed representation, following its delta chain.
    pub fn rep_contents(&self, rep: &Representation) -> CResult<Vec<u8>> {
        match &rep.location {
            RepLocation::Rev(rev) => self.expand_rep(*rev, rep.offset, rep.size, 0),
            RepLocation::Txn(_) => {
                Err(Error::Internal("can't expand an uncommitted representation".into()))
            }
        }
    }

    fn expand_rep(&self, rev: Rev, offset: u64, size: u64, depth: u64) -> CResult<Vec<u8>> {
        if depth > MAX_CHAIN {
            return Err(Error::Corrupt("representation delta chain does not terminate".into()));
        }
        let (header, data) = self.read_rep_raw(rev, offset, size)?;
        match header {
            RepHeader::Plain => Ok(data),
            RepHeader::SelfDelta => svndiff::apply(&mut Cursor::new(&data), &[]),
            RepHeader::Delta { base_rev, base_offset, base_length } => {
                let base = self.expand_rep(base_rev, base_offset, base_length, depth + 1)?;
                svndiff::apply(&mut Cursor::new(&data), &base)
            }
        }
    }

    /// Number of representations in the delta chain rooted at REP,
    /// counting REP itself.
    pub(crate) fn rep_chain_length(&self, rep: &Representation) -> CResult<u64> {
        let mut count = 1;
        let (mut rev, mut offset) = match &rep.location {
            RepLocation::Rev(rev) => (*rev, rep.offset),
            RepLocation::Txn(_) => {
                return Err(Error::Internal("can't measure an uncommitted representation".into()))
            }
        };
        loop {
            let mut reader = BufReader::new(self.open_rev_file(rev)?);
            reader.seek(SeekFrom::Start(offset))?;
            let mut line = String::new();
            reader.read_line(&mut line)?;
            match RepHeader::parse(&line)? {
                RepHeader::Plain | RepHeader::SelfDelta => return Ok(count),
                RepHeader::Delta { base_rev, base_offset, .. } => {
                    count += 1;
                    if count > MAX_CHAIN {
                        return Err(Error::Corrupt(
                            "representation delta chain does not terminate".into(),
                        ));
                    }
                    rev = base_rev;
                    offset = base_offset;
                }
            }
        }
    }

    /// Verifies that REP points at a complete, well-formed blob on disk.
    pub(crate) fn check_rep(&self, rep: &Representation) -> CResult<()> {
        let rev = match &rep.location {
            RepLocation::Rev(rev) => *rev,
            RepLocation::Txn(_) => {
                return Err(Error::Corrupt("rep index returned an uncommitted rep".into()))
            }
        };
        let result = (|| -> CResult<()> {
            let mut reader = BufReader::new(self.open_rev_file(rev)?);
            reader.seek(SeekFrom::Start(rep.offset))?;
            let mut line = String::new();
            reader.read_line(&mut line)?;
            RepHeader::parse(&line)?;
            let data_start = rep.offset + line.len() as u64;
            reader.seek(SeekFrom::Start(data_start + rep.size))?;
            let mut marker = [0u8; 7];
            reader.read_exact(&mut marker)?;
            if &marker != b"ENDREP\n" {
                return Err(Error::Corrupt("representation end marker missing".into()));
            }
            Ok(())
        })();
        result.map_err(|err| {
            Error::Corrupt(format!("rep index entry r{}/{} is unusable: {}", rev, rep.offset, err))
        })
    }

    /// The entries of a directory noderev, committed or mutable.
    pub fn dir_entries(&self, noderev: &NodeRev) -> CResult<BTreeMap<String, DirEntry>> {
        if noderev.kind != NodeKind::Dir {
            return Err(Error::Internal(format!("'{}' is not a directory", noderev.id)));
        }
        let rep = match &noderev.data_rep {
            None => return Ok(BTreeMap::new()),
            Some(rep) => rep,
        };
        let map = match &rep.location {
            RepLocation::Txn(txn_id) => {
                let path = paths::txn_node_children(&self.path, txn_id, &noderev.id);
                let file = File::open(&path).map_err(|err| {
                    Error::Corrupt(format!("missing directory contents for '{}': {}", noderev.id, err))
                })?;
                hashfile::read_incremental(&mut BufReader::new(file))?
            }
            RepLocation::Rev(_) => {
                let bytes = self.rep_contents(rep)?;
                hashfile::read_hash(&mut Cursor::new(&bytes))?
            }
        };
        parse_dir_entries(&map)
    }

    /// The folded change map stored in the changes block of REV.
    pub fn paths_changed(&self, rev: Rev) -> CResult<BTreeMap<String, Change>> {
        let mut file = self.open_rev_file(rev)?;
        let (_, changed_offset) = self.read_rev_trailer(&mut file)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(changed_offset))?;
        let mut map = BTreeMap::new();
        for change in changes::read_changes(&mut reader)? {
            map.insert(change.path.clone(), change);
        }
        Ok(map)
    }

    /// Light structural verification of a freshly written revision: the
    /// root must be a readable directory whose entries parse and point at
    /// revisions up to REV.
    pub fn verify_root(&self, rev: Rev) -> CResult<()> {
        let root_id = self.rev_root_id(rev)?;
        let root = self.node_revision(&root_id)?;
        if root.kind != NodeKind::Dir {
            return Err(Error::Corrupt(format!("root of r{} is not a directory", rev)));
        }
        if root.id.rev() != rev {
            return Err(Error::Corrupt(format!("root of r{} claims '{}'", rev, root.id)));
        }
        for (name, entry) in self.dir_entries(&root)? {
            if entry.id.is_txn() || entry.id.rev() > rev {
                return Err(Error::Corrupt(format!(
                    "entry '{}' of r{} points at '{}'",
                    name, rev, entry.id
                )));
            }
            self.node_revision(&entry.id)?;
        }
        Ok(())
    }
}
