//! The filesystem layout of a transaction directory and every mutation
//! that happens inside one: id allocation, noderev storage, directory
//! entry edits, property lists and the append-only changes log.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};

use crate::changes::{fold_changes, Change};
use crate::error::{CResult, Error};
use crate::hashfile;
use crate::id::{NodeId, Rev};
use crate::keys;
use crate::noderev::{unparse_dir_entries, DirEntry, NodeKind, NodeRev, RepLocation, Representation};
use crate::paths;
use crate::store::{atomic_write, timestamp_now, Store};

/// Stamped on every revision and on fresh transactions, so abandoned
/// transactions can be aged out by administrators.
pub const PROP_REVISION_DATE: &str = "svn:date";
/// Flag prop recording that the client asked for an out-of-date check.
pub const PROP_TXN_CHECK_OOD: &str = "check-ood";
/// Flag prop recording that the client asked for lock verification.
pub const PROP_TXN_CHECK_LOCKS: &str = "check-locks";

const LEGACY_MAX_ATTEMPTS: u32 = 99999;

/// Behaviors requested when a transaction is created, recorded as
/// temporary txn props and stripped again at commit.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxnFlags {
    pub check_out_of_date: bool,
    pub check_locks: bool,
}

/// An open transaction: a mutable snapshot rooted at `base_rev`.
#[derive(Clone, Debug, PartialEq)]
pub struct Txn {
    pub id: String,
    pub base_rev: Rev,
}

impl Store {
    /// Creates a transaction based on BASE_REV and stamps its initial
    /// properties.
    pub fn begin_txn(&self, base_rev: Rev, flags: TxnFlags) -> CResult<Txn> {
        let txn = self.create_txn(base_rev)?;

        let mut edits: Vec<(String, Option<String>)> =
            vec![(PROP_REVISION_DATE.to_string(), Some(timestamp_now()))];
        if flags.check_out_of_date {
            edits.push((PROP_TXN_CHECK_OOD.to_string(), Some("true".to_string())));
        }
        if flags.check_locks {
            edits.push((PROP_TXN_CHECK_LOCKS.to_string(), Some("true".to_string())));
        }
        self.change_txn_props(&txn.id, &edits)?;
        Ok(txn)
    }

    fn create_txn(&self, base_rev: Rev) -> CResult<Txn> {
        let txn_id = if self.config.uses_txn_current() {
            self.create_txn_dir(base_rev)?
        } else {
            self.create_txn_dir_legacy(base_rev)?
        };

        // Clone the base revision's root into the transaction.
        let root_id = self.rev_root_id(base_rev)?;
        let mut root = self.node_revision(&root_id)?;
        if root.id.is_txn() {
            return Err(Error::Corrupt("copying from transactions not allowed".into()));
        }
        let node_id = root.id.node_id.clone();
        let copy_id = root.id.copy_id.clone();
        root.predecessor_id = Some(root.id.clone());
        root.predecessor_count += 1;
        root.copyfrom = None;
        root.id = NodeId::for_txn(node_id, copy_id, txn_id.clone());
        self.put_node_revision(&mut root, true)?;

        File::create(paths::txn_proto_rev(&self.path, &self.config, &txn_id))?;
        File::create(paths::txn_proto_rev_lock(&self.path, &self.config, &txn_id))?;
        File::create(paths::txn_changes(&self.path, &txn_id))?;
        std::fs::write(paths::txn_next_ids(&self.path, &txn_id), b"0 0\n")?;

        Ok(Txn { id: txn_id, base_rev })
    }

    /// Draws the next value from the `txn-current` counter under its lock
    /// and creates `txns/<base_rev>-<seq>.txn`.
    fn create_txn_dir(&self, base_rev: Rev) -> CResult<String> {
        let txn_current = paths::txn_current(&self.path);
        let seq = self.with_txn_current_lock(|| {
            let content = std::fs::read_to_string(&txn_current)?;
            let current = content.trim().to_string();
            let next = keys::next_key(&current)?;
            atomic_write(&txn_current, format!("{}\n", next).as_bytes())?;
            Ok(current)
        })?;
        let txn_id = format!("{}-{}", base_rev, seq);
        std::fs::create_dir(paths::txn_dir(&self.path, &txn_id))?;
        Ok(txn_id)
    }

    /// Pre-txn-current layout: probe sequential numeric suffixes until a
    /// directory creation succeeds. Transaction ids can be reused here.
    fn create_txn_dir_legacy(&self, base_rev: Rev) -> CResult<String> {
        for attempt in 1..=LEGACY_MAX_ATTEMPTS {
            let txn_id = format!("{}-{}", base_rev, attempt);
            match std::fs::create_dir(paths::txn_dir(&self.path, &txn_id)) {
                Ok(()) => return Ok(txn_id),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::UniqueNamesExhausted(format!(
            "unable to create transaction directory in '{}' for revision {}",
            self.path.display(),
            base_rev
        )))
    }

    /// Opens a transaction left on disk by this or another process.
    pub fn open_txn(&self, name: &str) -> CResult<Txn> {
        if !paths::txn_dir(&self.path, name).is_dir() {
            return Err(Error::NoSuchTransaction(name.to_string()));
        }
        let root = self.node_revision(&NodeId::for_txn("0", "0", name))?;
        let base_rev = root
            .predecessor_id
            .as_ref()
            .map(NodeId::rev)
            .ok_or_else(|| Error::Corrupt(format!("transaction '{}' has no base", name)))?;
        Ok(Txn { id: name.to_string(), base_rev })
    }

    /// Names of all transactions currently on disk, in no particular order.
    pub fn list_txns(&self) -> CResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(paths::txns_dir(&self.path))? {
            let name = entry?.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".txn") {
                names.push(id.to_string());
            }
        }
        Ok(names)
    }

    /// Removes a transaction: its registry entry, its directory and (in
    /// the modern layout) its proto-rev file and lock. The proto-rev files
    /// may already be gone after a successful commit.
    pub fn purge_txn(&self, txn_id: &str) -> CResult<()> {
        self.registry.with_lock(|table| {
            table.purge(txn_id);
            Ok(())
        })?;
        std::fs::remove_dir_all(paths::txn_dir(&self.path, txn_id))?;
        if self.config.protorevs_dir() {
            remove_if_present(&paths::txn_proto_rev(&self.path, &self.config, txn_id))?;
            remove_if_present(&paths::txn_proto_rev_lock(&self.path, &self.config, txn_id))?;
        }
        Ok(())
    }

    /// Aborts TXN, removing everything it wrote.
    pub fn abort_txn(&self, txn: &Txn) -> CResult<()> {
        self.purge_txn(&txn.id)
    }

    /// The mutable root id and the base revision root id of a transaction.
    pub fn txn_ids(&self, txn_id: &str) -> CResult<(NodeId, NodeId)> {
        let root = self.node_revision(&NodeId::for_txn("0", "0", txn_id))?;
        let base = root
            .predecessor_id
            .clone()
            .ok_or_else(|| Error::Corrupt(format!("transaction '{}' has no base", txn_id)))?;
        Ok((root.id, base))
    }

    /// The full transaction property list.
    pub fn txn_proplist(&self, txn_id: &str) -> CResult<BTreeMap<String, String>> {
        let file = File::open(paths::txn_props(&self.path, txn_id))?;
        hashfile::read_hash(&mut BufReader::new(file))
    }

    pub fn txn_prop(&self, txn_id: &str, name: &str) -> CResult<Option<String>> {
        Ok(self.txn_proplist(txn_id)?.remove(name))
    }

    /// Applies EDITS (`None` deletes) to the txn props and atomically
    /// rewrites the file. A missing props file is tolerated because the
    /// initial properties are set while the transaction is being created.
    pub fn change_txn_props(
        &self,
        txn_id: &str,
        edits: &[(String, Option<String>)],
    ) -> CResult<()> {
        let path = paths::txn_props(&self.path, txn_id);
        let mut props = match File::open(&path) {
            Ok(file) => hashfile::read_hash(&mut BufReader::new(file))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        for (name, value) in edits {
            match value {
                Some(value) => props.insert(name.clone(), value.clone()),
                None => props.remove(name),
            };
        }
        let mut buf = Vec::new();
        hashfile::write_hash(&mut buf, &props, true)?;
        atomic_write(&path, &buf)
    }

    pub(crate) fn read_next_ids(&self, txn_id: &str) -> CResult<(String, String)> {
        let content = std::fs::read_to_string(paths::txn_next_ids(&self.path, txn_id))?;
        let mut fields = content.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(node_id), Some(copy_id)) => Ok((node_id.to_string(), copy_id.to_string())),
            _ => Err(Error::Corrupt("next-ids file corrupt".into())),
        }
    }

    fn write_next_ids(&self, txn_id: &str, node_id: &str, copy_id: &str) -> CResult<()> {
        let mut file = File::create(paths::txn_next_ids(&self.path, txn_id))?;
        write!(file, "{} {}\n", node_id, copy_id)?;
        Ok(())
    }

    /// Allocates a node id unique to this transaction. The returned id is
    /// prefixed with `_` to mark it as txn-allocated; the final form is
    /// assigned when the transaction is committed.
    pub(crate) fn alloc_node_id(&self, txn_id: &str) -> CResult<String> {
        let (node_id, copy_id) = self.read_next_ids(txn_id)?;
        self.write_next_ids(txn_id, &keys::next_key(&node_id)?, &copy_id)?;
        Ok(format!("_{}", node_id))
    }

    /// Allocates a copy id unique to this transaction.
    pub fn reserve_copy_id(&self, txn_id: &str) -> CResult<String> {
        let (node_id, copy_id) = self.read_next_ids(txn_id)?;
        self.write_next_ids(txn_id, &node_id, &keys::next_key(&copy_id)?)?;
        Ok(format!("_{}", copy_id))
    }

    /// Writes NODEREV into its transaction directory, replacing any
    /// previous version of the record.
    pub fn put_node_revision(&self, noderev: &mut NodeRev, fresh_txn_root: bool) -> CResult<()> {
        noderev.is_fresh_txn_root = fresh_txn_root;
        let txn_id = noderev
            .id
            .txn_id()
            .ok_or_else(|| {
                Error::Corrupt(format!("attempted to write to non-transaction '{}'", noderev.id))
            })?
            .to_string();
        let path = paths::txn_node_rev(&self.path, &txn_id, &noderev.id);
        let mut w = BufWriter::new(File::create(path)?);
        noderev.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Allocates an id for NODEREV and stores it as a new node in the
    /// transaction. Returns the assigned id.
    pub fn create_node(
        &self,
        noderev: &mut NodeRev,
        copy_id: &str,
        txn_id: &str,
    ) -> CResult<NodeId> {
        let node_id = self.alloc_node_id(txn_id)?;
        noderev.id = NodeId::for_txn(node_id, copy_id, txn_id);
        self.put_node_revision(noderev, false)?;
        Ok(noderev.id.clone())
    }

    /// Stores NEW_NODEREV as the successor of OLD_ID within the
    /// transaction, keeping the node id and, unless overridden, the copy
    /// id. Fills in a default copyroot for nodes that are not copies.
    pub fn create_successor(
        &self,
        old_id: &NodeId,
        new_noderev: &mut NodeRev,
        copy_id: Option<&str>,
        txn_id: &str,
    ) -> CResult<NodeId> {
        let copy_id = copy_id.unwrap_or(&old_id.copy_id);
        new_noderev.id = NodeId::for_txn(old_id.node_id.clone(), copy_id, txn_id);
        if new_noderev.copyroot.is_none() {
            new_noderev.copyroot =
                Some((new_noderev.id.rev(), new_noderev.created_path.clone()));
        }
        self.put_node_revision(new_noderev, false)?;
        Ok(new_noderev.id.clone())
    }

    /// Removes a mutable noderev and any mutable rep files it owns.
    pub fn delete_node_revision(&self, id: &NodeId) -> CResult<()> {
        let noderev = self.node_revision(id)?;
        let txn_id = id
            .txn_id()
            .ok_or_else(|| Error::Corrupt(format!("'{}' is not a transaction node", id)))?;

        if noderev.prop_rep.as_ref().map_or(false, Representation::is_txn) {
            std::fs::remove_file(paths::txn_node_props(&self.path, txn_id, id))?;
        }
        if noderev.kind == NodeKind::Dir
            && noderev.data_rep.as_ref().map_or(false, Representation::is_txn)
        {
            std::fs::remove_file(paths::txn_node_children(&self.path, txn_id, id))?;
        }
        std::fs::remove_file(paths::txn_node_rev(&self.path, txn_id, id))?;
        Ok(())
    }

    /// Adds, replaces or deletes (`entry == None`) one name in a mutable
    /// directory. The first edit of a committed directory snapshots its
    /// entries into the append-only children file and makes the data rep
    /// mutable.
    pub fn set_entry(
        &self,
        txn_id: &str,
        parent: &mut NodeRev,
        name: &str,
        entry: Option<(NodeId, NodeKind)>,
    ) -> CResult<()> {
        let filename = paths::txn_node_children(&self.path, txn_id, &parent.id);
        let mut out = if !parent.data_rep.as_ref().map_or(false, Representation::is_txn) {
            let entries = self.dir_entries(parent)?;
            let mut w = BufWriter::new(File::create(&filename)?);
            hashfile::write_hash(&mut w, &unparse_dir_entries(&entries), false)?;

            let mut rep = Representation::new_mutable(txn_id);
            rep.uniquifier = Some(format!("{}/{}", txn_id, self.alloc_node_id(txn_id)?));
            parent.data_rep = Some(rep);
            self.put_node_revision(parent, false)?;
            w
        } else {
            BufWriter::new(OpenOptions::new().append(true).open(&filename)?)
        };

        match entry {
            Some((id, kind)) => {
                hashfile::write_entry(&mut out, name, &DirEntry { kind, id }.unparse())?
            }
            None => hashfile::write_delete(&mut out, name)?,
        }
        out.flush()?;
        Ok(())
    }

    /// Replaces the property list of a mutable node, making its prop rep
    /// mutable on the first write.
    pub fn set_proplist(
        &self,
        noderev: &mut NodeRev,
        props: &BTreeMap<String, String>,
    ) -> CResult<()> {
        let txn_id = noderev
            .id
            .txn_id()
            .ok_or_else(|| {
                Error::Corrupt(format!("attempted to write to non-transaction '{}'", noderev.id))
            })?
            .to_string();
        let path = paths::txn_node_props(&self.path, &txn_id, &noderev.id);
        let mut w = BufWriter::new(File::create(path)?);
        hashfile::write_hash(&mut w, props, true)?;
        w.flush()?;

        if !noderev.prop_rep.as_ref().map_or(false, Representation::is_txn) {
            noderev.prop_rep = Some(Representation::new_mutable(txn_id));
            self.put_node_revision(noderev, false)?;
        }
        Ok(())
    }

    /// The property list of a node, mutable or committed.
    pub fn node_proplist(&self, noderev: &NodeRev) -> CResult<BTreeMap<String, String>> {
        let rep = match &noderev.prop_rep {
            None => return Ok(BTreeMap::new()),
            Some(rep) => rep,
        };
        match &rep.location {
            RepLocation::Txn(txn_id) => {
                let path = paths::txn_node_props(&self.path, txn_id, &noderev.id);
                hashfile::read_hash(&mut BufReader::new(File::open(path)?))
            }
            RepLocation::Rev(_) => {
                let bytes = self.rep_contents(rep)?;
                hashfile::read_hash(&mut std::io::Cursor::new(&bytes))
            }
        }
    }

    /// Appends one record to the transaction's changes log.
    pub fn add_change(&self, txn_id: &str, change: &Change) -> CResult<()> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(paths::txn_changes(&self.path, txn_id))?;
        let mut w = BufWriter::new(file);
        change.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// The raw changes log, in write order.
    pub(crate) fn txn_changes(&self, txn_id: &str) -> CResult<Vec<Change>> {
        let file = File::open(paths::txn_changes(&self.path, txn_id))?;
        crate::changes::read_changes(&mut BufReader::new(file))
    }

    /// The folded, canonical per-path change map of a transaction.
    pub fn txn_changed_paths(&self, txn_id: &str) -> CResult<BTreeMap<String, Change>> {
        fold_changes(&self.txn_changes(txn_id)?)
    }
}

fn remove_if_present(path: &std::path::Path) -> CResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
