//! Deterministic naming of every on-disk artifact. All functions are pure;
//! none of them touch the filesystem.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::id::{NodeId, Rev};

pub const PATH_CURRENT: &str = "current";
pub const PATH_TXN_CURRENT: &str = "txn-current";
pub const PATH_TXN_CURRENT_LOCK: &str = "txn-current-lock";
pub const PATH_WRITE_LOCK: &str = "write-lock";
pub const PATH_TXNS_DIR: &str = "txns";
pub const PATH_TXN_PROTOS_DIR: &str = "txn-protorevs";
pub const PATH_REVS_DIR: &str = "revs";
pub const PATH_REVPROPS_DIR: &str = "revprops";

const PATH_EXT_TXN: &str = ".txn";
const PATH_EXT_REV: &str = ".rev";
const PATH_EXT_REV_LOCK: &str = ".rev-lock";
const PATH_TXN_PROPS: &str = "props";
const PATH_NEXT_IDS: &str = "next-ids";
const PATH_CHANGES: &str = "changes";
const PATH_PROTO_REV: &str = "rev";
const PATH_PROTO_REV_LOCK: &str = "rev-lock";

pub fn current(root: &Path) -> PathBuf {
    root.join(PATH_CURRENT)
}

pub fn txn_current(root: &Path) -> PathBuf {
    root.join(PATH_TXN_CURRENT)
}

pub fn txn_current_lock(root: &Path) -> PathBuf {
    root.join(PATH_TXN_CURRENT_LOCK)
}

pub fn write_lock(root: &Path) -> PathBuf {
    root.join(PATH_WRITE_LOCK)
}

pub fn txns_dir(root: &Path) -> PathBuf {
    root.join(PATH_TXNS_DIR)
}

/// The per-transaction directory, `txns/<txn_id>.txn`.
pub fn txn_dir(root: &Path, txn_id: &str) -> PathBuf {
    txns_dir(root).join(format!("{}{}", txn_id, PATH_EXT_TXN))
}

pub fn txn_props(root: &Path, txn_id: &str) -> PathBuf {
    txn_dir(root, txn_id).join(PATH_TXN_PROPS)
}

pub fn txn_next_ids(root: &Path, txn_id: &str) -> PathBuf {
    txn_dir(root, txn_id).join(PATH_NEXT_IDS)
}

pub fn txn_changes(root: &Path, txn_id: &str) -> PathBuf {
    txn_dir(root, txn_id).join(PATH_CHANGES)
}

/// The sha1->rep mapping scratch file for intra-txn deduplication.
pub fn txn_sha1(root: &Path, txn_id: &str, sha1_hex: &str) -> PathBuf {
    txn_dir(root, txn_id).join(sha1_hex)
}

fn node_basename(id: &NodeId) -> String {
    format!("node.{}.{}", id.node_id, id.copy_id)
}

/// The mutable noderev record, `node.<node_id>.<copy_id>`.
pub fn txn_node_rev(root: &Path, txn_id: &str, id: &NodeId) -> PathBuf {
    txn_dir(root, txn_id).join(node_basename(id))
}

pub fn txn_node_children(root: &Path, txn_id: &str, id: &NodeId) -> PathBuf {
    txn_dir(root, txn_id).join(format!("{}.children", node_basename(id)))
}

pub fn txn_node_props(root: &Path, txn_id: &str, id: &NodeId) -> PathBuf {
    txn_dir(root, txn_id).join(format!("{}.props", node_basename(id)))
}

pub fn txn_protos_dir(root: &Path) -> PathBuf {
    root.join(PATH_TXN_PROTOS_DIR)
}

pub fn txn_proto_rev(root: &Path, config: &Config, txn_id: &str) -> PathBuf {
    if config.protorevs_dir() {
        txn_protos_dir(root).join(format!("{}{}", txn_id, PATH_EXT_REV))
    } else {
        txn_dir(root, txn_id).join(PATH_PROTO_REV)
    }
}

pub fn txn_proto_rev_lock(root: &Path, config: &Config, txn_id: &str) -> PathBuf {
    if config.protorevs_dir() {
        txn_protos_dir(root).join(format!("{}{}", txn_id, PATH_EXT_REV_LOCK))
    } else {
        txn_dir(root, txn_id).join(PATH_PROTO_REV_LOCK)
    }
}

pub fn revs_dir(root: &Path) -> PathBuf {
    root.join(PATH_REVS_DIR)
}

pub fn revprops_dir(root: &Path) -> PathBuf {
    root.join(PATH_REVPROPS_DIR)
}

/// The shard directory holding revision `rev`, or `revs/` itself when the
/// store is unsharded.
pub fn rev_shard_dir(root: &Path, config: &Config, rev: Rev) -> PathBuf {
    if config.max_files_per_dir > 0 {
        revs_dir(root).join(format!("{}", rev as u64 / config.max_files_per_dir))
    } else {
        revs_dir(root)
    }
}

pub fn rev_file(root: &Path, config: &Config, rev: Rev) -> PathBuf {
    rev_shard_dir(root, config, rev).join(format!("{}", rev))
}

pub fn revprops_shard_dir(root: &Path, config: &Config, rev: Rev) -> PathBuf {
    if config.max_files_per_dir > 0 {
        revprops_dir(root).join(format!("{}", rev as u64 / config.max_files_per_dir))
    } else {
        revprops_dir(root)
    }
}

pub fn revprops_file(root: &Path, config: &Config, rev: Rev) -> PathBuf {
    revprops_shard_dir(root, config, rev).join(format!("{}", rev))
}
