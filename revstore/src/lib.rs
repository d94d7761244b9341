//! `revstore` is a file-backed versioned storage repository. A writer
//! opens a *transaction*, a mutable snapshot rooted at a base revision,
//! mutates nodes and streams content into the transaction's proto-rev
//! file, then commits: under the repository write lock the transaction is
//! atomically promoted to an immutable revision numbered exactly one past
//! the previous head. Representations are deduplicated by SHA-1 across
//! the whole history and delta-encoded along skip-delta chains for
//! bounded-cost historical access.
//!
//! ## Getting started
//!
//! ```rust
//! use std::io::Write;
//!
//! use revstore::changes::{Change, ChangeKind};
//! use revstore::commit::CommitOptions;
//! use revstore::config::Config;
//! use revstore::error::Error;
//! use revstore::noderev::{NodeKind, NodeRev};
//! use revstore::store::Store;
//! use revstore::txn::TxnFlags;
//!
//! fn main() -> Result<(), Error> {
//!     let dir = tempdir::TempDir::new("demo")?;
//!     let store = Store::create(dir.path().join("repo"), Config::default())?;
//!
//!     let txn = store.begin_txn(0, TxnFlags::default())?;
//!     let (root_id, _) = store.txn_ids(&txn.id)?;
//!     let mut root = store.node_revision(&root_id)?;
//!
//!     let mut node = NodeRev::new(root_id, NodeKind::File, "/greeting");
//!     let id = store.create_node(&mut node, "0", &txn.id)?;
//!     let mut contents = store.set_contents(&mut node)?;
//!     contents.write_all(b"hello\n")?;
//!     contents.close()?;
//!
//!     store.set_entry(&txn.id, &mut root, "greeting", Some((id.clone(), NodeKind::File)))?;
//!     store.add_change(&txn.id, &Change {
//!         path: "/greeting".to_string(),
//!         kind: ChangeKind::Add,
//!         node_rev_id: Some(id),
//!         text_mod: true,
//!         prop_mod: false,
//!         node_kind: Some(NodeKind::File),
//!         copyfrom: None,
//!     })?;
//!
//!     let rev = store.commit(&txn, &CommitOptions::default())?;
//!     assert_eq!(rev, 1);
//!     assert_eq!(store.youngest_rev()?, 1);
//!     Ok(())
//! }
//! ```

pub mod changes;
pub mod commit;
pub mod config;
pub mod error;
pub mod hashfile;
pub mod id;
pub mod keys;
pub mod noderev;
pub mod paths;
pub mod protorev;
pub mod registry;
pub mod repcache;
pub mod repsharing;
pub mod repwriter;
pub mod revfile;
pub mod store;
pub mod svndiff;
pub mod txn;
