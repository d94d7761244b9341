//! The store handle: repository creation and opening, the `current` file,
//! and the coarse advisory locks (`write-lock`, `txn-current-lock`).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::SecondsFormat;
use fs4::FileExt;
use md5::{Digest, Md5};

use crate::config::Config;
use crate::error::{CResult, Error};
use crate::hashfile;
use crate::id::{NodeId, Rev};
use crate::noderev::{NodeKind, NodeRev, RepHeader, RepLocation, Representation};
use crate::paths;
use crate::registry::TxnRegistry;
use crate::repcache::{MemoryRepIndex, RepIndex};
use crate::txn::PROP_REVISION_DATE;

/// A handle to a repository on disk. Handles are cheap to open; several may
/// coexist in one process, though they will then not share the in-process
/// transaction registry and rely purely on the file locks.
pub struct Store {
    pub(crate) path: PathBuf,
    pub(crate) config: Config,
    pub(crate) registry: TxnRegistry,
    pub(crate) rep_index: Option<Mutex<Box<dyn RepIndex + Send>>>,
    pub(crate) warning: Box<dyn Fn(&Error) + Send + Sync>,
}

impl Store {
    /// Initializes a new repository at PATH and returns a handle to it.
    /// The repository starts at revision 0: an empty root directory.
    pub fn create(path: impl Into<PathBuf>, config: Config) -> CResult<Self> {
        let path = path.into();
        if paths::current(&path).exists() {
            return Err(Error::Internal(format!(
                "'{}' already contains a repository",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path)?;
        std::fs::create_dir_all(paths::txns_dir(&path))?;
        if config.protorevs_dir() {
            std::fs::create_dir_all(paths::txn_protos_dir(&path))?;
        }
        std::fs::create_dir_all(paths::rev_shard_dir(&path, &config, 0))?;
        std::fs::create_dir_all(paths::revprops_shard_dir(&path, &config, 0))?;

        File::create(paths::write_lock(&path))?;
        if config.uses_txn_current() {
            File::create(paths::txn_current_lock(&path))?;
            atomic_write(&paths::txn_current(&path), b"0\n")?;
        }

        let store = Self::handle(path, config);
        store.write_revision_zero()?;
        if store.config.modern_ids() {
            store.write_current(0, None)?;
        } else {
            store.write_current(0, Some(("1", "1")))?;
        }
        Ok(store)
    }

    /// Opens an existing repository.
    pub fn open(path: impl Into<PathBuf>, config: Config) -> CResult<Self> {
        let path = path.into();
        if !paths::current(&path).exists() {
            return Err(Error::Internal(format!("no repository at '{}'", path.display())));
        }
        Ok(Self::handle(path, config))
    }

    fn handle(path: PathBuf, config: Config) -> Self {
        let rep_index: Option<Mutex<Box<dyn RepIndex + Send>>> = if config.rep_sharing_allowed {
            Some(Mutex::new(Box::new(MemoryRepIndex::new())))
        } else {
            None
        };
        Self {
            path,
            config,
            registry: TxnRegistry::new(),
            rep_index,
            warning: Box::new(|err| log::warn!("rep index: {}", err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn registry(&self) -> &TxnRegistry {
        &self.registry
    }

    /// Replaces the rep index consulted during rep sharing. Only meaningful
    /// while `rep_sharing_allowed` is set.
    pub fn set_rep_index(&mut self, index: Box<dyn RepIndex + Send>) {
        if self.config.rep_sharing_allowed {
            self.rep_index = Some(Mutex::new(index));
        }
    }

    /// Replaces the sink that receives non-fatal rep index errors.
    pub fn set_warning_sink(&mut self, sink: Box<dyn Fn(&Error) + Send + Sync>) {
        self.warning = sink;
    }

    pub(crate) fn warn(&self, err: &Error) {
        (self.warning)(err)
    }

    /// The head revision: the greatest committed revision number.
    pub fn youngest_rev(&self) -> CResult<Rev> {
        Ok(self.read_current()?.0)
    }

    /// Reads `current`: the head revision and, on legacy formats, the next
    /// available node and copy ids.
    pub(crate) fn read_current(&self) -> CResult<(Rev, Option<(String, String)>)> {
        let content = std::fs::read_to_string(paths::current(&self.path))?;
        let mut fields = content.split_whitespace();
        let rev: Rev = fields
            .next()
            .ok_or_else(|| Error::Corrupt("corrupt 'current' file".into()))?
            .parse()?;
        let ids = match (fields.next(), fields.next()) {
            (Some(node_id), Some(copy_id)) => Some((node_id.to_string(), copy_id.to_string())),
            (None, _) => None,
            _ => return Err(Error::Corrupt("corrupt 'current' file".into())),
        };
        if !self.config.modern_ids() && ids.is_none() {
            return Err(Error::Corrupt("corrupt 'current' file".into()));
        }
        Ok((rev, ids))
    }

    /// Atomically publishes a new `current` file.
    pub(crate) fn write_current(&self, rev: Rev, ids: Option<(&str, &str)>) -> CResult<()> {
        let content = match ids {
            Some((node_id, copy_id)) => format!("{} {} {}\n", rev, node_id, copy_id),
            None => format!("{}\n", rev),
        };
        atomic_write(&paths::current(&self.path), content.as_bytes())
    }

    /// Runs BODY while holding the repository write lock. At most one
    /// committer runs at a time across all processes.
    pub(crate) fn with_write_lock<T>(&self, body: impl FnOnce() -> CResult<T>) -> CResult<T> {
        let _guard = FileLockGuard::acquire(&paths::write_lock(&self.path))?;
        body()
    }

    /// Runs BODY while holding the `txn-current` lock.
    pub(crate) fn with_txn_current_lock<T>(
        &self,
        body: impl FnOnce() -> CResult<T>,
    ) -> CResult<T> {
        let _guard = FileLockGuard::acquire(&paths::txn_current_lock(&self.path))?;
        body()
    }

    /// Writes the revision 0 file (an empty root directory with an empty
    /// changes block) and its revprops.
    fn write_revision_zero(&self) -> CResult<()> {
        let mut dir_bytes = Vec::new();
        hashfile::write_hash(&mut dir_bytes, &Default::default(), true)?;

        let mut file = Vec::new();
        RepHeader::Plain.write_to(&mut file)?;
        let data_start = file.len() as u64;
        file.extend_from_slice(&dir_bytes);
        file.extend_from_slice(b"ENDREP\n");

        let mut md5 = Md5::new();
        md5.update(&dir_bytes);
        let rep = Representation {
            location: RepLocation::Rev(0),
            offset: 0,
            size: file.len() as u64 - data_start - b"ENDREP\n".len() as u64,
            expanded_size: 0,
            md5: Some(md5.finalize().into()),
            sha1: None,
            uniquifier: None,
        };

        let root_offset = file.len() as u64;
        let mut root = NodeRev::new(NodeId::for_rev("0", "0", 0, root_offset), NodeKind::Dir, "/");
        root.data_rep = Some(rep);
        root.write_to(&mut file)?;

        let changed_path_offset = file.len() as u64;
        file.extend_from_slice(b"\n");
        file.extend_from_slice(format!("{} {}\n", root_offset, changed_path_offset).as_bytes());
        atomic_write(&paths::rev_file(&self.path, &self.config, 0), &file)?;

        let mut props = std::collections::BTreeMap::new();
        props.insert(PROP_REVISION_DATE.to_string(), timestamp_now());
        let mut prop_bytes = Vec::new();
        hashfile::write_hash(&mut prop_bytes, &props, true)?;
        atomic_write(&paths::revprops_file(&self.path, &self.config, 0), &prop_bytes)
    }
}

/// A blocking exclusive advisory lock, released on drop.
struct FileLockGuard {
    file: File,
}

impl FileLockGuard {
    fn acquire(path: &Path) -> CResult<Self> {
        let file = OpenOptions::new().write(true).create(true).open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            log::error!("failed to release file lock: {}", err);
        }
    }
}

/// Writes CONTENT to PATH via a sibling temporary file and a rename, so
/// that readers never observe a partial file.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> CResult<()> {
    let mut tmp = path.to_path_buf();
    let mut name = tmp
        .file_name()
        .ok_or_else(|| Error::Internal(format!("bad path '{}'", path.display())))?
        .to_os_string();
    name.push(".tmp");
    tmp.set_file_name(name);

    let mut file = File::create(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Moves FROM over TO and flushes the rename to disk.
pub(crate) fn move_into_place(from: &Path, to: &Path) -> CResult<()> {
    std::fs::rename(from, to)?;
    #[cfg(unix)]
    if let Some(parent) = to.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// The current time in the fixed-precision UTC form stored in date props.
pub(crate) fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("store")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        assert_eq!(store.youngest_rev()?, 0);

        // Creating over an existing repository is refused.
        assert!(Store::create(dir.path().join("repo"), Config::default()).is_err());

        let reopened = Store::open(dir.path().join("repo"), Config::default())?;
        assert_eq!(reopened.youngest_rev()?, 0);

        assert!(Store::open(dir.path().join("absent"), Config::default()).is_err());
        Ok(())
    }

    #[test]
    fn revision_zero_is_an_empty_root() -> CResult<()> {
        let dir = tempdir::TempDir::new("store")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;

        let root_id = store.rev_root_id(0)?;
        let root = store.node_revision(&root_id)?;
        assert_eq!(root.kind, NodeKind::Dir);
        assert_eq!(root.predecessor_count, 0);
        assert!(store.dir_entries(&root)?.is_empty());
        assert!(store.paths_changed(0)?.is_empty());
        Ok(())
    }

    #[test]
    fn legacy_current_carries_ids() -> CResult<()> {
        let dir = tempdir::TempDir::new("store")?;
        let store = Store::create(dir.path().join("repo"), Config::legacy())?;
        let (rev, ids) = store.read_current()?;
        assert_eq!(rev, 0);
        assert_eq!(ids, Some(("1".to_string(), "1".to_string())));
        Ok(())
    }

    #[test]
    fn current_is_replaced_atomically() -> CResult<()> {
        let dir = tempdir::TempDir::new("store")?;
        let store = Store::create(dir.path().join("repo"), Config::default())?;
        store.write_current(7, None)?;
        assert_eq!(store.youngest_rev()?, 7);
        Ok(())
    }
}
