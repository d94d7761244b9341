//! The external rep index: a key/value mapping from SHA-1 digests to rep
//! descriptors, consulted during rep sharing. The store only depends on
//! this narrow interface; a persistent index lives outside the engine.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::id::Rev;
use crate::noderev::{RepLocation, Representation};

/// A key/value index keyed by SHA-1 digest bytes. Implementations must
/// tolerate concurrent stores writing entries for the same content; the
/// last write wins and any entry for a digest must describe equal content.
pub trait RepIndex: Send {
    /// Gets the encoded entry for a digest, if present.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Sets the encoded entry for a digest, replacing any existing one.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;
}

/// The value stored in the index: where a committed rep lives. Checksums
/// and the uniquifier are not stored; they are backfilled from the rep
/// being deduplicated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepIndexEntry {
    pub revision: Rev,
    pub offset: u64,
    pub size: u64,
    pub expanded_size: u64,
}

impl RepIndexEntry {
    pub fn from_rep(rep: &Representation) -> Self {
        Self {
            revision: rep.rev(),
            offset: rep.offset,
            size: rep.size,
            expanded_size: rep.expanded_size,
        }
    }

    pub fn into_rep(self) -> Representation {
        Representation {
            location: RepLocation::Rev(self.revision),
            offset: self.offset,
            size: self.size,
            expanded_size: self.expanded_size,
            md5: None,
            sha1: None,
            uniquifier: None,
        }
    }

    pub fn encode(&self) -> CResult<Vec<u8>> {
        bincode::serialize(self).map_err(|err| Error::Internal(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        bincode::deserialize(bytes).map_err(|err| Error::Parse(err.to_string()))
    }
}

/// In-memory index backed by a plain map. Suffices for deduplication
/// within one process lifetime and for tests.
#[derive(Debug, Default)]
pub struct MemoryRepIndex {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryRepIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RepIndex for MemoryRepIndex {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() -> CResult<()> {
        let entry = RepIndexEntry { revision: 9, offset: 1234, size: 56, expanded_size: 78 };
        assert_eq!(RepIndexEntry::decode(&entry.encode()?)?, entry);

        let rep = entry.clone().into_rep();
        assert_eq!(rep.rev(), 9);
        assert!(!rep.is_txn());
        assert_eq!(RepIndexEntry::from_rep(&rep), entry);
        Ok(())
    }

    #[test]
    fn memory_index() -> CResult<()> {
        let mut index = MemoryRepIndex::new();
        let key = [0xaa_u8; 20];
        assert_eq!(index.get(&key)?, None);
        index.set(&key, vec![1, 2, 3])?;
        assert_eq!(index.get(&key)?, Some(vec![1, 2, 3]));
        index.set(&key, vec![4])?;
        assert_eq!(index.get(&key)?, Some(vec![4]));
        Ok(())
    }
}
