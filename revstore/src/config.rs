use serde_derive::{Deserialize, Serialize};

/// Oldest on-disk format: global base-36 ids in `current`, proto-rev files
/// inside the transaction directory, brute-forced transaction names.
pub const FORMAT_1: u32 = 1;
/// Adds svndiff1 representation encoding.
pub const MIN_SVNDIFF1_FORMAT: u32 = 2;
/// Adds the `txn-current` counter, the `txn-protorevs` directory and
/// per-revision node/copy ids ("<stem>-<rev>").
pub const MIN_TXN_CURRENT_FORMAT: u32 = 3;
pub const MIN_PROTOREVS_DIR_FORMAT: u32 = 3;
pub const MIN_NO_GLOBAL_IDS_FORMAT: u32 = 3;
/// The format written by default.
pub const CURRENT_FORMAT: u32 = 4;

/// Store configuration. All tunables are fixed at open time; they are not
/// persisted inside the repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// On-disk format number; governs id assignment, the txn naming scheme
    /// and the svndiff version.
    pub format: u32,

    /// Deduplicate representations by SHA-1 across history and within
    /// uncommitted transactions.
    pub rep_sharing_allowed: bool,

    /// Delta-encode directory listings in final revision files instead of
    /// storing them plainly.
    pub deltify_directories: bool,

    /// Delta-encode property lists in final revision files.
    pub deltify_properties: bool,

    /// Below this distance from the head, delta chains are linear rather
    /// than skipping; minimizes delta size for hot revisions.
    pub max_linear_deltification: u64,

    /// Longest predecessor walk allowed when picking a delta base; longer
    /// histories restart with a self-delta to bound reconstruction cost.
    pub max_deltification_walk: u64,

    /// Number of revision files per shard directory; 0 stores revision
    /// files directly under `revs/`.
    pub max_files_per_dir: u64,

    /// Re-open the store and verify the new root before bumping `current`.
    pub verify_before_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format: CURRENT_FORMAT,
            rep_sharing_allowed: true,
            deltify_directories: false,
            deltify_properties: false,
            max_linear_deltification: 16,
            max_deltification_walk: 1023,
            max_files_per_dir: 1000,
            verify_before_commit: false,
        }
    }
}

impl Config {
    /// A configuration matching repositories created before the modern
    /// layout existed. Used by tests and migration tooling.
    pub fn legacy() -> Self {
        Self { format: FORMAT_1, ..Self::default() }
    }

    pub fn svndiff_version(&self) -> u8 {
        if self.format >= MIN_SVNDIFF1_FORMAT {
            1
        } else {
            0
        }
    }

    /// Modern formats assign final ids as `<stem>-<rev>`; legacy formats
    /// add the txn counter to the starting id recorded in `current`.
    pub fn modern_ids(&self) -> bool {
        self.format >= MIN_NO_GLOBAL_IDS_FORMAT
    }

    pub fn uses_txn_current(&self) -> bool {
        self.format >= MIN_TXN_CURRENT_FORMAT
    }

    pub fn protorevs_dir(&self) -> bool {
        self.format >= MIN_PROTOREVS_DIR_FORMAT
    }
}
