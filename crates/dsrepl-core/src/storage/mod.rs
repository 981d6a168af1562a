//! Durable storage: per-domain change logs and the draft-number index
//!
//! Every database lives in one LMDB environment under the server data
//! directory:
//!
//! ```text
//! data_dir/
//!   data.mdb
//!     changelog_meta          normalized dn -> StoreMeta
//!     changelog:<dn>          14-byte CSN   -> UpdateRecord   (one per domain)
//!     draft_by_number         u64 BE        -> DraftRecord
//!     draft_by_change         dn \0 CSN     -> u64 BE
//!     draft_meta              "main"        -> DraftMeta
//! ```

pub mod changelog;
pub mod draft;

pub use changelog::{ChangeLogStore, ChangelogCursor, PurgeOutcome};
pub use draft::{DraftLookup, DraftNumberIndex, DraftRecord};

use crate::Result;
use changelog::StoreMeta;
use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use std::path::{Path, PathBuf};

/// Upper bound on named databases in the environment
const MAX_DBS: u32 = 256;

/// Canonical form of a base DN used as storage key
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Shared LMDB environment of a replication server
#[derive(Clone)]
pub struct ChangelogDb {
    env: Env,
    path: PathBuf,
    meta: Database<Str, SerdeBincode<StoreMeta>>,
}

impl ChangelogDb {
    /// Open or create the environment under `path`
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(MAX_DBS)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let meta = env.create_database(&mut wtxn, Some("changelog_meta"))?;
        wtxn.commit()?;

        tracing::info!(path = %path.display(), map_size, "Opened changelog environment");
        Ok(Self {
            env,
            path: path.to_path_buf(),
            meta,
        })
    }

    /// Open or create the change log of one domain
    pub fn open_store(&self, base_dn: &str, batch_size: usize) -> Result<ChangeLogStore> {
        ChangeLogStore::open(self.env.clone(), self.meta, base_dn, batch_size)
    }

    /// Open or create the draft-number index
    pub fn draft_index(&self) -> Result<DraftNumberIndex> {
        DraftNumberIndex::open(self.env.clone())
    }

    /// Directory of the environment
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush to disk
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for ChangelogDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangelogDb").field("path", &self.path).finish()
    }
}
