//! TestContext - owns the on-disk state of one test

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary data directory removed when the context is dropped
///
/// LMDB environments opened under the context must be dropped before it, so
/// keep the context alive for the whole test:
///
/// ```rust,no_run
/// use dsrepl_core::testing::TestContext;
///
/// let ctx = TestContext::new();
/// let dir = ctx.data_dir("server-1");
/// assert!(dir.exists());
/// ```
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Named sub-directory, created on first use
    ///
    /// The same name always maps to the same directory, which is how restart
    /// tests reopen a server on its previous data.
    pub fn data_dir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create test data directory");
        dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
