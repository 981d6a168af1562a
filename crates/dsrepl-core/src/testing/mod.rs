//! Testing infrastructure for the replication core
//!
//! Shared by the unit tests and the integration tests under `tests/`.
//!
//! - **TestContext**: owns the temporary data directory of one test
//! - **ManualClock**: deterministic clock for CSN generators
//! - **fixtures**: configuration and update record builders
//!
//! ```rust,no_run
//! use dsrepl_core::testing::{TestContext, test_config};
//!
//! let ctx = TestContext::new();
//! let config = test_config(&ctx, &["o=test"]);
//! ```

mod clock;
mod context;
mod fixtures;

pub use clock::ManualClock;
pub use context::TestContext;
pub use fixtures::{RecordFactory, test_config};
