//! External changelog (ECL)
//!
//! A single, resumable feed of the changes of every public replicated domain,
//! merged in CSN order and addressed two ways:
//!
//! - **cookie mode**: the reader hands back the [`MultiDomainState`] cookie of
//!   the last entry it processed
//! - **draft mode**: entries carry sequential change numbers assigned the
//!   first time they become visible, see [`DraftNumberIndex`]
//!
//! A change is visible once its domain's eligibility bound has passed it.
//! Private domains never appear.
//!
//! [`MultiDomainState`]: crate::cookie::MultiDomainState
//! [`DraftNumberIndex`]: crate::storage::DraftNumberIndex

mod cursor;
pub mod entry;
pub mod filter;
pub mod session;

pub use entry::{CHANGELOG_SUFFIX, EclEntry};
pub use filter::{ChangeNumberBounds, Filter};
pub use session::{EclStart, EclSubscription, ExternalChangelog, PersistentSearch};
