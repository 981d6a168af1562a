//! Manually driven clock

use crate::csn::Clock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Clock that only moves when told to
///
/// Clones share the same time, so a test can keep one handle and give another
/// to a generator or server.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock frozen at `millis`
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Move forward
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::new(10);
        let other = clock.clone();
        clock.advance(5);
        assert_eq!(other.now_millis(), 15);
        other.set(3);
        assert_eq!(clock.now_millis(), 3);
    }
}
