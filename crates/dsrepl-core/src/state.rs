//! Replica state vector: per-replica high-water marks inside one domain

use crate::csn::{Csn, ReplicaId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Highest CSN seen for each replica of one replicated domain
///
/// Entries only ever move forward: merging an older CSN is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaStateVector {
    csns: BTreeMap<ReplicaId, Csn>,
}

impl ReplicaStateVector {
    /// Empty vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the entry of `csn`'s replica if `csn` is newer; returns whether it changed
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.replica_id()) {
            Some(current) if *current >= csn => false,
            _ => {
                self.csns.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Merge every entry of another vector
    pub fn merge(&mut self, other: &ReplicaStateVector) {
        for csn in other.csns() {
            self.update(csn);
        }
    }

    /// Entry for a replica
    pub fn get(&self, replica_id: ReplicaId) -> Option<Csn> {
        self.csns.get(&replica_id).copied()
    }

    /// Whether `csn` has already been seen
    pub fn covers(&self, csn: &Csn) -> bool {
        self.get(csn.replica_id()).is_some_and(|seen| *csn <= seen)
    }

    /// True iff every entry of `self` is at or below the matching entry of `other`
    pub fn is_covered_by(&self, other: &ReplicaStateVector) -> bool {
        self.csns.values().all(|csn| other.covers(csn))
    }

    /// Iterate `(replica, csn)` in replica order
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Csn)> + '_ {
        self.csns.iter().map(|(r, c)| (*r, *c))
    }

    /// Iterate the CSNs in replica order
    pub fn csns(&self) -> impl Iterator<Item = Csn> + '_ {
        self.csns.values().copied()
    }

    /// Replicas with an entry
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.csns.keys().copied()
    }

    /// Number of replicas tracked
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// Whether no replica is tracked
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Oldest entry
    pub fn min_csn(&self) -> Option<Csn> {
        self.csns.values().min().copied()
    }

    /// Newest entry
    pub fn max_csn(&self) -> Option<Csn> {
        self.csns.values().max().copied()
    }

    /// Drop the entry of a replica
    pub fn remove(&mut self, replica_id: ReplicaId) -> Option<Csn> {
        self.csns.remove(&replica_id)
    }
}

impl FromIterator<Csn> for ReplicaStateVector {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = Self::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

impl fmt::Display for ReplicaStateVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for csn in self.csns.values() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{csn}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ReplicaStateVector {
    type Err = Error;

    /// Space or comma separated CSNs; repeated replicas keep the newest CSN.
    fn from_str(s: &str) -> Result<Self> {
        s.split(|c: char| c == ' ' || c == ',')
            .filter(|token| !token.is_empty())
            .map(Csn::from_str)
            .collect()
    }
}
