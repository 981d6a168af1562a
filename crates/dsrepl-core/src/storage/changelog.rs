//! Per-domain change log store
//!
//! Records are keyed by the 14-byte big-endian CSN so LMDB key order is CSN
//! order. The domain metadata (newest and purged state vectors, generation ID)
//! is written in the same transaction as the change it reflects, and mirrored
//! in memory behind a lock that also serialises appends.

use crate::csn::Csn;
use crate::state::ReplicaStateVector;
use crate::update::UpdateRecord;
use crate::{Error, Result};
use heed::types::{Bytes, SerdeBincode, Str};
use heed::{Database, Env};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

/// Persistent metadata of one change log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Newest CSN appended per replica
    pub newest: ReplicaStateVector,
    /// Newest CSN purged per replica
    pub purged: ReplicaStateVector,
    /// Generation ID of the domain, once known
    pub generation_id: Option<u64>,
}

/// Result of a purge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Number of records removed
    pub removed: usize,
    /// Oldest retained CSN after the purge
    pub oldest: Option<Csn>,
}

/// Durable, CSN-ordered log of one replicated domain
#[derive(Clone)]
pub struct ChangeLogStore {
    base_dn: Arc<str>,
    meta_key: Arc<str>,
    env: Env,
    records: Database<Bytes, SerdeBincode<UpdateRecord>>,
    meta: Database<Str, SerdeBincode<StoreMeta>>,
    state: Arc<RwLock<StoreMeta>>,
    batch_size: usize,
}

impl ChangeLogStore {
    pub(crate) fn open(
        env: Env,
        meta: Database<Str, SerdeBincode<StoreMeta>>,
        base_dn: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let meta_key = super::normalize_dn(base_dn);
        let mut wtxn = env.write_txn()?;
        let records = env.create_database(&mut wtxn, Some(&format!("changelog:{meta_key}")))?;
        let state = match meta.get(&wtxn, &meta_key)? {
            Some(state) => state,
            None => {
                let state = StoreMeta::default();
                meta.put(&mut wtxn, &meta_key, &state)?;
                state
            }
        };
        wtxn.commit()?;

        tracing::debug!(
            base_dn,
            newest = %state.newest,
            generation_id = ?state.generation_id,
            "Opened change log store"
        );

        Ok(Self {
            base_dn: Arc::from(base_dn),
            meta_key: Arc::from(meta_key.as_str()),
            env,
            records,
            meta,
            state: Arc::new(RwLock::new(state)),
            batch_size: batch_size.max(1),
        })
    }

    /// Replicated base DN
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Append a record
    ///
    /// Fails with [`Error::OutOfOrder`] unless the CSN is newer than every CSN
    /// already appended by the same replica.
    pub fn append(&self, record: &UpdateRecord) -> Result<()> {
        let csn = record.csn;
        let mut state = self.state.write();
        if let Some(last) = state.newest.get(csn.replica_id()) {
            if csn <= last {
                return Err(Error::OutOfOrder {
                    domain: self.base_dn.to_string(),
                    csn,
                    last,
                });
            }
        }

        let key = csn.to_key();
        let mut wtxn = self.env.write_txn()?;
        if self.records.get(&wtxn, &key)?.is_some() {
            tracing::error!(domain = %self.base_dn, %csn, "CSN collision in change log");
            return Err(Error::CsnCollision {
                domain: self.base_dn.to_string(),
                csn,
            });
        }
        let mut next = state.clone();
        next.newest.update(csn);
        self.records.put(&mut wtxn, &key, record)?;
        self.meta.put(&mut wtxn, &self.meta_key, &next)?;
        wtxn.commit()?;
        *state = next;
        Ok(())
    }

    /// Lazily read every record not covered by `from`, in CSN order
    pub fn read_from(&self, from: &ReplicaStateVector) -> ChangelogCursor {
        ChangelogCursor {
            store: self.clone(),
            from: from.clone(),
            position: None,
            in_pass: false,
            until: None,
            buffer: VecDeque::new(),
            caught_up: false,
        }
    }

    /// Record with the given CSN
    pub fn get(&self, csn: &Csn) -> Result<Option<UpdateRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.records.get(&rtxn, &csn.to_key())?)
    }

    /// Oldest retained CSN
    pub fn first_csn(&self) -> Result<Option<Csn>> {
        let rtxn = self.env.read_txn()?;
        self.records
            .first(&rtxn)?
            .map(|(key, _)| Csn::from_key(key))
            .transpose()
    }

    /// Newest retained CSN
    pub fn last_csn(&self) -> Result<Option<Csn>> {
        let rtxn = self.env.read_txn()?;
        self.records
            .last(&rtxn)?
            .map(|(key, _)| Csn::from_key(key))
            .transpose()
    }

    /// Number of retained records
    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.records.len(&rtxn)?)
    }

    /// Whether no record is retained
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every record with a CSN strictly below `before`
    pub fn purge(&self, before: Csn) -> Result<PurgeOutcome> {
        let mut state = self.state.write();
        let upper = before.to_key();
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, Bound::Excluded(&upper[..]));

        let mut wtxn = self.env.write_txn()?;
        let mut next = state.clone();
        let mut removed = 0usize;
        for item in self.records.range(&wtxn, &range)? {
            let (key, _) = item?;
            next.purged.update(Csn::from_key(key)?);
            removed += 1;
        }
        if removed > 0 {
            self.records.delete_range(&mut wtxn, &range)?;
            self.meta.put(&mut wtxn, &self.meta_key, &next)?;
        }
        let oldest = self
            .records
            .first(&wtxn)?
            .map(|(key, _)| Csn::from_key(key))
            .transpose()?;
        wtxn.commit()?;
        *state = next;

        if removed > 0 {
            tracing::info!(domain = %self.base_dn, removed, %before, "Purged change log");
        }
        Ok(PurgeOutcome { removed, oldest })
    }

    /// Remove every record, marking all of them purged
    pub fn clear(&self) -> Result<usize> {
        let mut state = self.state.write();
        let mut wtxn = self.env.write_txn()?;
        let removed = self.records.len(&wtxn)? as usize;
        let mut next = state.clone();
        let newest = next.newest.clone();
        next.purged.merge(&newest);
        self.records.clear(&mut wtxn)?;
        self.meta.put(&mut wtxn, &self.meta_key, &next)?;
        wtxn.commit()?;
        *state = next;
        tracing::info!(domain = %self.base_dn, removed, "Cleared change log");
        Ok(removed)
    }

    /// Earliest retained CSN of every replica
    pub fn start_state(&self) -> Result<ReplicaStateVector> {
        let retained = {
            let state = self.state.read();
            state
                .newest
                .csns()
                .filter(|newest| {
                    state
                        .purged
                        .get(newest.replica_id())
                        .is_none_or(|purged| purged < *newest)
                })
                .count()
        };
        let mut start = ReplicaStateVector::new();
        if retained == 0 {
            return Ok(start);
        }
        let rtxn = self.env.read_txn()?;
        for item in self.records.iter(&rtxn)? {
            let (key, _) = item?;
            let csn = Csn::from_key(key)?;
            if start.get(csn.replica_id()).is_none() {
                start.update(csn);
                if start.len() == retained {
                    break;
                }
            }
        }
        Ok(start)
    }

    /// Newest CSN appended per replica
    pub fn newest_state(&self) -> ReplicaStateVector {
        self.state.read().newest.clone()
    }

    /// Newest CSN purged per replica
    pub fn purged_state(&self) -> ReplicaStateVector {
        self.state.read().purged.clone()
    }

    /// Persisted generation ID
    pub fn generation_id(&self) -> Option<u64> {
        self.state.read().generation_id
    }

    /// Persist a new generation ID
    pub fn set_generation_id(&self, generation_id: u64) -> Result<()> {
        let mut state = self.state.write();
        let mut next = state.clone();
        next.generation_id = Some(generation_id);
        let mut wtxn = self.env.write_txn()?;
        self.meta.put(&mut wtxn, &self.meta_key, &next)?;
        wtxn.commit()?;
        *state = next;
        Ok(())
    }

    /// Newest CSN of every replica at or below `upto`
    ///
    /// A replica with nothing retained at or below `upto` falls back to its
    /// purged CSN, so the state stays usable as a resumption point.
    pub fn state_at(&self, upto: Csn) -> Result<ReplicaStateVector> {
        let newest = self.newest_state();
        let mut state: ReplicaStateVector = newest.csns().filter(|csn| *csn <= upto).collect();
        if state.len() < newest.len() {
            let upper = upto.to_key();
            let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, Bound::Included(&upper[..]));
            let rtxn = self.env.read_txn()?;
            for item in self.records.rev_range(&rtxn, &range)? {
                let (key, _) = item?;
                let csn = Csn::from_key(key)?;
                if state.get(csn.replica_id()).is_none() {
                    state.update(csn);
                    if state.len() == newest.len() {
                        break;
                    }
                }
            }
        }
        for (replica, purged) in self.purged_state().iter() {
            if state.get(replica).is_none() {
                state.update(purged);
            }
        }
        Ok(state)
    }

    /// Records not covered by `from` with a CSN at or below `upto`
    pub fn count_between(&self, from: &ReplicaStateVector, upto: Csn) -> Result<u64> {
        let mut count = 0;
        for record in self.read_from(from).until(upto) {
            record?;
            count += 1;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for ChangeLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLogStore")
            .field("base_dn", &self.base_dn)
            .field("newest", &self.state.read().newest)
            .finish()
    }
}

/// Lazy reader over a change log
///
/// Fetches `batch_size` keys per read transaction. Returns `None` once caught
/// up, but is not fused: the next call looks for records appended since.
///
/// Replicas only append in their own CSN order, so a record can land behind
/// one already returned. Each pass therefore starts from the state of what
/// was returned so far, not from the last key scanned.
pub struct ChangelogCursor {
    store: ChangeLogStore,
    from: ReplicaStateVector,
    position: Option<[u8; Csn::KEY_LEN]>,
    in_pass: bool,
    until: Option<Csn>,
    buffer: VecDeque<UpdateRecord>,
    caught_up: bool,
}

enum Resume {
    /// No replica has anything beyond the cursor state
    Idle,
    /// Some replica is unknown to the cursor state
    FromStart,
    /// Every record up to this CSN is covered
    After(Csn),
}

impl ChangelogCursor {
    /// Stop after `csn` (inclusive)
    pub fn until(mut self, csn: Csn) -> Self {
        self.until = Some(csn);
        self
    }

    /// Change the inclusive upper bound of a live cursor
    pub fn set_until(&mut self, until: Option<Csn>) {
        self.until = until;
        self.caught_up = false;
    }

    /// Starting state merged with every CSN returned since
    pub fn state(&self) -> &ReplicaStateVector {
        &self.from
    }

    /// Domain of the underlying store
    pub fn base_dn(&self) -> &str {
        self.store.base_dn()
    }

    fn resume_point(&self) -> Resume {
        let mut lowest: Option<Csn> = None;
        for newest in self.store.newest_state().csns() {
            match self.from.get(newest.replica_id()) {
                None => return Resume::FromStart,
                Some(seen) if seen < newest => {
                    lowest = Some(lowest.map_or(seen, |lowest| lowest.min(seen)));
                }
                Some(_) => {}
            }
        }
        lowest.map_or(Resume::Idle, Resume::After)
    }

    fn fill(&mut self) -> Result<usize> {
        let rtxn = self.store.env.read_txn()?;
        let position = self.position;
        let lower = match &position {
            Some(key) => Bound::Excluded(&key[..]),
            None => Bound::Unbounded,
        };
        let until_key = self.until.map(|csn| csn.to_key());
        let upper = match &until_key {
            Some(key) => Bound::Included(&key[..]),
            None => Bound::Unbounded,
        };
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (lower, upper);

        let mut scanned = 0;
        for item in self.store.records.range(&rtxn, &range)?.take(self.store.batch_size) {
            let (key, record) = item?;
            let mut last = [0u8; Csn::KEY_LEN];
            last.copy_from_slice(key);
            self.position = Some(last);
            scanned += 1;
            if !self.from.covers(&record.csn) {
                self.buffer.push_back(record);
            }
        }
        Ok(scanned)
    }
}

impl Iterator for ChangelogCursor {
    type Item = Result<UpdateRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.from.update(record.csn);
                return Some(Ok(record));
            }
            if self.caught_up {
                self.caught_up = false;
                return None;
            }
            if !self.in_pass {
                match self.resume_point() {
                    Resume::Idle => {
                        self.caught_up = true;
                        continue;
                    }
                    Resume::FromStart => self.position = None,
                    Resume::After(csn) => self.position = Some(csn.to_key()),
                }
                self.in_pass = true;
            }
            match self.fill() {
                Ok(scanned) if scanned < self.store.batch_size => {
                    self.in_pass = false;
                    self.caught_up = true;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
