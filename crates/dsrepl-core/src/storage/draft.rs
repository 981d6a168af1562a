//! Draft change number index
//!
//! Assigns compact sequential numbers to changelog records the first time the
//! draft addressing mode sees them. Numbers are global across domains, never
//! reused, and purged in lockstep with the records they point to.

use crate::cookie::MultiDomainState;
use crate::csn::Csn;
use crate::Result;
use heed::byteorder::BigEndian;
use heed::types::{Bytes, SerdeBincode, Str, U64};
use heed::{Database, Env};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::sync::Arc;

const META_KEY: &str = "main";

/// What a change number points to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRecord {
    /// Replicated base DN of the record
    pub domain: String,
    /// CSN of the record
    pub csn: Csn,
    /// Cookie positioned just after the record
    pub cookie: MultiDomainState,
}

/// Result of resolving a change number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftLookup {
    /// Number is indexed
    Found(DraftRecord),
    /// Number was issued and its record has been purged
    Purged,
    /// Number has not been issued yet
    NotYetIssued,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DraftMeta {
    last_assigned: u64,
    indexed_cookie: MultiDomainState,
}

/// Durable cross-domain change number index
#[derive(Clone)]
pub struct DraftNumberIndex {
    env: Env,
    by_number: Database<U64<BigEndian>, SerdeBincode<DraftRecord>>,
    by_change: Database<Bytes, U64<BigEndian>>,
    meta: Database<Str, SerdeBincode<DraftMeta>>,
    state: Arc<Mutex<DraftMeta>>,
}

fn domain_prefix(domain: &str) -> Vec<u8> {
    let mut prefix = super::normalize_dn(domain).into_bytes();
    prefix.push(0);
    prefix
}

fn change_key(domain: &str, csn: &Csn) -> Vec<u8> {
    let mut key = domain_prefix(domain);
    key.extend_from_slice(&csn.to_key());
    key
}

impl DraftNumberIndex {
    pub(crate) fn open(env: Env) -> Result<Self> {
        let mut wtxn = env.write_txn()?;
        let by_number = env.create_database(&mut wtxn, Some("draft_by_number"))?;
        let by_change = env.create_database(&mut wtxn, Some("draft_by_change"))?;
        let meta: Database<Str, SerdeBincode<DraftMeta>> =
            env.create_database(&mut wtxn, Some("draft_meta"))?;
        let state = meta.get(&wtxn, META_KEY)?.unwrap_or_default();
        wtxn.commit()?;

        tracing::debug!(last_assigned = state.last_assigned, "Opened draft number index");
        Ok(Self {
            env,
            by_number,
            by_change,
            meta,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Number of a record, assigning the next one on first sight
    ///
    /// `cookie` is the cookie just after the record; it becomes the point from
    /// which indexing resumes.
    pub fn assign(&self, domain: &str, csn: Csn, cookie: &MultiDomainState) -> Result<u64> {
        let mut state = self.state.lock();
        let key = change_key(domain, &csn);
        let mut wtxn = self.env.write_txn()?;
        if let Some(number) = self.by_change.get(&wtxn, &key)? {
            return Ok(number);
        }

        let number = state.last_assigned + 1;
        let record = DraftRecord {
            domain: domain.to_string(),
            csn,
            cookie: cookie.clone(),
        };
        let next = DraftMeta {
            last_assigned: number,
            indexed_cookie: cookie.clone(),
        };
        self.by_number.put(&mut wtxn, &number, &record)?;
        self.by_change.put(&mut wtxn, &key, &number)?;
        self.meta.put(&mut wtxn, META_KEY, &next)?;
        wtxn.commit()?;
        *state = next;

        tracing::debug!(number, domain, %csn, "Assigned draft change number");
        Ok(number)
    }

    /// Resolve a number, telling purged numbers from unissued ones
    pub fn resolve(&self, number: u64) -> Result<DraftLookup> {
        if number == 0 || number > self.last_assigned() {
            return Ok(DraftLookup::NotYetIssued);
        }
        let rtxn = self.env.read_txn()?;
        Ok(match self.by_number.get(&rtxn, &number)? {
            Some(record) => DraftLookup::Found(record),
            None => DraftLookup::Purged,
        })
    }

    /// Number of a record, if assigned and not purged
    pub fn lookup(&self, domain: &str, csn: &Csn) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.by_change.get(&rtxn, &change_key(domain, csn))?)
    }

    /// First available number
    pub fn first(&self) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.by_number.first(&rtxn)?.map(|(number, _)| number))
    }

    /// Last available number
    pub fn last(&self) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.by_number.last(&rtxn)?.map(|(number, _)| number))
    }

    /// Last number ever issued, purged or not
    pub fn last_assigned(&self) -> u64 {
        self.state.lock().last_assigned
    }

    /// Cookie after the last indexed record
    pub fn indexed_cookie(&self) -> MultiDomainState {
        self.state.lock().indexed_cookie.clone()
    }

    /// Entries with `first <= number <= last`, at most `limit`
    pub fn range(&self, first: u64, last: u64, limit: usize) -> Result<Vec<(u64, DraftRecord)>> {
        if first > last {
            return Ok(Vec::new());
        }
        let rtxn = self.env.read_txn()?;
        let mut entries = Vec::new();
        for item in self.by_number.range(&rtxn, &(first..=last))?.take(limit) {
            entries.push(item?);
        }
        Ok(entries)
    }

    /// Remove the entries of `domain` whose record CSN is below `csn`
    pub fn purge_before(&self, domain: &str, csn: Csn) -> Result<usize> {
        let upper = change_key(domain, &csn);
        self.remove_range(domain, Bound::Excluded(&upper[..]))
    }

    /// Remove every entry of `domain`
    pub fn clear_domain(&self, domain: &str) -> Result<usize> {
        let mut upper = super::normalize_dn(domain).into_bytes();
        upper.push(1);
        self.remove_range(domain, Bound::Excluded(&upper[..]))
    }

    fn remove_range(&self, domain: &str, upper: Bound<&[u8]>) -> Result<usize> {
        let _guard = self.state.lock();
        let prefix = domain_prefix(domain);
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Included(&prefix[..]), upper);

        let mut wtxn = self.env.write_txn()?;
        let mut numbers = Vec::new();
        for item in self.by_change.range(&wtxn, &range)? {
            let (_, number) = item?;
            numbers.push(number);
        }
        if numbers.is_empty() {
            return Ok(0);
        }
        for number in &numbers {
            self.by_number.delete(&mut wtxn, number)?;
        }
        self.by_change.delete_range(&mut wtxn, &range)?;
        wtxn.commit()?;

        tracing::info!(domain, removed = numbers.len(), "Purged draft change numbers");
        Ok(numbers.len())
    }

    /// Number of entries of one domain
    pub fn len_for_domain(&self, domain: &str) -> Result<usize> {
        let prefix = domain_prefix(domain);
        let mut upper = super::normalize_dn(domain).into_bytes();
        upper.push(1);
        let range: (Bound<&[u8]>, Bound<&[u8]>) =
            (Bound::Included(&prefix[..]), Bound::Excluded(&upper[..]));
        let rtxn = self.env.read_txn()?;
        let mut count = 0;
        for item in self.by_change.range(&rtxn, &range)? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether no entry is indexed
    pub fn is_empty(&self) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.by_number.is_empty(&rtxn)?)
    }
}

impl std::fmt::Debug for DraftNumberIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftNumberIndex")
            .field("last_assigned", &self.last_assigned())
            .finish()
    }
}
