//! External changelog sessions: cookie mode, draft mode and persistent search

use super::cursor::MergeCursor;
use super::entry::EclEntry;
use super::filter::Filter;
use crate::cookie::MultiDomainState;
use crate::replication::domain::{Eligibility, ReplicationDomain};
use crate::replication::server::ReplicationServer;
use crate::storage::{DraftLookup, DraftRecord};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Default buffer of a persistent search
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

/// Where a persistent search starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EclStart {
    /// Just after a cookie (empty for the start of retained history)
    Cookie(MultiDomainState),
    /// At a draft change number
    ChangeNumber(u64),
}

/// Persistent search request
#[derive(Debug, Clone)]
pub struct PersistentSearch {
    /// Start position, also selecting the addressing mode
    pub start: EclStart,
    /// Replay history from `start` before the live tail; otherwise only
    /// changes becoming visible after the subscription are sent
    pub replay: bool,
    /// Entries the subscriber wants
    pub predicate: Filter,
    /// Entries buffered ahead of the subscriber
    pub buffer: usize,
}

impl PersistentSearch {
    /// Cookie-mode subscription replaying from `cookie`
    pub fn cookie(cookie: MultiDomainState) -> Self {
        Self {
            start: EclStart::Cookie(cookie),
            replay: true,
            predicate: Filter::any(),
            buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }

    /// Draft-mode subscription replaying from `number`
    pub fn change_number(number: u64) -> Self {
        Self {
            start: EclStart::ChangeNumber(number),
            ..Self::cookie(MultiDomainState::new())
        }
    }

    /// Set replay
    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }

    /// Set the predicate
    pub fn with_predicate(mut self, predicate: Filter) -> Self {
        self.predicate = predicate;
        self
    }

    /// Set the buffer size
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

/// Read access to the changes of every public domain
#[derive(Debug, Clone)]
pub struct ExternalChangelog {
    server: Arc<ReplicationServer>,
}

impl ExternalChangelog {
    pub(crate) fn new(server: Arc<ReplicationServer>) -> Self {
        Self { server }
    }

    /// Entries after `cookie` matching `filter`, each carrying the cookie
    /// just after it
    pub fn search_cookie(
        &self,
        cookie: &MultiDomainState,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<EclEntry>> {
        let mut position = self.resolve_cookie(cookie)?;
        let mut merge = MergeCursor::new(self.server.public_domains(), &position);
        let mut entries = Vec::new();
        while limit.is_none_or(|limit| entries.len() < limit) {
            let Some((domain, record)) = merge.next_record()? else {
                break;
            };
            position.update(domain.base_dn(), record.csn);
            let entry = cookie_entry(&domain, record, &position);
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }
        tracing::debug!(cookie = %cookie, returned = entries.len(), "Cookie-mode changelog search");
        Ok(entries)
    }

    /// Entries addressed by draft change number
    ///
    /// The change number terms of `filter` bound the scan; an equality on a
    /// purged number fails with [`Error::ChangeNumberPurged`], numbers never
    /// issued yield nothing.
    pub fn search_draft(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<EclEntry>> {
        self.catch_up()?;
        let draft = self.server.draft_index();
        let bounds = filter.change_number_bounds();
        if bounds.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(number) = bounds.as_exact() {
            return match draft.resolve(number)? {
                DraftLookup::Found(record) => Ok(self
                    .draft_entry(number, record)?
                    .filter(|entry| filter.matches(entry) && limit != Some(0))
                    .into_iter()
                    .collect()),
                DraftLookup::Purged => Err(Error::ChangeNumberPurged {
                    number,
                    first: draft.first()?,
                }),
                DraftLookup::NotYetIssued => Ok(Vec::new()),
            };
        }

        let (Some(first), Some(last)) = (draft.first()?, draft.last()?) else {
            return Ok(Vec::new());
        };
        let mut low = bounds.low.map_or(first, |low| low.max(first));
        let high = bounds.high.map_or(last, |high| high.min(last));
        let page = self.server.config().ecl_batch_size.max(1);
        let mut entries = Vec::new();

        'scan: while low <= high {
            let batch = draft.range(low, high, page)?;
            let Some(last_seen) = batch.last().map(|(number, _)| *number) else {
                break;
            };
            for (number, record) in batch {
                if limit.is_some_and(|limit| entries.len() >= limit) {
                    break 'scan;
                }
                match self.draft_entry(number, record)? {
                    Some(entry) if filter.matches(&entry) => entries.push(entry),
                    _ => {}
                }
            }
            match last_seen.checked_add(1) {
                Some(next) => low = next,
                None => break,
            }
        }
        tracing::debug!(%filter, returned = entries.len(), "Draft-mode changelog search");
        Ok(entries)
    }

    /// First available draft change number, 0 when none is available
    pub fn first_change_number(&self) -> Result<u64> {
        self.catch_up()?;
        Ok(self.server.draft_index().first()?.unwrap_or(0))
    }

    /// Last available draft change number, 0 when none is available
    pub fn last_change_number(&self) -> Result<u64> {
        self.catch_up()?;
        Ok(self.server.draft_index().last()?.unwrap_or(0))
    }

    /// Cookie just after the last visible change of every public domain
    pub fn last_cookie(&self) -> Result<MultiDomainState> {
        let mut cookie = MultiDomainState::new();
        for domain in self.server.public_domains() {
            let state = match domain.eligibility() {
                Eligibility::All => domain.newest_state(),
                Eligibility::UpTo(bound) => domain.store().state_at(bound)?,
            };
            if !state.is_empty() {
                cookie.set(domain.base_dn(), state);
            }
        }
        Ok(cookie)
    }

    /// Number every newly visible change, in merged CSN order
    ///
    /// Resumes from the cookie persisted with the last assignment, so numbers
    /// survive restarts and are never reassigned.
    pub fn catch_up(&self) -> Result<usize> {
        let _draft = self.server.lock_draft();
        let draft = self.server.draft_index();
        let mut position = draft.indexed_cookie();
        let mut merge = MergeCursor::new(self.server.public_domains(), &position);
        let mut assigned = 0;
        while let Some((domain, record)) = merge.next_record()? {
            position.update(domain.base_dn(), record.csn);
            draft.assign(domain.base_dn(), record.csn, &position)?;
            assigned += 1;
        }
        if assigned > 0 {
            tracing::debug!(
                assigned,
                last = draft.last_assigned(),
                "Draft change numbers assigned"
            );
        }
        Ok(assigned)
    }

    /// Start a persistent search
    ///
    /// Fails with [`Error::TooManySubscribers`] when every slot is taken.
    /// Must be called inside a Tokio runtime.
    pub fn persistent_search(&self, search: PersistentSearch) -> Result<EclSubscription> {
        let position = match &search.start {
            EclStart::Cookie(cookie) if search.replay => Position::Cookie(self.resolve_cookie(cookie)?),
            EclStart::Cookie(_) => Position::Cookie(self.last_cookie()?),
            EclStart::ChangeNumber(number) => {
                self.catch_up()?;
                let draft = self.server.draft_index();
                if !search.replay {
                    Position::ChangeNumber(draft.last_assigned() + 1)
                } else if let DraftLookup::Purged = draft.resolve(*number)? {
                    return Err(Error::ChangeNumberPurged {
                        number: *number,
                        first: draft.first()?,
                    });
                } else {
                    Position::ChangeNumber((*number).max(1))
                }
            }
        };

        let max = self.server.config().max_ecl_subscribers;
        let permit = self
            .server
            .ecl_slots()
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::TooManySubscribers { max })?;

        let (tx, rx) = mpsc::channel(search.buffer.max(1));
        let cancel = self.server.cancellation_token().child_token();
        let tail = Tail {
            ecl: self.clone(),
            predicate: search.predicate,
            tx,
            cancel: cancel.clone(),
        };
        tracing::debug!(start = ?search.start, replay = search.replay, "ECL persistent search started");
        let task = match position {
            Position::Cookie(cookie) => tokio::spawn(tail.cookie_mode(cookie)),
            Position::ChangeNumber(number) => tokio::spawn(tail.draft_mode(number)),
        };

        Ok(EclSubscription {
            entries: rx,
            guard: Some(cancel.clone().drop_guard()),
            cancel,
            permit: Some(permit),
            task,
        })
    }

    /// Map a client cookie onto the public domains, rejecting unusable ones
    fn resolve_cookie(&self, cookie: &MultiDomainState) -> Result<MultiDomainState> {
        let mut resolved = MultiDomainState::new();
        for (dn, state) in cookie.domains() {
            let domain = self
                .server
                .domain(dn)
                .ok_or_else(|| Error::malformed_cookie(dn, "domain is not replicated"))?;
            if domain.is_private() {
                return Err(Error::malformed_cookie(dn, "domain is not in the changelog"));
            }
            if !domain.store().purged_state().is_covered_by(state) {
                tracing::debug!(domain = %domain.base_dn(), %state, "Cookie older than retained history");
                return Err(Error::StateNoLongerAvailable {
                    domain: domain.base_dn().to_string(),
                });
            }
            resolved.set(domain.base_dn(), state.clone());
        }
        if resolved.is_empty() {
            return Ok(resolved);
        }
        // A domain left out is read from its start, which is only complete
        // while nothing of it was purged.
        for domain in self.server.public_domains() {
            if resolved.get(domain.base_dn()).is_none() && !domain.store().purged_state().is_empty() {
                tracing::debug!(domain = %domain.base_dn(), "Cookie omits a purged domain");
                return Err(Error::StateNoLongerAvailable {
                    domain: domain.base_dn().to_string(),
                });
            }
        }
        Ok(resolved)
    }

    fn draft_entry(&self, number: u64, record: DraftRecord) -> Result<Option<EclEntry>> {
        let Some(domain) = self.server.domain(&record.domain) else {
            return Ok(None);
        };
        if domain.is_private() {
            return Ok(None);
        }
        // Purged between the index read and this one.
        let Some(update) = domain.store().get(&record.csn)? else {
            return Ok(None);
        };
        Ok(Some(
            EclEntry::new(
                domain.base_dn(),
                update,
                record.cookie,
                &domain.config().ecl_include_attributes,
            )
            .with_change_number(number),
        ))
    }
}

fn cookie_entry(
    domain: &ReplicationDomain,
    record: crate::update::UpdateRecord,
    position: &MultiDomainState,
) -> EclEntry {
    EclEntry::new(
        domain.base_dn(),
        record,
        position.clone(),
        &domain.config().ecl_include_attributes,
    )
}

enum Position {
    Cookie(MultiDomainState),
    ChangeNumber(u64),
}

/// Live tail of one subscriber
struct Tail {
    ecl: ExternalChangelog,
    predicate: Filter,
    tx: mpsc::Sender<Result<EclEntry>>,
    cancel: CancellationToken,
}

impl Tail {
    async fn cookie_mode(self, mut position: MultiDomainState) {
        let mut changes = self.ecl.server.changes();
        let mut merge = MergeCursor::new(self.ecl.server.public_domains(), &position);
        loop {
            changes.borrow_and_update();
            merge.refresh();
            loop {
                let entry = match merge.next_record() {
                    Ok(Some((domain, record))) => {
                        position.update(domain.base_dn(), record.csn);
                        cookie_entry(&domain, record, &position)
                    }
                    Ok(None) => break,
                    Err(e) => return self.fail(e).await,
                };
                if self.predicate.matches(&entry) && !self.deliver(entry).await {
                    return;
                }
            }
            if !self.wait(&mut changes).await {
                return;
            }
        }
    }

    async fn draft_mode(self, mut next: u64) {
        let mut changes = self.ecl.server.changes();
        let page = self.ecl.server.config().ecl_batch_size.max(1);
        loop {
            changes.borrow_and_update();
            if let Err(e) = self.ecl.catch_up() {
                return self.fail(e).await;
            }
            loop {
                let batch = match self.ecl.server.draft_index().range(next, u64::MAX, page) {
                    Ok(batch) if batch.is_empty() => break,
                    Ok(batch) => batch,
                    Err(e) => return self.fail(e).await,
                };
                for (number, record) in batch {
                    next = number.saturating_add(1);
                    match self.ecl.draft_entry(number, record) {
                        Ok(Some(entry)) if self.predicate.matches(&entry) => {
                            if !self.deliver(entry).await {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => return self.fail(e).await,
                    }
                }
            }
            if !self.wait(&mut changes).await {
                return;
            }
        }
    }

    async fn deliver(&self, entry: EclEntry) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(entry)) => sent.is_ok(),
        }
    }

    async fn wait(&self, changes: &mut watch::Receiver<u64>) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            changed = changes.changed() => changed.is_ok(),
        }
    }

    async fn fail(&self, error: Error) {
        tracing::error!(error = %error, "ECL persistent search failed");
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(Err(error)) => {}
        }
    }
}

/// A running persistent search
///
/// Dropping the subscription cancels it and frees its slot.
#[derive(Debug)]
pub struct EclSubscription {
    entries: mpsc::Receiver<Result<EclEntry>>,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
    permit: Option<OwnedSemaphorePermit>,
    task: JoinHandle<()>,
}

impl EclSubscription {
    /// Next entry, `None` once the search has ended
    pub async fn next(&mut self) -> Option<Result<EclEntry>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            entry = self.entries.recv() => entry,
        }
    }

    /// Next entry, or [`Error::Timeout`] when none arrives within `timeout`
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Option<EclEntry>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Err(_) => Err(Error::Timeout),
            Ok(None) => Ok(None),
            Ok(Some(entry)) => entry.map(Some),
        }
    }

    /// Stop the live tail and release the subscriber slot
    pub fn cancel(&mut self) {
        self.guard.take();
        self.cancel.cancel();
        self.permit.take();
    }

    /// Whether the search was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the background task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
