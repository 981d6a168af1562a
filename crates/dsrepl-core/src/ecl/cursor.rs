//! Cross-domain merge of change log cursors

use crate::Result;
use crate::cookie::MultiDomainState;
use crate::csn::Csn;
use crate::replication::domain::ReplicationDomain;
use crate::state::ReplicaStateVector;
use crate::storage::ChangelogCursor;
use crate::update::UpdateRecord;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

struct DomainStream {
    domain: Arc<ReplicationDomain>,
    cursor: ChangelogCursor,
    /// A record of this stream is in the heap
    pending: bool,
    /// Caught up until the next refresh
    drained: bool,
}

struct Head {
    csn: Csn,
    stream: usize,
    record: UpdateRecord,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.csn
            .cmp(&other.csn)
            .then_with(|| self.stream.cmp(&other.stream))
    }
}

/// Merges per-domain cursors by CSN, holding each to its domain's
/// eligibility bound
///
/// Like the underlying cursors it is restartable: once caught up it yields
/// nothing until [`MergeCursor::refresh`] is called.
pub(crate) struct MergeCursor {
    streams: Vec<DomainStream>,
    heap: BinaryHeap<Reverse<Head>>,
}

impl MergeCursor {
    /// Position every domain just after its state in `start`
    pub(crate) fn new(domains: Vec<Arc<ReplicationDomain>>, start: &MultiDomainState) -> Self {
        let empty = ReplicaStateVector::new();
        let streams = domains
            .into_iter()
            .map(|domain| {
                let from = start.get(domain.base_dn()).unwrap_or(&empty);
                DomainStream {
                    cursor: domain.store().read_from(from),
                    domain,
                    pending: false,
                    drained: false,
                }
            })
            .collect();
        let mut merge = Self {
            streams,
            heap: BinaryHeap::new(),
        };
        merge.refresh();
        merge
    }

    /// Re-read eligibility bounds and look for new records on the next call
    pub(crate) fn refresh(&mut self) {
        for stream in &mut self.streams {
            stream.cursor.set_until(stream.domain.eligibility().bound());
            stream.drained = false;
        }
    }

    /// Next eligible record across all domains, in CSN order
    pub(crate) fn next_record(&mut self) -> Result<Option<(Arc<ReplicationDomain>, UpdateRecord)>> {
        for (index, stream) in self.streams.iter_mut().enumerate() {
            if stream.pending || stream.drained {
                continue;
            }
            match stream.cursor.next() {
                Some(Ok(record)) => {
                    stream.pending = true;
                    self.heap.push(Reverse(Head {
                        csn: record.csn,
                        stream: index,
                        record,
                    }));
                }
                Some(Err(e)) => return Err(e),
                None => stream.drained = true,
            }
        }

        let Some(Reverse(head)) = self.heap.pop() else {
            return Ok(None);
        };
        let stream = &mut self.streams[head.stream];
        stream.pending = false;
        Ok(Some((stream.domain.clone(), head.record)))
    }
}
