//! Replication domain coordinator
//!
//! One coordinator per replicated base DN. It owns the change log store of
//! the domain and tracks every connected link. State transitions (link
//! status, generation ID, heartbeat vector) happen under one lock; the
//! change log has its own lock and is never touched while waiting on a
//! channel.

use crate::csn::{Csn, ReplicaId};
use crate::replication::config::{DomainConfig, EligibilityPolicy};
use crate::replication::link::{Handshake, Welcome};
use crate::replication::protocol::{
    ErrorCode, LinkKind, LinkStatus, ReplicationMessage, RoutingTarget,
};
use crate::state::ReplicaStateVector;
use crate::storage::{ChangeLogStore, DraftNumberIndex, PurgeOutcome};
use crate::update::UpdateRecord;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifier of a link inside its domain
pub type LinkId = u64;

/// Up to which CSN changes are visible to external readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Every stored change
    All,
    /// Changes at or below the CSN
    UpTo(Csn),
}

impl Eligibility {
    /// Whether a change is visible
    pub fn admits(&self, csn: &Csn) -> bool {
        match self {
            Self::All => true,
            Self::UpTo(bound) => csn <= bound,
        }
    }

    /// Inclusive bound, if any
    pub fn bound(&self) -> Option<Csn> {
        match self {
            Self::All => None,
            Self::UpTo(bound) => Some(*bound),
        }
    }
}

/// Monitoring view of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Link identifier
    pub link_id: LinkId,
    /// Replica on the other end
    pub replica_id: ReplicaId,
    /// Kind of link
    pub kind: LinkKind,
    /// Current status
    pub status: LinkStatus,
    /// Generation ID presented or acquired through reinitialization
    pub generation_id: Option<u64>,
    /// Newest CSN published or heartbeat by the replica
    pub acknowledged: Option<Csn>,
}

/// What the server needs to start the link tasks
#[derive(Debug)]
pub(crate) struct Registration {
    pub link_id: LinkId,
    pub welcome: Welcome,
    pub status: watch::Receiver<LinkStatus>,
    pub cancel: CancellationToken,
}

struct LinkState {
    replica_id: ReplicaId,
    kind: LinkKind,
    generation_id: Option<u64>,
    status: LinkStatus,
    acknowledged: Option<Csn>,
    outbound: mpsc::Sender<ReplicationMessage>,
    status_tx: watch::Sender<LinkStatus>,
    last_seen: Instant,
    resume_from: Option<ReplicaStateVector>,
    importing: Option<u64>,
    cancel: CancellationToken,
}

impl LinkState {
    fn set_status(&mut self, status: LinkStatus) {
        self.status = status;
        self.status_tx.send_replace(status);
    }

    fn acknowledge(&mut self, csn: Csn) {
        if self.acknowledged.is_none_or(|seen| csn > seen) {
            self.acknowledged = Some(csn);
        }
        self.last_seen = Instant::now();
    }

    fn notify(&self, msg: ReplicationMessage) {
        if let Err(e) = self.outbound.try_send(msg) {
            tracing::warn!(
                replica_id = self.replica_id,
                error = %e,
                "Dropped notification for replica link"
            );
        }
    }
}

#[derive(Default)]
struct DomainInner {
    links: HashMap<LinkId, LinkState>,
    heartbeats: ReplicaStateVector,
}

/// Coordinator of one replicated domain
pub struct ReplicationDomain {
    config: DomainConfig,
    server_id: ReplicaId,
    eligibility: EligibilityPolicy,
    purge_delay: Duration,
    store: ChangeLogStore,
    draft: DraftNumberIndex,
    inner: RwLock<DomainInner>,
    next_link_id: AtomicU64,
    changes: Arc<watch::Sender<u64>>,
}

impl ReplicationDomain {
    pub(crate) fn new(
        config: DomainConfig,
        server_id: ReplicaId,
        eligibility: EligibilityPolicy,
        purge_delay: Duration,
        store: ChangeLogStore,
        draft: DraftNumberIndex,
        changes: Arc<watch::Sender<u64>>,
    ) -> Self {
        Self {
            config,
            server_id,
            eligibility,
            purge_delay,
            store,
            draft,
            inner: RwLock::new(DomainInner::default()),
            next_link_id: AtomicU64::new(1),
            changes,
        }
    }

    /// Replicated base DN
    pub fn base_dn(&self) -> &str {
        &self.config.base_dn
    }

    /// Domain settings
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Whether the domain is excluded from the external changelog
    pub fn is_private(&self) -> bool {
        self.config.private
    }

    /// Change log of the domain
    pub fn store(&self) -> &ChangeLogStore {
        &self.store
    }

    /// Current generation ID
    pub fn generation_id(&self) -> Option<u64> {
        self.store.generation_id()
    }

    /// Newest CSN stored per replica
    pub fn newest_state(&self) -> ReplicaStateVector {
        self.store.newest_state()
    }

    /// Heartbeat CSNs received per replica
    pub fn heartbeat_state(&self) -> ReplicaStateVector {
        self.inner.read().heartbeats.clone()
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn register(
        &self,
        handshake: &Handshake,
        window: u32,
        outbound: mpsc::Sender<ReplicationMessage>,
        cancel: CancellationToken,
    ) -> Result<Registration> {
        let mut inner = self.inner.write();
        let duplicate = inner.links.values().any(|link| {
            link.replica_id == handshake.replica_id
                && link.kind == handshake.kind
                && link.status != LinkStatus::Disconnected
        });
        if duplicate {
            return Err(Error::DuplicateReplica {
                domain: self.base_dn().to_string(),
                replica_id: handshake.replica_id,
            });
        }

        let mut domain_generation = self.store.generation_id();
        let status = match handshake.kind {
            LinkKind::ChangelogReader => LinkStatus::Active,
            LinkKind::DirectoryServer => match (domain_generation, handshake.generation_id) {
                (None, Some(adopted)) => {
                    self.store.set_generation_id(adopted)?;
                    domain_generation = Some(adopted);
                    tracing::info!(
                        domain = %self.base_dn(),
                        replica_id = handshake.replica_id,
                        generation_id = adopted,
                        "Adopted generation ID of first connected replica"
                    );
                    LinkStatus::Active
                }
                (Some(expected), Some(actual)) if expected == actual => LinkStatus::Active,
                _ => LinkStatus::Degraded,
            },
        };

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(status);
        let acknowledged = match handshake.kind {
            LinkKind::DirectoryServer => {
                let mut own = handshake.state.get(handshake.replica_id);
                if let Some(stored) = self.store.newest_state().get(handshake.replica_id) {
                    own = Some(own.map_or(stored, |own| own.max(stored)));
                }
                own
            }
            LinkKind::ChangelogReader => None,
        };

        let link = LinkState {
            replica_id: handshake.replica_id,
            kind: handshake.kind,
            generation_id: handshake.generation_id,
            status,
            acknowledged,
            outbound,
            status_tx,
            last_seen: Instant::now(),
            resume_from: None,
            importing: None,
            cancel: cancel.clone(),
        };

        if status == LinkStatus::Degraded {
            tracing::warn!(
                domain = %self.base_dn(),
                replica_id = handshake.replica_id,
                expected = ?domain_generation,
                actual = ?handshake.generation_id,
                "Replica connected with mismatching generation ID, link degraded"
            );
            link.notify(ReplicationMessage::error(
                ErrorCode::GenerationMismatch,
                format!(
                    "generation ID {:?} does not match domain generation ID {:?}",
                    handshake.generation_id, domain_generation
                ),
            ));
        } else {
            tracing::info!(
                domain = %self.base_dn(),
                replica_id = handshake.replica_id,
                kind = ?handshake.kind,
                link_id,
                "Replica link connected"
            );
        }

        inner.links.insert(link_id, link);
        drop(inner);
        self.bump();

        Ok(Registration {
            link_id,
            welcome: Welcome {
                server_id: self.server_id,
                generation_id: domain_generation,
                state: self.store.newest_state(),
                window,
                status,
            },
            status: status_rx,
            cancel,
        })
    }

    /// Store an update received on a link
    pub fn receive_update(&self, link_id: LinkId, record: UpdateRecord) -> Result<()> {
        let (status, replica_id) = {
            let inner = self.inner.read();
            match inner.links.get(&link_id) {
                Some(link) => (link.status, link.replica_id),
                None => return Err(Error::LinkDisconnected),
            }
        };

        match status {
            LinkStatus::Disconnected => return Err(Error::LinkDisconnected),
            LinkStatus::Degraded => {
                let inner = self.inner.read();
                let generation = self.store.generation_id();
                let actual = inner.links.get(&link_id).and_then(|l| l.generation_id);
                if let Some(link) = inner.links.get(&link_id) {
                    link.notify(ReplicationMessage::error(
                        ErrorCode::GenerationMismatch,
                        format!("update {} refused: link is degraded", record.csn),
                    ));
                }
                tracing::debug!(
                    domain = %self.base_dn(),
                    replica_id,
                    csn = %record.csn,
                    "Dropped update from degraded link"
                );
                return Err(Error::GenerationMismatch {
                    domain: self.base_dn().to_string(),
                    expected: generation,
                    actual,
                });
            }
            LinkStatus::Active => {}
        }

        let csn = record.csn;
        if let Err(e) = self.store.append(&record) {
            let code = match &e {
                Error::OutOfOrder { .. } => ErrorCode::OutOfOrder,
                Error::CsnCollision { .. } => ErrorCode::CsnCollision,
                _ => ErrorCode::Internal,
            };
            tracing::warn!(domain = %self.base_dn(), replica_id, %csn, error = %e, "Update rejected");
            if let Some(link) = self.inner.read().links.get(&link_id) {
                link.notify(ReplicationMessage::error(code, e.to_string()));
            }
            return Err(e);
        }

        if let Some(link) = self.inner.write().links.get_mut(&link_id) {
            link.acknowledge(csn);
        }
        tracing::debug!(domain = %self.base_dn(), replica_id, %csn, "Stored update");
        self.bump();
        Ok(())
    }

    /// Record a heartbeat received on a link
    pub fn receive_heartbeat(&self, link_id: LinkId, csn: Csn) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.heartbeats.update(csn);
            match inner.links.get_mut(&link_id) {
                Some(link) => link.acknowledge(csn),
                None => return Err(Error::LinkDisconnected),
            }
        }
        self.bump();
        Ok(())
    }

    /// Remove a link and stop its tasks
    pub fn disconnect(&self, link_id: LinkId) {
        let removed = self.inner.write().links.remove(&link_id);
        if let Some(mut link) = removed {
            link.set_status(LinkStatus::Disconnected);
            link.cancel.cancel();
            tracing::info!(
                domain = %self.base_dn(),
                replica_id = link.replica_id,
                link_id,
                "Replica link disconnected"
            );
            self.bump();
        }
    }

    /// Disconnect every link
    pub fn disconnect_all(&self) {
        let ids: Vec<LinkId> = self.inner.read().links.keys().copied().collect();
        for link_id in ids {
            self.disconnect(link_id);
        }
    }

    /// Replicas whose links currently receive updates
    pub fn recipients(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self
            .inner
            .read()
            .links
            .values()
            .filter(|link| link.status == LinkStatus::Active)
            .map(|link| link.replica_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether a link currently receives updates
    pub fn is_recipient(&self, link_id: LinkId) -> bool {
        self.inner
            .read()
            .links
            .get(&link_id)
            .is_some_and(|link| link.status == LinkStatus::Active)
    }

    /// Status of a link, `Disconnected` once it is gone
    pub fn link_status(&self, link_id: LinkId) -> LinkStatus {
        self.inner
            .read()
            .links
            .get(&link_id)
            .map_or(LinkStatus::Disconnected, |link| link.status)
    }

    /// Monitoring view of every link
    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self
            .inner
            .read()
            .links
            .iter()
            .map(|(link_id, link)| LinkInfo {
                link_id: *link_id,
                replica_id: link.replica_id,
                kind: link.kind,
                status: link.status,
                generation_id: link.generation_id,
                acknowledged: link.acknowledged,
            })
            .collect();
        links.sort_by_key(|link| link.link_id);
        links
    }

    pub(crate) fn take_resume_state(&self, link_id: LinkId) -> Option<ReplicaStateVector> {
        self.inner
            .write()
            .links
            .get_mut(&link_id)
            .and_then(|link| link.resume_from.take())
    }

    /// Route a full-content initialization message from a link
    ///
    /// Allowed on degraded links: this is how they get repaired.
    pub async fn route_total_update(&self, from: LinkId, msg: ReplicationMessage) -> Result<()> {
        let sender = {
            let inner = self.inner.read();
            match inner.links.get(&from) {
                Some(link) => link.replica_id,
                None => return Err(Error::LinkDisconnected),
            }
        };

        if let ReplicationMessage::InitializeTarget {
            source,
            generation_id,
            reset_generation: true,
            ..
        } = &msg
        {
            self.reset_generation_id(*generation_id, Some(*source))?;
        }

        let mut restored = Vec::new();
        let targets: Vec<mpsc::Sender<ReplicationMessage>> = {
            let mut inner = self.inner.write();
            let domain_generation = self.store.generation_id();
            let newest = self.store.newest_state();
            let mut targets = Vec::new();
            for (link_id, link) in inner.links.iter_mut() {
                if *link_id == from || link.kind != LinkKind::DirectoryServer {
                    continue;
                }
                let addressed = match &msg {
                    ReplicationMessage::InitializeRequest { target, .. } => {
                        link.replica_id == *target
                    }
                    ReplicationMessage::InitializeTarget { target, .. }
                    | ReplicationMessage::Entry { target, .. }
                    | ReplicationMessage::Done { target, .. } => {
                        target.includes(link.replica_id, sender)
                    }
                    other => {
                        return Err(Error::protocol(format!(
                            "{:?} cannot be routed",
                            other.message_type()
                        )));
                    }
                };
                if !addressed {
                    continue;
                }
                match &msg {
                    ReplicationMessage::InitializeTarget { generation_id, .. } => {
                        link.importing = Some(*generation_id);
                    }
                    ReplicationMessage::Done { .. } => {
                        let imported = link.importing.take();
                        if link.status == LinkStatus::Degraded
                            && imported.is_some()
                            && imported == domain_generation
                        {
                            link.generation_id = imported;
                            link.set_status(LinkStatus::Active);
                            link.resume_from = Some(newest.clone());
                            restored.push((link.replica_id, link.outbound.clone()));
                        }
                    }
                    _ => {}
                }
                targets.push(link.outbound.clone());
            }
            targets
        };

        if targets.is_empty() {
            tracing::warn!(
                domain = %self.base_dn(),
                from = sender,
                msg = ?msg.message_type(),
                "Total update message has no recipient"
            );
        }
        for target in targets {
            if target.send(msg.clone()).await.is_err() {
                tracing::debug!(domain = %self.base_dn(), "Total update target went away");
            }
        }
        for (replica_id, outbound) in restored {
            tracing::info!(
                domain = %self.base_dn(),
                replica_id,
                "Replica reinitialized, link active again"
            );
            let _ = outbound
                .send(ReplicationMessage::Status {
                    status: LinkStatus::Active,
                })
                .await;
        }
        if matches!(msg, ReplicationMessage::Done { .. }) {
            self.bump();
        }
        Ok(())
    }

    /// Install a new generation ID for the whole domain
    ///
    /// Clears the change log with its draft change numbers and degrades every
    /// other directory server whose generation ID differs.
    pub fn reset_generation_id(&self, new_id: u64, initiator: Option<ReplicaId>) -> Result<()> {
        {
            let mut inner = self.inner.write();
            self.store.set_generation_id(new_id)?;
            self.store.clear()?;
            self.draft.clear_domain(self.base_dn())?;
            inner.heartbeats = ReplicaStateVector::new();

            for link in inner.links.values_mut() {
                if link.kind != LinkKind::DirectoryServer {
                    continue;
                }
                if Some(link.replica_id) == initiator {
                    link.generation_id = Some(new_id);
                    if link.status != LinkStatus::Active {
                        link.set_status(LinkStatus::Active);
                    }
                    continue;
                }
                if link.generation_id != Some(new_id) && link.status == LinkStatus::Active {
                    link.set_status(LinkStatus::Degraded);
                    link.notify(ReplicationMessage::error(
                        ErrorCode::GenerationMismatch,
                        format!("domain generation ID reset to {new_id}"),
                    ));
                    link.notify(ReplicationMessage::Status {
                        status: LinkStatus::Degraded,
                    });
                }
            }
        }
        tracing::info!(
            domain = %self.base_dn(),
            generation_id = new_id,
            initiator = ?initiator,
            "Generation ID reset"
        );
        self.bump();
        Ok(())
    }

    /// Up to which CSN changes are externally visible
    pub fn eligibility(&self) -> Eligibility {
        match self.eligibility {
            EligibilityPolicy::Immediate => Eligibility::All,
            EligibilityPolicy::MinimumAcknowledged => self
                .inner
                .read()
                .links
                .values()
                .filter(|link| {
                    link.kind == LinkKind::DirectoryServer && link.status == LinkStatus::Active
                })
                // A replica that has not published yet may still send anything.
                .map(|link| link.acknowledged.unwrap_or(Csn::MIN))
                .min()
                .map_or(Eligibility::All, Eligibility::UpTo),
        }
    }

    /// Records after `from` and at or before `upto`, capped by eligibility
    pub fn eligible_count(&self, from: &ReplicaStateVector, upto: Csn) -> Result<u64> {
        let upto = match self.eligibility().bound() {
            Some(bound) => bound.min(upto),
            None => upto,
        };
        self.store.count_between(from, upto)
    }

    /// Disconnect directory-server links silent for longer than `timeout`
    pub fn check_liveness(&self, timeout: Duration) -> Vec<ReplicaId> {
        let now = Instant::now();
        let silent: Vec<(LinkId, ReplicaId)> = self
            .inner
            .read()
            .links
            .iter()
            .filter(|(_, link)| {
                link.kind == LinkKind::DirectoryServer
                    && now.duration_since(link.last_seen) > timeout
            })
            .map(|(id, link)| (*id, link.replica_id))
            .collect();
        for (link_id, replica_id) in &silent {
            tracing::warn!(
                domain = %self.base_dn(),
                replica_id,
                timeout_ms = timeout.as_millis() as u64,
                "No heartbeat from replica, dropping link"
            );
            self.disconnect(*link_id);
        }
        silent.into_iter().map(|(_, replica_id)| replica_id).collect()
    }

    /// Apply the retention delay relative to `now_ms`
    pub fn purge(&self, now_ms: u64) -> Result<(Csn, PurgeOutcome)> {
        let boundary = Csn::at_timestamp(now_ms.saturating_sub(self.purge_delay.as_millis() as u64));
        let outcome = self.store.purge(boundary)?;
        Ok((boundary, outcome))
    }

    pub(crate) fn touch(&self, link_id: LinkId) {
        if let Some(link) = self.inner.write().links.get_mut(&link_id) {
            link.last_seen = Instant::now();
        }
    }

    pub(crate) fn link_kind(&self, link_id: LinkId) -> Option<(ReplicaId, LinkKind)> {
        self.inner
            .read()
            .links
            .get(&link_id)
            .map(|link| (link.replica_id, link.kind))
    }

    pub(crate) fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

impl std::fmt::Debug for ReplicationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDomain")
            .field("base_dn", &self.config.base_dn)
            .field("links", &self.inner.read().links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::link::ReplicaLink;
    use crate::replication::server::ReplicationServer;
    use crate::testing::{RecordFactory, TestContext, test_config};

    const DN: &str = "dc=example,dc=com";
    const WAIT: Duration = Duration::from_secs(5);

    fn open(ctx: &TestContext) -> Arc<ReplicationServer> {
        ReplicationServer::open(test_config(ctx, &[DN])).unwrap()
    }

    fn connect(server: &ReplicationServer, replica_id: ReplicaId, generation: u64) -> ReplicaLink {
        server
            .connect(Handshake::directory_server(DN, replica_id, Some(generation)))
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn next_non_status(link: &mut ReplicaLink) -> ReplicationMessage {
        loop {
            match link.receive(WAIT).await.unwrap() {
                ReplicationMessage::Status { .. } => continue,
                msg => return msg,
            }
        }
    }

    #[tokio::test]
    async fn test_generation_mismatch_degrades_link() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();

        let r1 = connect(&server, 1, 7);
        assert_eq!(r1.status(), LinkStatus::Active);
        assert_eq!(domain.generation_id(), Some(7));

        let mut r2 = connect(&server, 2, 8);
        assert_eq!(r2.status(), LinkStatus::Degraded);
        assert_eq!(r2.welcome().status, LinkStatus::Degraded);
        assert!(matches!(
            r2.receive(WAIT).await.unwrap(),
            ReplicationMessage::Error {
                code: ErrorCode::GenerationMismatch,
                ..
            }
        ));
        assert_eq!(domain.recipients(), vec![1]);

        let mut factory = RecordFactory::new(2, 1_000);
        for i in 0..2 {
            let err = r2.publish(factory.add(&format!("uid={i},{DN}"))).await.unwrap_err();
            assert!(matches!(err, Error::GenerationMismatch { expected: Some(7), actual: Some(8), .. }));
            assert!(matches!(
                r2.receive(WAIT).await.unwrap(),
                ReplicationMessage::Error {
                    code: ErrorCode::GenerationMismatch,
                    ..
                }
            ));
        }
        assert!(domain.store().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_replica_rejected() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let _r1 = connect(&server, 1, 7);
        let err = server
            .connect(Handshake::directory_server(DN, 1, Some(7)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReplica { replica_id: 1, .. }));
        // A changelog reader with the same id is another kind of link
        assert!(server.connect(Handshake::changelog_reader(DN, 1)).is_ok());
    }

    #[tokio::test]
    async fn test_updates_forwarded_except_to_origin() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let mut r1 = connect(&server, 1, 7);
        let mut r2 = connect(&server, 2, 7);

        let mut factory = RecordFactory::new(1, 1_000);
        let record = factory.add(&format!("uid=a,{DN}"));
        r1.publish(record.clone()).await.unwrap();

        assert_eq!(
            r2.receive(WAIT).await.unwrap(),
            ReplicationMessage::Update { record }
        );
        assert!(matches!(
            r1.receive(Duration::from_millis(100)).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_late_lower_csn_reaches_every_replica() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let r1 = connect(&server, 1, 7);
        let r2 = connect(&server, 2, 7);
        let mut r3 = connect(&server, 3, 7);

        // r2's clock lags r1's.
        let ahead = RecordFactory::new(1, 2_000).add(&format!("uid=a,{DN}"));
        r1.publish(ahead.clone()).await.unwrap();
        assert_eq!(
            next_non_status(&mut r3).await,
            ReplicationMessage::Update { record: ahead }
        );

        let behind = RecordFactory::new(2, 1_000).add(&format!("uid=b,{DN}"));
        r2.publish(behind.clone()).await.unwrap();
        assert_eq!(
            next_non_status(&mut r3).await,
            ReplicationMessage::Update { record: behind }
        );
    }

    #[tokio::test]
    async fn test_out_of_order_publish_fails() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let mut r1 = connect(&server, 1, 7);
        let mut factory = RecordFactory::new(1, 1_000);
        let first = factory.add(&format!("uid=a,{DN}"));
        let second = factory.modify(&format!("uid=a,{DN}"));

        r1.publish(second.clone()).await.unwrap();
        let err = r1.publish(first.clone()).await.unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { csn, last, .. } if csn == first.csn && last == second.csn));
        assert!(matches!(r1.publish(second.clone()).await, Err(Error::OutOfOrder { .. })));

        // Bypassing the local check, the domain rejects it and reports back.
        r1.sender()
            .forward(ReplicationMessage::Update {
                record: first.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            r1.receive(WAIT).await.unwrap(),
            ReplicationMessage::Error {
                code: ErrorCode::OutOfOrder,
                ..
            }
        ));
        // the link survives
        assert_eq!(r1.status(), LinkStatus::Active);
        assert_eq!(domain.store().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnected_replica_keeps_order() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let mut factory = RecordFactory::new(1, 1_000);
        let first = factory.add(&format!("uid=a,{DN}"));
        let second = factory.modify(&format!("uid=a,{DN}"));

        let r1 = connect(&server, 1, 7);
        r1.publish(second.clone()).await.unwrap();
        wait_until(|| domain.store().len().unwrap() == 1).await;
        r1.disconnect();
        wait_until(|| domain.links().is_empty()).await;

        // The domain already holds a newer change of this replica.
        let again = connect(&server, 1, 7);
        assert!(matches!(again.publish(first).await, Err(Error::OutOfOrder { .. })));
    }

    #[tokio::test]
    async fn test_eligibility_follows_slowest_replica() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        assert_eq!(domain.eligibility(), Eligibility::All);

        let r1 = connect(&server, 1, 7);
        let r2 = connect(&server, 2, 7);
        let mut f1 = RecordFactory::new(1, 2_000);
        let mut f2 = RecordFactory::new(2, 1_000);
        let newer = f1.add(&format!("uid=a,{DN}"));
        let older = f2.add(&format!("uid=b,{DN}"));
        r1.publish(newer.clone()).await.unwrap();
        r2.publish(older.clone()).await.unwrap();
        wait_until(|| domain.store().len().unwrap() == 2).await;
        wait_until(|| domain.eligibility() == Eligibility::UpTo(older.csn)).await;
        assert_eq!(
            domain.eligible_count(&ReplicaStateVector::new(), Csn::at_timestamp(u64::MAX)).unwrap(),
            1
        );

        f2.clock().set(3_000);
        let heartbeat = f2.next_csn();
        r2.heartbeat(heartbeat).await.unwrap();
        wait_until(|| domain.eligibility() == Eligibility::UpTo(newer.csn)).await;
        assert_eq!(domain.heartbeat_state().get(2), Some(heartbeat));
        assert_eq!(
            domain.eligible_count(&ReplicaStateVector::new(), Csn::at_timestamp(u64::MAX)).unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_silent_replica_holds_eligibility() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let r1 = connect(&server, 1, 7);
        let r2 = connect(&server, 2, 7);

        let ahead = RecordFactory::new(1, 2_000).add(&format!("uid=a,{DN}"));
        r1.publish(ahead.clone()).await.unwrap();
        wait_until(|| domain.store().len().unwrap() == 1).await;
        assert_eq!(domain.eligibility(), Eligibility::UpTo(Csn::MIN));
        assert!(!domain.eligibility().admits(&ahead.csn));

        let behind = RecordFactory::new(2, 1_000).add(&format!("uid=b,{DN}"));
        r2.publish(behind.clone()).await.unwrap();
        wait_until(|| domain.eligibility() == Eligibility::UpTo(behind.csn)).await;
    }

    #[tokio::test]
    async fn test_reset_generation_degrades_others() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let r1 = connect(&server, 1, 7);
        let mut r2 = connect(&server, 2, 7);
        let mut factory = RecordFactory::new(1, 1_000);
        r1.publish(factory.add(&format!("uid=a,{DN}"))).await.unwrap();
        wait_until(|| !domain.store().is_empty().unwrap()).await;

        server.reset_generation_id(DN, 9, Some(1)).unwrap();
        assert_eq!(domain.generation_id(), Some(9));
        assert!(domain.store().is_empty().unwrap());
        assert_eq!(r1.status(), LinkStatus::Active);
        assert_eq!(r2.status(), LinkStatus::Degraded);
        assert_eq!(domain.recipients(), vec![1]);
        loop {
            match r2.receive(WAIT).await.unwrap() {
                ReplicationMessage::Error { code, .. } => {
                    assert_eq!(code, ErrorCode::GenerationMismatch);
                    break;
                }
                ReplicationMessage::Update { .. } | ReplicationMessage::Status { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_reset_from_content_computes_generation() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let r1 = connect(&server, 1, 7);
        let r2 = connect(&server, 2, 7);

        let export = [
            format!("dn: {DN}\nobjectClass: domain\n"),
            format!("dn: uid=a,{DN}\nobjectClass: person\n"),
        ];
        let expected = crate::generation::compute(&export);
        let installed = server
            .reset_generation_from_content(DN, &export, Some(1))
            .unwrap();
        assert_eq!(installed, expected);
        assert_eq!(domain.generation_id(), Some(expected));
        assert_eq!(r1.status(), LinkStatus::Active);
        wait_until(|| r2.status() == LinkStatus::Degraded).await;

        let empty = server
            .reset_generation_from_content(DN, Vec::<Vec<u8>>::new(), Some(1))
            .unwrap();
        assert_eq!(empty, crate::generation::EMPTY_GENERATION_ID);
    }

    #[tokio::test]
    async fn test_reinitialization_restores_degraded_link() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let r1 = connect(&server, 1, 7);
        let mut r2 = connect(&server, 2, 8);
        assert!(matches!(r2.receive(WAIT).await.unwrap(), ReplicationMessage::Error { .. }));

        let target = RoutingTarget::Replica(2);
        let export = [
            ReplicationMessage::InitializeTarget {
                source: 1,
                target,
                entry_count: 1,
                generation_id: 7,
                reset_generation: false,
            },
            ReplicationMessage::Entry {
                source: 1,
                target,
                data: b"dn: dc=example,dc=com".to_vec(),
            },
            ReplicationMessage::Done { source: 1, target },
        ];
        for msg in export.iter().cloned() {
            r1.send_total_update(msg).await.unwrap();
        }
        for expected in &export {
            assert_eq!(&next_non_status(&mut r2).await, expected);
        }
        wait_until(|| r2.status() == LinkStatus::Active).await;
        assert_eq!(domain.recipients(), vec![1, 2]);

        let mut factory = RecordFactory::new(1, 5_000);
        let record = factory.add(&format!("uid=after,{DN}"));
        r1.publish(record.clone()).await.unwrap();
        assert_eq!(next_non_status(&mut r2).await, ReplicationMessage::Update { record });
    }

    #[tokio::test]
    async fn test_reset_through_export_adopts_generation() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let r1 = connect(&server, 1, 7);
        let mut r2 = connect(&server, 2, 7);

        r1.send_total_update(ReplicationMessage::InitializeTarget {
            source: 1,
            target: RoutingTarget::AllServers,
            entry_count: 0,
            generation_id: 11,
            reset_generation: true,
        })
        .await
        .unwrap();
        wait_until(|| domain.generation_id() == Some(11)).await;
        assert_eq!(r1.status(), LinkStatus::Active);
        wait_until(|| r2.status() == LinkStatus::Degraded).await;

        r1.send_total_update(ReplicationMessage::Done {
            source: 1,
            target: RoutingTarget::AllServers,
        })
        .await
        .unwrap();
        wait_until(|| r2.status() == LinkStatus::Active).await;
        assert_eq!(domain.recipients(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_drops_silent_directory_servers() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let r1 = connect(&server, 1, 7);
        let _reader = server.connect(Handshake::changelog_reader(DN, 50)).unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(domain.check_liveness(Duration::from_millis(200)), vec![1]);
        assert_eq!(r1.status(), LinkStatus::Disconnected);
        assert_eq!(domain.links().len(), 1);
        assert!(matches!(
            r1.publish(RecordFactory::new(1, 1_000).add(&format!("uid=a,{DN}"))).await,
            Err(Error::LinkDisconnected)
        ));
    }

    #[test]
    fn test_purge_applies_delay() {
        let ctx = TestContext::new();
        let server = open(&ctx);
        let domain = server.domain(DN).unwrap();
        let mut factory = RecordFactory::new(1, 1_000);
        let old = factory.add(&format!("uid=a,{DN}"));
        factory.clock().set(10_000_000);
        let recent = factory.modify(&format!("uid=a,{DN}"));
        domain.store().append(&old).unwrap();
        domain.store().append(&recent).unwrap();

        let delay_ms = server.config().purge_delay_secs * 1000;
        let (boundary, outcome) = domain.purge(10_000_000 + delay_ms - 1).unwrap();
        assert_eq!(boundary.timestamp(), 10_000_000 - 1);
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.oldest, Some(recent.csn));
    }
}
