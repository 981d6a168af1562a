//! Replication server: owns every domain, the LMDB environment and the draft index

use crate::csn::{Clock, Csn, SystemClock};
use crate::ecl::ExternalChangelog;
use crate::generation;
use crate::replication::config::{DomainConfig, ReplicationServerConfig};
use crate::replication::domain::ReplicationDomain;
use crate::replication::handler;
use crate::replication::link::{Handshake, LinkParts, ReplicaLink};
use crate::storage::{ChangelogDb, DraftNumberIndex, PurgeOutcome, normalize_dn};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of purging one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPurge {
    /// Replicated base DN
    pub base_dn: String,
    /// Records older than this were removed
    pub boundary: Csn,
    /// Change log purge result
    pub outcome: PurgeOutcome,
    /// Draft change numbers removed alongside
    pub draft_removed: usize,
}

/// Replication server
pub struct ReplicationServer {
    config: ReplicationServerConfig,
    db: ChangelogDb,
    draft: DraftNumberIndex,
    domains: RwLock<BTreeMap<String, Arc<ReplicationDomain>>>,
    changes: Arc<watch::Sender<u64>>,
    ecl_slots: Arc<Semaphore>,
    draft_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl ReplicationServer {
    /// Open the server and every configured domain
    pub fn open(config: ReplicationServerConfig) -> Result<Arc<Self>> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock (purge boundaries)
    pub fn open_with_clock(
        config: ReplicationServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let db = ChangelogDb::open(&config.data_dir, config.map_size)?;
        let draft = db.draft_index()?;
        let (changes, _) = watch::channel(0u64);

        let server = Self {
            ecl_slots: Arc::new(Semaphore::new(config.max_ecl_subscribers)),
            domains: RwLock::new(BTreeMap::new()),
            changes: Arc::new(changes),
            draft_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            config,
            db,
            draft,
            clock,
        };
        for domain in server.config.domains.clone() {
            server.add_domain(domain)?;
        }

        tracing::info!(
            server_id = server.config.server_id,
            domains = server.domains.read().len(),
            data_dir = %server.config.data_dir.display(),
            "Replication server opened"
        );
        Ok(Arc::new(server))
    }

    /// Start replicating a domain
    pub fn add_domain(&self, config: DomainConfig) -> Result<Arc<ReplicationDomain>> {
        let key = normalize_dn(&config.base_dn);
        let mut domains = self.domains.write();
        if domains.contains_key(&key) {
            return Err(Error::config(format!(
                "domain {} is already replicated",
                config.base_dn
            )));
        }
        let store = self.db.open_store(&config.base_dn, self.config.ecl_batch_size)?;
        let purge_delay = self.config.purge_delay_for(&config);
        let domain = Arc::new(ReplicationDomain::new(
            config,
            self.config.server_id,
            self.config.eligibility,
            purge_delay,
            store,
            self.draft.clone(),
            self.changes.clone(),
        ));
        tracing::info!(
            domain = %domain.base_dn(),
            private = domain.is_private(),
            generation_id = ?domain.generation_id(),
            "Replicated domain added"
        );
        domains.insert(key, domain.clone());
        Ok(domain)
    }

    /// Domain by base DN
    pub fn domain(&self, base_dn: &str) -> Option<Arc<ReplicationDomain>> {
        self.domains.read().get(&normalize_dn(base_dn)).cloned()
    }

    /// Every domain, in base DN order
    pub fn domains(&self) -> Vec<Arc<ReplicationDomain>> {
        self.domains.read().values().cloned().collect()
    }

    /// Domains visible in the external changelog
    pub fn public_domains(&self) -> Vec<Arc<ReplicationDomain>> {
        self.domains
            .read()
            .values()
            .filter(|domain| !domain.is_private())
            .cloned()
            .collect()
    }

    /// Connect an in-process replica; must be called inside a Tokio runtime
    pub fn connect(&self, handshake: Handshake) -> Result<ReplicaLink> {
        let domain = self
            .domain(&handshake.base_dn)
            .ok_or_else(|| Error::UnknownDomain(handshake.base_dn.clone()))?;
        let window = handshake
            .window
            .unwrap_or_else(|| u32::try_from(self.config.window_size).unwrap_or(u32::MAX))
            .max(1);

        let (to_server_tx, to_server_rx) = mpsc::channel(window as usize);
        let (from_server_tx, from_server_rx) = mpsc::channel(window as usize);
        let cancel = self.cancel.child_token();

        let registration =
            domain.register(&handshake, window, from_server_tx.clone(), cancel.clone())?;
        handler::spawn_link_tasks(
            domain,
            registration.link_id,
            handshake.state.clone(),
            to_server_rx,
            from_server_tx,
            cancel.clone(),
        );

        let last_published = [
            handshake.state.get(handshake.replica_id),
            registration.welcome.state.get(handshake.replica_id),
        ]
        .into_iter()
        .flatten()
        .max();

        Ok(ReplicaLink::new(LinkParts {
            base_dn: handshake.base_dn,
            replica_id: handshake.replica_id,
            generation_id: handshake.generation_id,
            last_published,
            welcome: registration.welcome,
            publish_timeout: self.config.publish_timeout(),
            to_server: to_server_tx,
            from_server: from_server_rx,
            status: registration.status,
            cancel: registration.cancel,
        }))
    }

    /// Apply every domain's retention delay, purging the draft index in lockstep
    pub fn purge(&self) -> Result<Vec<DomainPurge>> {
        let now = self.clock.now_millis();
        let _draft = self.draft_lock.lock();
        let mut purged = Vec::new();
        for domain in self.domains() {
            let (boundary, outcome) = domain.purge(now)?;
            let draft_removed = self.draft.purge_before(domain.base_dn(), boundary)?;
            purged.push(DomainPurge {
                base_dn: domain.base_dn().to_string(),
                boundary,
                outcome,
                draft_removed,
            });
        }
        Ok(purged)
    }

    /// Purge one domain below an explicit boundary
    pub fn purge_before(&self, base_dn: &str, boundary: Csn) -> Result<DomainPurge> {
        let domain = self
            .domain(base_dn)
            .ok_or_else(|| Error::UnknownDomain(base_dn.to_string()))?;
        let _draft = self.draft_lock.lock();
        let outcome = domain.store().purge(boundary)?;
        let draft_removed = self.draft.purge_before(domain.base_dn(), boundary)?;
        Ok(DomainPurge {
            base_dn: domain.base_dn().to_string(),
            boundary,
            outcome,
            draft_removed,
        })
    }

    /// Administrative generation ID reset of one domain, dropping its draft
    /// change numbers
    pub fn reset_generation_id(
        &self,
        base_dn: &str,
        new_id: u64,
        initiator: Option<crate::csn::ReplicaId>,
    ) -> Result<()> {
        let domain = self
            .domain(base_dn)
            .ok_or_else(|| Error::UnknownDomain(base_dn.to_string()))?;
        let _draft = self.draft_lock.lock();
        domain.reset_generation_id(new_id, initiator)
    }

    /// Generation ID reset recomputed from the domain's exported entries
    ///
    /// Returns the installed ID.
    pub fn reset_generation_from_content<I, E>(
        &self,
        base_dn: &str,
        entries: I,
        initiator: Option<crate::csn::ReplicaId>,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = E>,
        E: AsRef<[u8]>,
    {
        let new_id = generation::compute(entries);
        self.reset_generation_id(base_dn, new_id, initiator)?;
        Ok(new_id)
    }

    /// Run the purge and link liveness checks until `cancel` fires
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut purge_timer = tokio::time::interval(server.config.purge_interval());
            let mut liveness_timer = tokio::time::interval(server.config.heartbeat_interval());
            let liveness_timeout = server.config.liveness_timeout();
            tracing::info!(
                purge_interval_secs = server.config.purge_interval_secs,
                "Maintenance scheduler started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = server.cancel.cancelled() => break,
                    _ = purge_timer.tick() => {
                        match server.purge() {
                            Ok(purged) => {
                                for p in purged.iter().filter(|p| p.outcome.removed > 0) {
                                    tracing::info!(
                                        domain = %p.base_dn,
                                        removed = p.outcome.removed,
                                        draft_removed = p.draft_removed,
                                        "Retention purge"
                                    );
                                }
                            }
                            Err(e) => tracing::error!("Purge failed: {}", e),
                        }
                    }
                    _ = liveness_timer.tick() => {
                        for domain in server.domains() {
                            domain.check_liveness(liveness_timeout);
                        }
                    }
                }
            }
            tracing::info!("Maintenance scheduler stopped");
        })
    }

    /// External changelog over the public domains
    pub fn ecl(self: &Arc<Self>) -> ExternalChangelog {
        ExternalChangelog::new(self.clone())
    }

    /// Disconnect every link and flush the environment
    pub fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        for domain in self.domains() {
            domain.disconnect_all();
        }
        self.db.sync()?;
        tracing::info!(server_id = self.config.server_id, "Replication server stopped");
        Ok(())
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationServerConfig {
        &self.config
    }

    /// Draft change number index
    pub fn draft_index(&self) -> &DraftNumberIndex {
        &self.draft
    }

    /// Clock used for purge boundaries
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Root cancellation token; child tokens drive every link and task
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Notifications bumped on every append, heartbeat and status change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub(crate) fn ecl_slots(&self) -> &Arc<Semaphore> {
        &self.ecl_slots
    }

    pub(crate) fn lock_draft(&self) -> MutexGuard<'_, ()> {
        self.draft_lock.lock()
    }
}

impl std::fmt::Debug for ReplicationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationServer")
            .field("server_id", &self.config.server_id)
            .field("domains", &self.domains.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
