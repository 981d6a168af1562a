//! Replica link: the flow-controlled channel between a replica and a domain
//!
//! Both directions are bounded `mpsc` queues sized to the negotiated window,
//! so a link never holds more than `window` messages per direction in memory.
//! The server side of the link is a reader and a forwarder task per link.

use crate::csn::{Clock, Csn, CsnGenerator, ReplicaId};
use crate::replication::protocol::{LinkKind, LinkStatus, ReplicationMessage};
use crate::state::ReplicaStateVector;
use crate::update::UpdateRecord;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// What a replica presents when it connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Replicated base DN
    pub base_dn: String,
    /// Replica identifier
    pub replica_id: ReplicaId,
    /// Generation ID of the replica's data
    pub generation_id: Option<u64>,
    /// Replica's own state vector
    pub state: ReplicaStateVector,
    /// Requested window, server default when `None`
    pub window: Option<u32>,
    /// Kind of link
    pub kind: LinkKind,
}

impl Handshake {
    /// Directory server handshake
    pub fn directory_server(
        base_dn: impl Into<String>,
        replica_id: ReplicaId,
        generation_id: Option<u64>,
    ) -> Self {
        Self {
            base_dn: base_dn.into(),
            replica_id,
            generation_id,
            state: ReplicaStateVector::new(),
            window: None,
            kind: LinkKind::DirectoryServer,
        }
    }

    /// Changelog reader handshake
    pub fn changelog_reader(base_dn: impl Into<String>, replica_id: ReplicaId) -> Self {
        Self {
            base_dn: base_dn.into(),
            replica_id,
            generation_id: None,
            state: ReplicaStateVector::new(),
            window: None,
            kind: LinkKind::ChangelogReader,
        }
    }

    /// Set the replica state
    pub fn with_state(mut self, state: ReplicaStateVector) -> Self {
        self.state = state;
        self
    }

    /// Request a window
    pub fn with_window(mut self, window: u32) -> Self {
        self.window = Some(window);
        self
    }
}

/// Handshake answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    /// Replication server identifier
    pub server_id: ReplicaId,
    /// Domain generation ID
    pub generation_id: Option<u64>,
    /// Domain state vector
    pub state: ReplicaStateVector,
    /// Negotiated window
    pub window: u32,
    /// Initial status of the link
    pub status: LinkStatus,
}

impl Welcome {
    /// Wire form
    pub fn to_message(&self) -> ReplicationMessage {
        ReplicationMessage::Welcome {
            server_id: self.server_id,
            generation_id: self.generation_id,
            state: self.state.clone(),
            window: self.window,
            status: self.status,
        }
    }
}

/// Sending half of a replica link
#[derive(Debug, Clone)]
pub struct LinkSender {
    base_dn: Arc<str>,
    replica_id: ReplicaId,
    generation_id: Option<u64>,
    window: usize,
    publish_timeout: Duration,
    to_server: mpsc::Sender<ReplicationMessage>,
    status: watch::Receiver<LinkStatus>,
    domain_generation: Arc<Mutex<Option<u64>>>,
    last_published: Arc<Mutex<Option<Csn>>>,
    cancel: CancellationToken,
}

impl LinkSender {
    /// Publish a committed local change
    ///
    /// Waits up to the publish timeout for window credit. A degraded link
    /// still hands the record to the domain, which answers with an error, and
    /// returns [`Error::GenerationMismatch`]. A change of this replica that is
    /// not newer than its previous one fails with [`Error::OutOfOrder`] and is
    /// not sent.
    pub async fn publish(&self, record: UpdateRecord) -> Result<()> {
        self.ensure_connected()?;
        let csn = record.csn;
        self.ensure_in_order(csn)?;
        self.forward(ReplicationMessage::Update { record }).await?;
        self.published(csn);
        self.ensure_active()
    }

    /// Publish without waiting; fails with [`Error::WindowExhausted`] when the window is full
    pub fn try_publish(&self, record: UpdateRecord) -> Result<()> {
        self.ensure_connected()?;
        let csn = record.csn;
        self.ensure_in_order(csn)?;
        match self.to_server.try_send(ReplicationMessage::Update { record }) {
            Ok(()) => {
                self.published(csn);
                self.ensure_active()
            }
            Err(TrySendError::Full(_)) => Err(Error::WindowExhausted {
                window: self.window,
            }),
            Err(TrySendError::Closed(_)) => Err(Error::LinkDisconnected),
        }
    }

    /// Advance this replica's clock in the domain without a change
    pub async fn heartbeat(&self, csn: Csn) -> Result<()> {
        self.ensure_connected()?;
        self.forward(ReplicationMessage::Heartbeat { csn }).await
    }

    /// Send a full-content initialization message
    pub async fn send_total_update(&self, msg: ReplicationMessage) -> Result<()> {
        if !msg.is_total_update() {
            return Err(Error::protocol(format!(
                "{:?} is not a total update message",
                msg.message_type()
            )));
        }
        self.ensure_connected()?;
        self.forward(msg).await
    }

    /// Hand any message to the domain, waiting for window credit
    pub async fn forward(&self, msg: ReplicationMessage) -> Result<()> {
        match self.to_server.send_timeout(msg, self.publish_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    domain = %self.base_dn,
                    replica_id = self.replica_id,
                    window = self.window,
                    "Replica link window exhausted"
                );
                Err(Error::WindowExhausted {
                    window: self.window,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::LinkDisconnected),
        }
    }

    /// Current status of the link
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Resolves once the link has been disconnected
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Status change notifications
    pub fn status_watch(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Replica identifier
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Replicated base DN
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Negotiated window
    pub fn window(&self) -> usize {
        self.window
    }

    /// Send heartbeats every `interval` until the link goes away
    ///
    /// The generator is shared with the replica's write path, so heartbeat
    /// CSNs interleave correctly with published changes.
    pub fn spawn_heartbeat<C>(
        &self,
        generator: Arc<Mutex<CsnGenerator<C>>>,
        interval: Duration,
    ) -> JoinHandle<()>
    where
        C: Clock + 'static,
    {
        let sender = self.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let csn = generator.lock().next();
                        match sender.heartbeat(csn).await {
                            Ok(()) => {}
                            Err(Error::LinkDisconnected) => break,
                            Err(e) => tracing::debug!(error = %e, "Heartbeat not sent"),
                        }
                    }
                }
            }
            tracing::debug!(replica_id = sender.replica_id, "Heartbeat task stopped");
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.status() == LinkStatus::Disconnected || self.cancel.is_cancelled() {
            return Err(Error::LinkDisconnected);
        }
        Ok(())
    }

    fn ensure_in_order(&self, csn: Csn) -> Result<()> {
        if csn.replica_id() != self.replica_id {
            return Ok(());
        }
        match *self.last_published.lock() {
            Some(last) if csn <= last => Err(Error::OutOfOrder {
                domain: self.base_dn.to_string(),
                csn,
                last,
            }),
            _ => Ok(()),
        }
    }

    fn published(&self, csn: Csn) {
        if csn.replica_id() != self.replica_id {
            return;
        }
        let mut last = self.last_published.lock();
        if last.is_none_or(|last| csn > last) {
            *last = Some(csn);
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status() {
            LinkStatus::Active => Ok(()),
            LinkStatus::Degraded => Err(Error::GenerationMismatch {
                domain: self.base_dn.to_string(),
                expected: *self.domain_generation.lock(),
                actual: self.generation_id,
            }),
            LinkStatus::Disconnected => Err(Error::LinkDisconnected),
        }
    }
}

/// Receiving half of a replica link
#[derive(Debug)]
pub struct LinkReceiver {
    from_server: mpsc::Receiver<ReplicationMessage>,
    domain_generation: Arc<Mutex<Option<u64>>>,
}

impl LinkReceiver {
    /// Next message, or [`Error::Timeout`] after `timeout`
    pub async fn receive(&mut self, timeout: Duration) -> Result<ReplicationMessage> {
        match tokio::time::timeout(timeout, self.from_server.recv()).await {
            Err(_) => Err(Error::Timeout),
            Ok(None) => Err(Error::LinkDisconnected),
            Ok(Some(msg)) => {
                self.observe(&msg);
                Ok(msg)
            }
        }
    }

    /// Next message, `None` once the link is closed
    pub async fn recv(&mut self) -> Option<ReplicationMessage> {
        let msg = self.from_server.recv().await?;
        self.observe(&msg);
        Some(msg)
    }

    fn observe(&self, msg: &ReplicationMessage) {
        if let ReplicationMessage::InitializeTarget {
            generation_id,
            reset_generation: true,
            ..
        } = msg
        {
            *self.domain_generation.lock() = Some(*generation_id);
        }
    }
}

/// A connected replica link
///
/// Dropping the link (or the guard returned by [`ReplicaLink::split`])
/// disconnects it.
#[derive(Debug)]
pub struct ReplicaLink {
    sender: LinkSender,
    receiver: LinkReceiver,
    welcome: Welcome,
    guard: Arc<DropGuard>,
}

/// Channel ends and token handed over by the server when a link is set up
pub(crate) struct LinkParts {
    pub base_dn: String,
    pub replica_id: ReplicaId,
    pub generation_id: Option<u64>,
    pub last_published: Option<Csn>,
    pub welcome: Welcome,
    pub publish_timeout: Duration,
    pub to_server: mpsc::Sender<ReplicationMessage>,
    pub from_server: mpsc::Receiver<ReplicationMessage>,
    pub status: watch::Receiver<LinkStatus>,
    pub cancel: CancellationToken,
}

impl ReplicaLink {
    pub(crate) fn new(parts: LinkParts) -> Self {
        let domain_generation = Arc::new(Mutex::new(parts.welcome.generation_id));
        let sender = LinkSender {
            base_dn: Arc::from(parts.base_dn.as_str()),
            replica_id: parts.replica_id,
            generation_id: parts.generation_id,
            window: parts.welcome.window as usize,
            publish_timeout: parts.publish_timeout,
            to_server: parts.to_server,
            status: parts.status,
            domain_generation: domain_generation.clone(),
            last_published: Arc::new(Mutex::new(parts.last_published)),
            cancel: parts.cancel.clone(),
        };
        Self {
            sender,
            receiver: LinkReceiver {
                from_server: parts.from_server,
                domain_generation,
            },
            welcome: parts.welcome,
            guard: Arc::new(parts.cancel.drop_guard()),
        }
    }

    /// Handshake answer
    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    /// Sending half
    pub fn sender(&self) -> &LinkSender {
        &self.sender
    }

    /// See [`LinkSender::publish`]
    pub async fn publish(&self, record: UpdateRecord) -> Result<()> {
        self.sender.publish(record).await
    }

    /// See [`LinkSender::try_publish`]
    pub fn try_publish(&self, record: UpdateRecord) -> Result<()> {
        self.sender.try_publish(record)
    }

    /// See [`LinkSender::heartbeat`]
    pub async fn heartbeat(&self, csn: Csn) -> Result<()> {
        self.sender.heartbeat(csn).await
    }

    /// See [`LinkSender::send_total_update`]
    pub async fn send_total_update(&self, msg: ReplicationMessage) -> Result<()> {
        self.sender.send_total_update(msg).await
    }

    /// See [`LinkReceiver::receive`]
    pub async fn receive(&mut self, timeout: Duration) -> Result<ReplicationMessage> {
        self.receiver.receive(timeout).await
    }

    /// Current status
    pub fn status(&self) -> LinkStatus {
        self.sender.status()
    }

    /// See [`LinkSender::spawn_heartbeat`]
    pub fn spawn_heartbeat<C>(
        &self,
        generator: Arc<Mutex<CsnGenerator<C>>>,
        interval: Duration,
    ) -> JoinHandle<()>
    where
        C: Clock + 'static,
    {
        self.sender.spawn_heartbeat(generator, interval)
    }

    /// Separate the halves; the link stays up until the guard is dropped
    pub fn split(self) -> (LinkSender, LinkReceiver, LinkGuard) {
        (self.sender, self.receiver, LinkGuard(self.guard))
    }

    /// Close the link
    pub fn disconnect(self) {
        let _ = self.sender.to_server.try_send(ReplicationMessage::Stop);
        self.sender.cancel.cancel();
    }
}

/// Keeps a split link connected while alive
#[derive(Debug, Clone)]
pub struct LinkGuard(#[allow(dead_code)] Arc<DropGuard>);
