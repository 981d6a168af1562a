//! Reconnecting replica client
//!
//! Keeps one replica's session with a replication server alive across
//! dropped connections. Each reconnect re-sends `Hello` carrying the state
//! the replica has applied so far, so the server resumes forwarding where the
//! previous session stopped. Own changes the new `Welcome` does not cover are
//! sent again before anything queued since the drop.

use crate::csn::{Csn, ReplicaId};
use crate::replication::link::{Handshake, Welcome};
use crate::replication::protocol::ReplicationMessage;
use crate::replication::transport::{self, ReplicationStream};
use crate::state::ReplicaStateVector;
use crate::update::UpdateRecord;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

const DEFAULT_QUEUE: usize = 100;

/// Connection settings of a [`ReplicaClient`]
#[derive(Debug, Clone)]
pub struct ReplicaClientConfig {
    /// Replication server address
    pub addr: SocketAddr,
    /// Largest accepted frame
    pub max_frame_bytes: usize,
    /// Limit on one connect and handshake attempt
    pub connect_timeout: Duration,
    /// First delay between reconnect attempts
    pub initial_backoff: Duration,
    /// Cap on the doubling reconnect delay
    pub max_backoff: Duration,
    /// Own changes kept for resending after a drop
    pub resend_buffer: usize,
    /// How long a publish waits for queue space
    pub publish_timeout: Duration,
}

impl ReplicaClientConfig {
    /// Config with default limits for the given primary address
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_frame_bytes: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            resend_buffer: 4096,
            publish_timeout: Duration::from_secs(5),
        }
    }

    /// Set the initial and maximum reconnect backoff
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Replica side of a TCP replica link that survives disconnects
///
/// Publishing and receiving never report [`Error::LinkDisconnected`] while
/// the client runs; messages queue up until the next session.
#[derive(Debug)]
pub struct ReplicaClient {
    base_dn: Arc<str>,
    replica_id: ReplicaId,
    publish_timeout: Duration,
    outbound: mpsc::Sender<ReplicationMessage>,
    inbound: mpsc::Receiver<ReplicationMessage>,
    state: Arc<Mutex<ReplicaStateVector>>,
    last_published: Mutex<Option<Csn>>,
    session: watch::Receiver<Option<Welcome>>,
    sessions: Arc<AtomicU64>,
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl ReplicaClient {
    /// Start connecting in the background
    ///
    /// `handshake.state` seeds the retained state vector. The client stops
    /// when `cancel` fires, on [`ReplicaClient::shutdown`], or when dropped.
    pub fn spawn(
        config: ReplicaClientConfig,
        handshake: Handshake,
        cancel: CancellationToken,
    ) -> Self {
        let window = handshake
            .window
            .map_or(DEFAULT_QUEUE, |window| window as usize)
            .max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(window);
        let (inbound_tx, inbound_rx) = mpsc::channel(window);
        let (session_tx, session_rx) = watch::channel(None);
        let state = Arc::new(Mutex::new(handshake.state.clone()));
        let sessions = Arc::new(AtomicU64::new(0));
        let cancel = cancel.child_token();

        let base_dn: Arc<str> = Arc::from(handshake.base_dn.as_str());
        let replica_id = handshake.replica_id;
        let last_published = handshake.state.get(replica_id);
        let publish_timeout = config.publish_timeout;

        let worker = Worker {
            config,
            handshake,
            state: state.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
            session: session_tx,
            sessions: sessions.clone(),
            resend: VecDeque::new(),
        };
        let task = tokio::spawn(worker.run(cancel.clone()));

        Self {
            base_dn,
            replica_id,
            publish_timeout,
            outbound: outbound_tx,
            inbound: inbound_rx,
            state,
            last_published: Mutex::new(last_published),
            session: session_rx,
            sessions,
            guard: cancel.drop_guard(),
            task,
        }
    }

    /// Publish a committed local change
    ///
    /// Returns once the change is queued. A change of this replica that is
    /// not newer than its previous one fails with [`Error::OutOfOrder`].
    pub async fn publish(&self, record: UpdateRecord) -> Result<()> {
        let csn = record.csn;
        if csn.replica_id() == self.replica_id {
            let mut last = self.last_published.lock();
            if let Some(last) = *last {
                if csn <= last {
                    return Err(Error::OutOfOrder {
                        domain: self.base_dn.to_string(),
                        csn,
                        last,
                    });
                }
            }
            *last = Some(csn);
        }
        self.send(ReplicationMessage::Update { record }).await
    }

    /// Advance this replica's clock in the domain without a change
    pub async fn heartbeat(&self, csn: Csn) -> Result<()> {
        self.send(ReplicationMessage::Heartbeat { csn }).await
    }

    /// Next message from the server, waiting at most `timeout`
    pub async fn receive(&mut self, timeout: Duration) -> Result<ReplicationMessage> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(Error::LinkDisconnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Changes applied so far, sent as the state of the next `Hello`
    pub fn state(&self) -> ReplicaStateVector {
        self.state.lock().clone()
    }

    /// Welcome of the current session
    pub fn welcome(&self) -> Option<Welcome> {
        self.session.borrow().clone()
    }

    /// Whether a session is currently established
    pub fn is_connected(&self) -> bool {
        self.session.borrow().is_some()
    }

    /// Number of sessions established so far
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Wait until a session is up
    pub async fn wait_connected(&self, timeout: Duration) -> Result<Welcome> {
        let mut session = self.session.clone();
        let welcome = tokio::time::timeout(timeout, session.wait_for(Option::is_some))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::LinkDisconnected)?
            .clone();
        welcome.ok_or(Error::LinkDisconnected)
    }

    /// Send `Stop` on the current session and wait for the client to finish
    pub async fn shutdown(self) {
        let Self { guard, task, .. } = self;
        drop(guard);
        let _ = task.await;
    }

    async fn send(&self, msg: ReplicationMessage) -> Result<()> {
        match self.outbound.send_timeout(msg, self.publish_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::WindowExhausted {
                window: self.outbound.max_capacity(),
            }),
            Err(SendTimeoutError::Closed(_)) => Err(Error::LinkDisconnected),
        }
    }
}

struct Worker {
    config: ReplicaClientConfig,
    handshake: Handshake,
    state: Arc<Mutex<ReplicaStateVector>>,
    outbound: mpsc::Receiver<ReplicationMessage>,
    inbound: mpsc::Sender<ReplicationMessage>,
    session: watch::Sender<Option<Welcome>>,
    sessions: Arc<AtomicU64>,
    resend: VecDeque<UpdateRecord>,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut delay = self.config.initial_backoff;
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok((framed, welcome)) => {
                    delay = self.config.initial_backoff;
                    let count = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(
                        domain = %self.handshake.base_dn,
                        replica_id = self.handshake.replica_id,
                        server_id = welcome.server_id,
                        sessions = count,
                        status = ?welcome.status,
                        "Replica session established"
                    );
                    self.resend.retain(|record| !welcome.state.covers(&record.csn));
                    if let Some(own) = welcome.state.get(self.handshake.replica_id) {
                        self.state.lock().update(own);
                    }
                    self.session.send_replace(Some(welcome));

                    let ended = self.serve(framed, &cancel).await;
                    self.session.send_replace(None);
                    match ended {
                        Ok(()) => break,
                        Err(e) => tracing::warn!(
                            "Replication session lost: {}. Reconnecting in {:?}",
                            e,
                            delay
                        ),
                    }
                }
                Err(e) => {
                    tracing::warn!("Replication error: {}. Reconnecting in {:?}", e, delay);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_backoff);
        }

        self.session.send_replace(None);
        tracing::info!(
            domain = %self.handshake.base_dn,
            replica_id = self.handshake.replica_id,
            "Replica client stopped"
        );
    }

    async fn connect(&self) -> Result<(ReplicationStream, Welcome)> {
        let state = self.state.lock().clone();
        let handshake = self.handshake.clone().with_state(state);
        tokio::time::timeout(
            self.config.connect_timeout,
            transport::connect(self.config.addr, handshake, self.config.max_frame_bytes),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Run one session; `Ok` means the client is done, `Err` that the connection dropped
    async fn serve(&mut self, framed: ReplicationStream, cancel: &CancellationToken) -> Result<()> {
        let (mut sink, mut stream) = framed.split();

        if !self.resend.is_empty() {
            tracing::debug!(count = self.resend.len(), "Resending changes not yet stored");
        }
        for record in &self.resend {
            sink.send(ReplicationMessage::Update {
                record: record.clone(),
            })
            .await?;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(ReplicationMessage::Stop).await;
                    return Ok(());
                }
                msg = self.outbound.recv() => {
                    let Some(msg) = msg else {
                        let _ = sink.send(ReplicationMessage::Stop).await;
                        return Ok(());
                    };
                    if let ReplicationMessage::Update { record } = &msg {
                        self.retain(record.clone());
                    }
                    sink.send(msg).await?;
                }
                frame = stream.next() => match frame {
                    Some(Ok(msg)) => {
                        if let ReplicationMessage::Update { record } = &msg {
                            self.state.lock().update(record.csn);
                        }
                        if self.inbound.send(msg).await.is_err() {
                            let _ = sink.send(ReplicationMessage::Stop).await;
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::LinkDisconnected),
                }
            }
        }
    }

    fn retain(&mut self, record: UpdateRecord) {
        if self.resend.len() == self.config.resend_buffer {
            if let Some(dropped) = self.resend.pop_front() {
                tracing::warn!(csn = %dropped.csn, "Resend buffer full, oldest change dropped");
            }
        }
        self.resend.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::server::ReplicationServer;
    use crate::replication::transport::run_listener;
    use crate::testing::{RecordFactory, TestContext, test_config};
    use tokio::net::TcpListener;

    const DN: &str = "dc=example,dc=com";
    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config(addr: SocketAddr) -> ReplicaClientConfig {
        ReplicaClientConfig::new(addr)
            .with_backoff(Duration::from_millis(20), Duration::from_millis(100))
            .with_connect_timeout(Duration::from_secs(1))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn next_update(client: &mut ReplicaClient) -> UpdateRecord {
        loop {
            match client.receive(WAIT).await.unwrap() {
                ReplicationMessage::Update { record } => return record,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_client_survives_listener_restart() {
        let ctx = TestContext::new();
        let server = ReplicationServer::open(test_config(&ctx, &[DN])).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let accept = tokio::spawn(run_listener(server.clone(), listener, stop.clone()));

        let mut client = ReplicaClient::spawn(
            fast_config(addr),
            Handshake::directory_server(DN, 1, Some(7)),
            CancellationToken::new(),
        );
        client.wait_connected(WAIT).await.unwrap();
        let peer = server
            .connect(Handshake::directory_server(DN, 2, Some(7)))
            .unwrap();
        let domain = server.domain(DN).unwrap();

        let mut remote = RecordFactory::new(2, 1_000);
        let mut local = RecordFactory::new(1, 2_000);

        let before = remote.add("uid=before,dc=example,dc=com");
        peer.publish(before.clone()).await.unwrap();
        assert_eq!(next_update(&mut client).await, before);

        let first = local.add("uid=first,dc=example,dc=com");
        client.publish(first.clone()).await.unwrap();
        wait_until(|| domain.newest_state().get(1) == Some(first.csn)).await;

        // Take the listener down and drop the live session with it.
        stop.cancel();
        accept.await.unwrap().unwrap();
        let link = domain
            .links()
            .into_iter()
            .find(|link| link.replica_id == 1)
            .unwrap();
        domain.disconnect(link.link_id);
        wait_until(|| !client.is_connected()).await;

        let second = local.add("uid=second,dc=example,dc=com");
        client.publish(second.clone()).await.unwrap();
        let after = remote.add("uid=after,dc=example,dc=com");
        peer.publish(after.clone()).await.unwrap();

        let listener = TcpListener::bind(addr).await.unwrap();
        let stop = CancellationToken::new();
        tokio::spawn(run_listener(server.clone(), listener, stop.clone()));

        let welcome = client.wait_connected(WAIT).await.unwrap();
        assert_eq!(welcome.state.get(1), Some(first.csn));

        // The change seen before the drop is not delivered again.
        assert_eq!(next_update(&mut client).await, after);
        wait_until(|| domain.newest_state().get(1) == Some(second.csn)).await;
        assert_eq!(client.sessions(), 2);
        assert!(client.state().covers(&after.csn));

        client.shutdown().await;
        stop.cancel();
    }

    #[tokio::test]
    async fn test_client_delivers_change_queued_offline() {
        let ctx = TestContext::new();
        let server = ReplicationServer::open(test_config(&ctx, &[DN])).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        // Nothing listens yet, so the change waits in the client.
        let client = ReplicaClient::spawn(
            fast_config(addr),
            Handshake::directory_server(DN, 1, None),
            CancellationToken::new(),
        );
        let mut local = RecordFactory::new(1, 1_000);
        let record = local.add("uid=queued,dc=example,dc=com");
        client.publish(record.clone()).await.unwrap();
        assert!(!client.is_connected());

        let listener = TcpListener::bind(addr).await.unwrap();
        let stop = CancellationToken::new();
        tokio::spawn(run_listener(server.clone(), listener, stop.clone()));

        client.wait_connected(WAIT).await.unwrap();
        let domain = server.domain(DN).unwrap();
        wait_until(|| domain.newest_state().get(1) == Some(record.csn)).await;

        let err = client.publish(record).await.unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));

        client.shutdown().await;
        stop.cancel();
    }

    #[tokio::test]
    async fn test_client_stops_on_cancel() {
        let ctx = TestContext::new();
        let server = ReplicationServer::open(test_config(&ctx, &[DN])).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        tokio::spawn(run_listener(server.clone(), listener, stop.clone()));

        let cancel = CancellationToken::new();
        let mut client = ReplicaClient::spawn(
            fast_config(addr),
            Handshake::directory_server(DN, 1, None),
            cancel.clone(),
        );
        client.wait_connected(WAIT).await.unwrap();

        cancel.cancel();
        wait_until(|| !client.is_connected()).await;
        let domain = server.domain(DN).unwrap();
        wait_until(|| domain.links().is_empty()).await;
        loop {
            match client.receive(WAIT).await {
                Ok(_) => continue,
                Err(e) => {
                    assert!(matches!(e, Error::LinkDisconnected));
                    break;
                }
            }
        }
        stop.cancel();
    }
}
