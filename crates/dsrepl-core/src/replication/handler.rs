//! Server-side tasks of a replica link
//!
//! Each link gets two tasks:
//!
//! - the reader drains the inbound queue into the domain coordinator
//! - the forwarder tails the change log from the replica's state and pushes
//!   every change the replica does not have into the outbound queue
//!
//! Both stop when the link's cancellation token fires.

use crate::Error;
use crate::replication::domain::{LinkId, ReplicationDomain};
use crate::replication::protocol::{ErrorCode, LinkKind, ReplicationMessage};
use crate::state::ReplicaStateVector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) fn spawn_link_tasks(
    domain: Arc<ReplicationDomain>,
    link_id: LinkId,
    start: ReplicaStateVector,
    inbound: mpsc::Receiver<ReplicationMessage>,
    outbound: mpsc::Sender<ReplicationMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(run_reader(domain.clone(), link_id, inbound, outbound.clone(), cancel.clone()));
    tokio::spawn(run_forwarder(domain, link_id, start, outbound, cancel));
}

async fn run_reader(
    domain: Arc<ReplicationDomain>,
    link_id: LinkId,
    mut inbound: mpsc::Receiver<ReplicationMessage>,
    outbound: mpsc::Sender<ReplicationMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let result = match msg {
            ReplicationMessage::Update { record } => domain.receive_update(link_id, record),
            ReplicationMessage::Heartbeat { csn } => domain.receive_heartbeat(link_id, csn),
            ReplicationMessage::Stop => break,
            msg if msg.is_total_update() => domain.route_total_update(link_id, msg).await,
            other => {
                tracing::warn!(
                    domain = %domain.base_dn(),
                    link_id,
                    msg = ?other.message_type(),
                    "Unexpected message from replica"
                );
                let _ = outbound.try_send(ReplicationMessage::error(
                    ErrorCode::Protocol,
                    format!("unexpected {:?}", other.message_type()),
                ));
                Ok(())
            }
        };

        match result {
            Ok(()) => domain.touch(link_id),
            // Already reported to the replica by the coordinator.
            Err(Error::GenerationMismatch { .. })
            | Err(Error::OutOfOrder { .. })
            | Err(Error::CsnCollision { .. }) => domain.touch(link_id),
            Err(Error::LinkDisconnected) => break,
            Err(e) => {
                tracing::error!(domain = %domain.base_dn(), link_id, error = %e, "Link reader failed");
                break;
            }
        }
    }
    domain.disconnect(link_id);
}

async fn run_forwarder(
    domain: Arc<ReplicationDomain>,
    link_id: LinkId,
    start: ReplicaStateVector,
    outbound: mpsc::Sender<ReplicationMessage>,
    cancel: CancellationToken,
) {
    let Some((replica_id, kind)) = domain.link_kind(link_id) else {
        return;
    };
    let mut changes = domain.changes();
    let mut cursor = domain.store().read_from(&start);

    loop {
        changes.borrow_and_update();

        if let Some(state) = domain.take_resume_state(link_id) {
            tracing::debug!(domain = %domain.base_dn(), replica_id, %state, "Forwarder resumed");
            cursor = domain.store().read_from(&state);
        }

        if domain.is_recipient(link_id) {
            for next in cursor.by_ref() {
                let record = match next {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::error!(domain = %domain.base_dn(), replica_id, error = %e, "Change log read failed");
                        break;
                    }
                };
                if kind == LinkKind::DirectoryServer && record.csn.replica_id() == replica_id {
                    continue;
                }
                let csn = record.csn;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = outbound.send(ReplicationMessage::Update { record }) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                tracing::debug!(domain = %domain.base_dn(), replica_id, %csn, "Forwarded update");
                if !domain.is_recipient(link_id) {
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
