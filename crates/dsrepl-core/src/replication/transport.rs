//! TCP transport for replica links
//!
//! A connection starts with a `Hello` frame from the replica. The server
//! answers with `Welcome` (or `Error` and closes), after which frames flow
//! both ways through the same bounded link queues in-process replicas use.

use crate::replication::link::{Handshake, Welcome};
use crate::replication::protocol::{
    ErrorCode, PROTOCOL_VERSION, ReplicationCodec, ReplicationMessage,
};
use crate::replication::server::ReplicationServer;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// A framed replication connection
pub type ReplicationStream = Framed<TcpStream, ReplicationCodec>;

/// Accept replica connections until `cancel` fires
pub async fn run_listener(
    server: Arc<ReplicationServer>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(
        "Replication server {} listening on {}",
        server.config().server_id,
        local
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Replication listener on {} shutting down", local);
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::info!("Replica connected from {}", addr);
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(server, stream).await {
                                tracing::warn!("Replica session from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                }
            }
        }
    }
    Ok(())
}

/// Run one replica session over an accepted connection
pub async fn serve_connection(server: Arc<ReplicationServer>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, ReplicationCodec::new(server.config().max_frame_bytes));

    let handshake = match read_hello(&mut framed, server.config().liveness_timeout()).await {
        Ok(handshake) => handshake,
        Err(e) => {
            let _ = framed
                .send(ReplicationMessage::error(ErrorCode::Protocol, e.to_string()))
                .await;
            return Err(e);
        }
    };

    let link = match server.connect(handshake) {
        Ok(link) => link,
        Err(e) => {
            let code = match &e {
                Error::UnknownDomain(_) => ErrorCode::UnknownDomain,
                Error::DuplicateReplica { .. } => ErrorCode::DuplicateReplica,
                _ => ErrorCode::Internal,
            };
            let _ = framed.send(ReplicationMessage::error(code, e.to_string())).await;
            return Err(e);
        }
    };
    framed.send(link.welcome().to_message()).await?;

    let (sender, mut receiver, guard) = link.split();
    let (mut sink, mut stream) = framed.split();

    let outbound = tokio::spawn(async move {
        while let Some(msg) = receiver.recv().await {
            if let Err(e) = sink.send(msg).await {
                tracing::debug!("Replica socket write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = loop {
        tokio::select! {
            _ = sender.closed() => {
                tracing::debug!(replica_id = sender.replica_id(), "Link closed by the server");
                break Ok(());
            }
            frame = stream.next() => match frame {
                None | Some(Ok(ReplicationMessage::Stop)) => break Ok(()),
                Some(Ok(msg)) => {
                    if let Err(e) = sender.forward(msg).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(e),
            }
        }
    };

    drop(guard);
    drop(sender);
    let _ = outbound.await;
    result
}

async fn read_hello(framed: &mut ReplicationStream, timeout: Duration) -> Result<Handshake> {
    let first = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| Error::Timeout)?;
    match first {
        Some(Ok(ReplicationMessage::Hello {
            base_dn,
            replica_id,
            generation_id,
            state,
            window,
            protocol_version,
            kind,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(Error::protocol(format!(
                    "unsupported protocol version {protocol_version}"
                )));
            }
            Ok(Handshake {
                base_dn,
                replica_id,
                generation_id,
                state,
                window,
                kind,
            })
        }
        Some(Ok(other)) => Err(Error::protocol(format!(
            "expected Hello, got {:?}",
            other.message_type()
        ))),
        Some(Err(e)) => Err(e),
        None => Err(Error::LinkDisconnected),
    }
}

/// Connect to a replication server and complete the handshake
pub async fn connect(
    addr: SocketAddr,
    handshake: Handshake,
    max_frame_bytes: usize,
) -> Result<(ReplicationStream, Welcome)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, ReplicationCodec::new(max_frame_bytes));

    framed
        .send(ReplicationMessage::Hello {
            base_dn: handshake.base_dn,
            replica_id: handshake.replica_id,
            generation_id: handshake.generation_id,
            state: handshake.state,
            window: handshake.window,
            protocol_version: PROTOCOL_VERSION,
            kind: handshake.kind,
        })
        .await?;

    match framed.next().await {
        Some(Ok(ReplicationMessage::Welcome {
            server_id,
            generation_id,
            state,
            window,
            status,
        })) => Ok((
            framed,
            Welcome {
                server_id,
                generation_id,
                state,
                window,
                status,
            },
        )),
        Some(Ok(ReplicationMessage::Error { code, message })) => match code {
            ErrorCode::UnknownDomain => Err(Error::UnknownDomain(message)),
            _ => Err(Error::replication(format!("{code:?}: {message}"))),
        },
        Some(Ok(other)) => Err(Error::protocol(format!(
            "expected Welcome, got {:?}",
            other.message_type()
        ))),
        Some(Err(e)) => Err(e),
        None => Err(Error::LinkDisconnected),
    }
}
