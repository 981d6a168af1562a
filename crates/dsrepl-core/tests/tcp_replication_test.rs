//! Replication over the TCP transport
//!
//! Replicas speak the framed wire protocol to a listener bound on an
//! ephemeral port.

use dsrepl_core::ecl::Filter;
use dsrepl_core::replication::transport::{ReplicationStream, connect, run_listener};
use dsrepl_core::replication::{LinkStatus, ReplicationMessage, RoutingTarget};
use dsrepl_core::testing::{RecordFactory, TestContext, test_config};
use dsrepl_core::{Handshake, MultiDomainState, PersistentSearch, ReplicationServer};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DN: &str = "dc=example,dc=com";
const MAX_FRAME: usize = 1 << 20;

async fn start(ctx: &TestContext) -> (Arc<ReplicationServer>, SocketAddr, CancellationToken) {
    let server = ReplicationServer::open(test_config(ctx, &[DN])).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(run_listener(server.clone(), listener, cancel.clone()));
    (server, addr, cancel)
}

async fn next_frame(stream: &mut ReplicationStream) -> ReplicationMessage {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no frame in time")
        .expect("stream closed")
        .expect("bad frame")
}

#[tokio::test]
async fn test_tcp_updates_reach_changelog() {
    let ctx = TestContext::new();
    let (server, addr, cancel) = start(&ctx).await;
    let (mut replica, welcome) = connect(addr, Handshake::directory_server(DN, 1, Some(3)), MAX_FRAME)
        .await
        .unwrap();
    assert_eq!(welcome.server_id, 100);

    let mut factory = RecordFactory::new(1, 1_000);
    let records = vec![
        factory.add(&format!("uid=a,{DN}")),
        factory.modify(&format!("uid=a,{DN}")),
    ];
    for record in &records {
        replica
            .send(ReplicationMessage::Update {
                record: record.clone(),
            })
            .await
            .unwrap();
    }

    let mut search = server
        .ecl()
        .persistent_search(PersistentSearch::cookie(MultiDomainState::new()))
        .unwrap();
    for record in &records {
        let entry = search
            .next_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.csn(), record.csn);
    }

    let entries = server
        .ecl()
        .search_cookie(&MultiDomainState::new(), &Filter::any(), None)
        .unwrap();
    assert_eq!(entries.len(), 2);

    replica.send(ReplicationMessage::Stop).await.unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn test_tcp_reinitialization_restores_degraded_replica() {
    let ctx = TestContext::new();
    let (server, addr, cancel) = start(&ctx).await;
    let (mut source, _) = connect(addr, Handshake::directory_server(DN, 1, Some(7)), MAX_FRAME)
        .await
        .unwrap();
    let (mut target, welcome) = connect(addr, Handshake::directory_server(DN, 2, Some(8)), MAX_FRAME)
        .await
        .unwrap();
    assert_eq!(welcome.status, LinkStatus::Degraded);
    assert!(matches!(
        next_frame(&mut target).await,
        ReplicationMessage::Error { .. }
    ));

    let routing = RoutingTarget::Replica(2);
    let export = vec![
        ReplicationMessage::InitializeTarget {
            source: 1,
            target: routing,
            entry_count: 2,
            generation_id: 7,
            reset_generation: false,
        },
        ReplicationMessage::Entry {
            source: 1,
            target: routing,
            data: b"dn: dc=example,dc=com\nobjectClass: domain\n".to_vec(),
        },
        ReplicationMessage::Entry {
            source: 1,
            target: routing,
            data: b"dn: uid=a,dc=example,dc=com\nobjectClass: person\n".to_vec(),
        },
        ReplicationMessage::Done {
            source: 1,
            target: routing,
        },
    ];
    for msg in &export {
        source.send(msg.clone()).await.unwrap();
    }
    for expected in &export {
        assert_eq!(&next_frame(&mut target).await, expected);
    }
    assert_eq!(
        next_frame(&mut target).await,
        ReplicationMessage::Status {
            status: LinkStatus::Active
        }
    );
    let domain = server.domain(DN).unwrap();
    assert_eq!(domain.recipients(), vec![1, 2]);

    let record = RecordFactory::new(1, 9_000).add(&format!("uid=b,{DN}"));
    source
        .send(ReplicationMessage::Update {
            record: record.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut target).await,
        ReplicationMessage::Update { record }
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_tcp_heartbeat_advances_eligibility() {
    let ctx = TestContext::new();
    let (server, addr, cancel) = start(&ctx).await;
    let (mut slow, _) = connect(addr, Handshake::directory_server(DN, 1, Some(1)), MAX_FRAME)
        .await
        .unwrap();
    let (mut fast, _) = connect(addr, Handshake::directory_server(DN, 2, Some(1)), MAX_FRAME)
        .await
        .unwrap();

    let mut slow_factory = RecordFactory::new(1, 1_000);
    let mut fast_factory = RecordFactory::new(2, 5_000);
    let slow_record = slow_factory.add(&format!("uid=s,{DN}"));
    let fast_record = fast_factory.add(&format!("uid=f,{DN}"));
    slow.send(ReplicationMessage::Update {
        record: slow_record.clone(),
    })
    .await
    .unwrap();
    fast.send(ReplicationMessage::Update {
        record: fast_record.clone(),
    })
    .await
    .unwrap();

    // Visibility is held back to the slowest replica.
    let domain = server.domain(DN).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while domain.store().len().unwrap() < 2
        || domain.eligibility().bound() != Some(slow_record.csn)
    {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!domain.eligibility().admits(&fast_record.csn));

    slow_factory.clock().set(6_000);
    slow.send(ReplicationMessage::Heartbeat {
        csn: slow_factory.next_csn(),
    })
    .await
    .unwrap();
    while !domain.eligibility().admits(&fast_record.csn) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
}
