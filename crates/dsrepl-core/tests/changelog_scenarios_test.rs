//! External changelog scenarios driven through replica links
//!
//! - one replica publishing every kind of change, read with an empty cookie
//! - resuming from the cookie of an entry
//! - two replicated namespaces merged in CSN order
//! - draft change numbers over several namespaces
//! - retention purge emptying the draft index

use dsrepl_core::ecl::Filter;
use dsrepl_core::replication::ReplicationDomain;
use dsrepl_core::testing::{ManualClock, RecordFactory, TestContext, test_config};
use dsrepl_core::update::ChangeType;
use dsrepl_core::{
    Error, Handshake, MultiDomainState, ReplicaId, ReplicationServer, UpdateRecord,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DN: &str = "dc=example,dc=com";

async fn wait_for_visible(domain: &ReplicationDomain, last: &UpdateRecord) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while domain.store().get(&last.csn).unwrap().is_none()
        || !domain.eligibility().admits(&last.csn)
    {
        assert!(Instant::now() < deadline, "records not visible in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn publish_all(
    server: &ReplicationServer,
    base_dn: &str,
    replica_id: ReplicaId,
    records: &[UpdateRecord],
) {
    let link = server
        .connect(Handshake::directory_server(base_dn, replica_id, Some(1)))
        .unwrap();
    for record in records {
        link.publish(record.clone()).await.unwrap();
    }
    if let Some(last) = records.last() {
        wait_for_visible(&server.domain(base_dn).unwrap(), last).await;
    }
}

fn four_operations(factory: &mut RecordFactory) -> Vec<UpdateRecord> {
    vec![
        factory.delete(&format!("uid=old,{DN}")),
        factory.add(&format!("uid=new,{DN}")),
        factory.modify(&format!("uid=new,{DN}")),
        factory.modify_dn(&format!("uid=new,{DN}"), "uid=renamed"),
    ]
}

#[tokio::test]
async fn test_empty_cookie_returns_every_operation() {
    let ctx = TestContext::new();
    let server = ReplicationServer::open(test_config(&ctx, &[DN])).unwrap();
    let mut factory = RecordFactory::new(1, 1_000);
    let records = four_operations(&mut factory);
    publish_all(&server, DN, 1, &records).await;

    let entries = server
        .ecl()
        .search_cookie(&MultiDomainState::new(), &Filter::any(), None)
        .unwrap();
    assert_eq!(entries.len(), 4);
    let types: Vec<ChangeType> = entries.iter().map(|e| e.change_type()).collect();
    assert_eq!(
        types,
        vec![ChangeType::Delete, ChangeType::Add, ChangeType::Modify, ChangeType::ModifyDn]
    );
    for (entry, record) in entries.iter().zip(&records) {
        assert_eq!(entry.csn(), record.csn);
        assert_eq!(entry.cookie.to_string(), format!("{DN}:{};", record.csn));
        assert_eq!(entry.attribute_values("targetDN"), vec![record.dn.clone()]);
    }
}

#[tokio::test]
async fn test_cookie_of_third_entry_returns_fourth() {
    let ctx = TestContext::new();
    let server = ReplicationServer::open(test_config(&ctx, &[DN])).unwrap();
    let mut factory = RecordFactory::new(1, 1_000);
    let records = four_operations(&mut factory);
    publish_all(&server, DN, 1, &records).await;

    let ecl = server.ecl();
    let all = ecl.search_cookie(&MultiDomainState::new(), &Filter::any(), None).unwrap();

    // The cookie travels as text between searches.
    let cookie: MultiDomainState = all[2].cookie.to_string().parse().unwrap();
    let rest = ecl.search_cookie(&cookie, &Filter::any(), None).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].csn(), records[3].csn);

    let last = ecl.search_cookie(&rest[0].cookie, &Filter::any(), None).unwrap();
    assert!(last.is_empty());
    assert_eq!(ecl.last_cookie().unwrap(), rest[0].cookie);
}

#[tokio::test]
async fn test_two_namespaces_merge_in_csn_order() {
    let ctx = TestContext::new();
    let server = ReplicationServer::open(test_config(&ctx, &["o=first", "o=second"])).unwrap();

    let later = RecordFactory::new(1, 2_001).add("uid=a,o=first");
    let earlier = RecordFactory::new(2, 2_000).add("uid=b,o=second");
    publish_all(&server, "o=first", 1, std::slice::from_ref(&later)).await;
    publish_all(&server, "o=second", 2, std::slice::from_ref(&earlier)).await;

    let entries = server
        .ecl()
        .search_cookie(&MultiDomainState::new(), &Filter::any(), None)
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].csn(), earlier.csn);
    assert_eq!(entries[0].base_dn, "o=second");
    assert_eq!(entries[1].csn(), later.csn);
    assert_eq!(entries[1].base_dn, "o=first");

    // The final cookie covers both namespaces.
    let cookie = &entries[1].cookie;
    assert_eq!(cookie.len(), 2);
    assert_eq!(cookie.get("o=first").unwrap().get(1), Some(later.csn));
    assert_eq!(cookie.get("o=second").unwrap().get(2), Some(earlier.csn));
}

#[tokio::test]
async fn test_draft_numbers_follow_merged_order() {
    let ctx = TestContext::new();
    let server = ReplicationServer::open(test_config(&ctx, &["o=first", "o=second"])).unwrap();
    let mut first = RecordFactory::new(1, 1_000);
    let mut second = RecordFactory::new(2, 1_000);

    let a = vec![first.add("uid=a1,o=first"), first.add("uid=a2,o=first")];
    second.clock().set(1_500);
    let b = vec![second.add("uid=b1,o=second")];
    publish_all(&server, "o=first", 1, &a).await;
    publish_all(&server, "o=second", 2, &b).await;

    let ecl = server.ecl();
    assert_eq!(ecl.first_change_number().unwrap(), 1);
    assert_eq!(ecl.last_change_number().unwrap(), 3);

    let entries = ecl.search_draft(&Filter::any(), None).unwrap();
    let numbered: Vec<(Option<u64>, _)> = entries.iter().map(|e| (e.change_number, e.csn())).collect();
    assert_eq!(
        numbered,
        vec![(Some(1), a[0].csn), (Some(2), a[1].csn), (Some(3), b[0].csn)]
    );
    assert_eq!(entries[2].dn, "changeNumber=3,cn=changelog");

    let range = Filter::parse("(&(changeNumber>=2)(changeNumber<=3))").unwrap();
    let entries = ecl.search_draft(&range, None).unwrap();
    assert_eq!(entries.iter().map(|e| e.change_number).collect::<Vec<_>>(), vec![Some(2), Some(3)]);

    let limited = ecl.search_draft(&Filter::any(), Some(1)).unwrap();
    assert_eq!(limited.len(), 1);

    // Numbers never issued yield nothing.
    let future = Filter::parse("(changeNumber=99)").unwrap();
    assert!(ecl.search_draft(&future, None).unwrap().is_empty());
}

#[tokio::test]
async fn test_purge_to_nothing_empties_draft_index() {
    let ctx = TestContext::new();
    let clock = ManualClock::new(1_000);
    let config = test_config(&ctx, &[DN]).with_purge_delay(Duration::from_secs(60));
    let server = ReplicationServer::open_with_clock(config, Arc::new(clock.clone())).unwrap();
    let mut factory = RecordFactory::new(1, 1_000);
    let records = four_operations(&mut factory);
    publish_all(&server, DN, 1, &records).await;

    let ecl = server.ecl();
    assert_eq!(ecl.last_change_number().unwrap(), 4);
    assert_eq!(server.draft_index().len_for_domain(DN).unwrap(), 4);

    clock.set(1_000 + 61_000);
    let purged = server.purge().unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].outcome.removed, 4);

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.draft_index().len_for_domain(DN).unwrap() > 0 {
        assert!(Instant::now() < deadline, "draft index not purged in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ecl.first_change_number().unwrap(), 0);

    let purged_number = Filter::parse("(changeNumber=2)").unwrap();
    let err = ecl.search_draft(&purged_number, None).unwrap_err();
    assert!(matches!(err, Error::ChangeNumberPurged { number: 2, first: None }));

    // The original cookie is now older than the retained history.
    let mut stale = MultiDomainState::new();
    stale.update(DN, records[0].csn);
    let err = ecl.search_cookie(&stale, &Filter::any(), None).unwrap_err();
    assert!(matches!(err, Error::StateNoLongerAvailable { .. }));
}
