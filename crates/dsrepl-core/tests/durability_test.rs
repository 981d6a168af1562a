//! Restart durability of the change logs and the draft change number index

use dsrepl_core::ecl::Filter;
use dsrepl_core::replication::EligibilityPolicy;
use dsrepl_core::testing::{RecordFactory, TestContext, test_config};
use dsrepl_core::{Csn, Error, MultiDomainState, ReplicationServer, ReplicationServerConfig};

const DN: &str = "dc=example,dc=com";

fn config(ctx: &TestContext) -> ReplicationServerConfig {
    test_config(ctx, &[DN]).with_eligibility(EligibilityPolicy::Immediate)
}

#[test]
fn test_cookie_and_draft_numbers_survive_restart() {
    let ctx = TestContext::new();
    let mut factory = RecordFactory::new(1, 1_000);
    let records: Vec<_> = (0..3).map(|i| factory.add(&format!("uid={i},{DN}"))).collect();

    let cookie = {
        let server = ReplicationServer::open(config(&ctx)).unwrap();
        let domain = server.domain(DN).unwrap();
        for record in &records {
            domain.store().append(record).unwrap();
        }
        let ecl = server.ecl();
        let entries = ecl.search_draft(&Filter::any(), None).unwrap();
        assert_eq!(entries.len(), 3);
        server.shutdown().unwrap();
        entries[1].cookie.to_string()
    };

    let server = ReplicationServer::open(config(&ctx)).unwrap();
    let domain = server.domain(DN).unwrap();
    assert_eq!(domain.store().len().unwrap(), 3);
    assert_eq!(domain.newest_state().get(1), Some(records[2].csn));

    let ecl = server.ecl();
    let cookie: MultiDomainState = cookie.parse().unwrap();
    let rest = ecl.search_cookie(&cookie, &Filter::any(), None).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].csn(), records[2].csn);

    // Numbers are neither reassigned nor reused after the restart.
    assert_eq!(ecl.first_change_number().unwrap(), 1);
    assert_eq!(ecl.last_change_number().unwrap(), 3);
    let second = ecl
        .search_draft(&Filter::parse("(changeNumber=2)").unwrap(), None)
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].csn(), records[1].csn);

    let next = factory.modify(&format!("uid=0,{DN}"));
    domain.store().append(&next).unwrap();
    let fourth = ecl
        .search_draft(&Filter::parse("(changeNumber>=4)").unwrap(), None)
        .unwrap();
    assert_eq!(fourth.len(), 1);
    assert_eq!(fourth[0].change_number, Some(4));
    assert_eq!(fourth[0].csn(), next.csn);
}

#[test]
fn test_generation_id_survives_restart() {
    let ctx = TestContext::new();
    {
        let server = ReplicationServer::open(config(&ctx)).unwrap();
        server.reset_generation_id(DN, 1234, None).unwrap();
        server.shutdown().unwrap();
    }

    let server = ReplicationServer::open(config(&ctx)).unwrap();
    assert_eq!(server.domain(DN).unwrap().generation_id(), Some(1234));
}

#[test]
fn test_purge_state_survives_restart() {
    let ctx = TestContext::new();
    let mut factory = RecordFactory::new(1, 1_000);
    let old = factory.add(&format!("uid=a,{DN}"));
    factory.clock().set(50_000);
    let kept = factory.modify(&format!("uid=a,{DN}"));
    {
        let server = ReplicationServer::open(config(&ctx)).unwrap();
        let domain = server.domain(DN).unwrap();
        domain.store().append(&old).unwrap();
        domain.store().append(&kept).unwrap();
        let purge = server
            .purge_before(DN, Csn::at_timestamp(10_000))
            .unwrap();
        assert_eq!(purge.outcome.removed, 1);
        server.shutdown().unwrap();
    }

    let server = ReplicationServer::open(config(&ctx)).unwrap();
    let domain = server.domain(DN).unwrap();
    assert_eq!(domain.store().purged_state().get(1), Some(old.csn));
    assert_eq!(domain.store().first_csn().unwrap(), Some(kept.csn));

    // A cookie predating the purge is refused.
    let mut stale = MultiDomainState::new();
    stale.update(DN, RecordFactory::new(1, 500).next_csn());
    let err = server.ecl().search_cookie(&stale, &Filter::any(), None).unwrap_err();
    assert!(matches!(err, Error::StateNoLongerAvailable { .. }));

    let mut current = MultiDomainState::new();
    current.update(DN, old.csn);
    let entries = server.ecl().search_cookie(&current, &Filter::any(), None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].csn(), kept.csn);
}
