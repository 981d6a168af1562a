//! Configuration and update record fixtures

use super::{ManualClock, TestContext};
use crate::csn::{Csn, CsnGenerator, ReplicaId};
use crate::replication::config::{DomainConfig, ReplicationServerConfig};
use crate::update::{Attribute, Modification, ModificationType, UpdateRecord};
use std::time::Duration;
use uuid::Uuid;

/// Server configuration with small limits, rooted in the test context
pub fn test_config(ctx: &TestContext, domains: &[&str]) -> ReplicationServerConfig {
    let mut config = ReplicationServerConfig::new(100, ctx.data_dir("changelog"))
        .with_window_size(16)
        .with_publish_timeout(Duration::from_secs(2))
        .with_heartbeat_interval(Duration::from_millis(200));
    config.map_size = 64 * 1024 * 1024;
    config.ecl_batch_size = 4;
    config.bind_addr = ([127, 0, 0, 1], 0).into();
    for domain in domains {
        config = config.with_domain(DomainConfig::new(*domain));
    }
    config
}

/// Builds update records stamped by one replica's generator
#[derive(Debug)]
pub struct RecordFactory {
    clock: ManualClock,
    generator: CsnGenerator<ManualClock>,
}

impl RecordFactory {
    /// Factory for `replica_id` with its clock frozen at `millis`
    pub fn new(replica_id: ReplicaId, millis: u64) -> Self {
        let clock = ManualClock::new(millis);
        Self {
            generator: CsnGenerator::with_clock(replica_id, clock.clone()),
            clock,
        }
    }

    /// Clock driving the generator
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Next CSN
    pub fn next_csn(&mut self) -> Csn {
        self.generator.next()
    }

    /// Add of an entry with a `cn` and `description`
    pub fn add(&mut self, dn: &str) -> UpdateRecord {
        let rdn_value = dn.split(',').next().and_then(|rdn| rdn.split('=').nth(1)).unwrap_or(dn);
        let attributes = vec![
            Attribute::new("objectClass", ["top", "person"]),
            Attribute::new("cn", [rdn_value]),
            Attribute::new("description", ["created"]),
        ];
        UpdateRecord::add(self.next_csn(), Uuid::new_v4(), dn, attributes.clone())
            .with_entry_attributes(attributes)
    }

    /// Delete
    pub fn delete(&mut self, dn: &str) -> UpdateRecord {
        UpdateRecord::delete(self.next_csn(), Uuid::new_v4(), dn)
    }

    /// Replace of `description`
    pub fn modify(&mut self, dn: &str) -> UpdateRecord {
        UpdateRecord::modify(
            self.next_csn(),
            Uuid::new_v4(),
            dn,
            vec![Modification::new(
                ModificationType::Replace,
                Attribute::new("description", ["modified"]),
            )],
        )
        .with_entry_attributes(vec![Attribute::new("cn", ["modified"])])
    }

    /// Rename keeping the parent
    pub fn modify_dn(&mut self, dn: &str, new_rdn: &str) -> UpdateRecord {
        UpdateRecord::modify_dn(self.next_csn(), Uuid::new_v4(), dn, new_rdn, true, None)
    }
}
