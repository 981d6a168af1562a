//! Changelog entries as exposed to external readers

use crate::cookie::MultiDomainState;
use crate::csn::Csn;
use crate::update::{Attribute, ChangeType, ModificationType, Operation, UpdateRecord};
use chrono::DateTime;
use serde_json::{Map, Value};

/// Suffix of every changelog entry DN
pub const CHANGELOG_SUFFIX: &str = "cn=changelog";

/// One change as seen through the external changelog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EclEntry {
    /// Entry DN in the changelog namespace
    pub dn: String,
    /// Replicated base DN the change belongs to
    pub base_dn: String,
    /// Draft change number, in draft mode only
    pub change_number: Option<u64>,
    /// Cookie positioned just after this change
    pub cookie: MultiDomainState,
    /// The change itself
    pub record: UpdateRecord,
    /// Projected original-entry attributes
    pub entry_attributes: Vec<Attribute>,
}

impl EclEntry {
    /// Cookie-mode entry
    pub fn new(
        base_dn: impl Into<String>,
        record: UpdateRecord,
        cookie: MultiDomainState,
        include: &[String],
    ) -> Self {
        let base_dn = base_dn.into();
        let entry_attributes = project(&record.entry_attributes, include);
        Self {
            dn: format!("replicationCSN={},{},{}", record.csn, base_dn, CHANGELOG_SUFFIX),
            base_dn,
            change_number: None,
            cookie,
            record,
            entry_attributes,
        }
    }

    /// Switch to draft addressing
    pub fn with_change_number(mut self, number: u64) -> Self {
        self.dn = format!("changeNumber={number},{CHANGELOG_SUFFIX}");
        self.change_number = Some(number);
        self
    }

    /// CSN of the change
    pub fn csn(&self) -> Csn {
        self.record.csn
    }

    /// DN of the changed entry
    pub fn target_dn(&self) -> &str {
        &self.record.dn
    }

    /// Kind of change
    pub fn change_type(&self) -> ChangeType {
        self.record.change_type()
    }

    /// `changeTime` in LDAP generalized time
    pub fn change_time(&self) -> String {
        let millis = i64::try_from(self.record.csn.timestamp()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(millis)
            .unwrap_or_default()
            .format("%Y%m%d%H%M%SZ")
            .to_string()
    }

    /// LDIF body of the `changes` attribute
    pub fn changes(&self) -> Option<String> {
        match &self.record.operation {
            Operation::Add { attributes } => {
                let mut ldif = String::new();
                for attribute in attributes {
                    for value in &attribute.values {
                        ldif.push_str(&format!("{}: {}\n", attribute.name, value));
                    }
                }
                Some(ldif)
            }
            Operation::Modify { modifications } => {
                let mut ldif = String::new();
                for modification in modifications {
                    let op = match modification.kind {
                        ModificationType::Add => "add",
                        ModificationType::Delete => "delete",
                        ModificationType::Replace => "replace",
                        ModificationType::Increment => "increment",
                    };
                    let name = &modification.attribute.name;
                    ldif.push_str(&format!("{op}: {name}\n"));
                    for value in &modification.attribute.values {
                        ldif.push_str(&format!("{name}: {value}\n"));
                    }
                    ldif.push_str("-\n");
                }
                Some(ldif)
            }
            Operation::Delete | Operation::ModifyDn { .. } => None,
        }
    }

    /// Values of a changelog attribute, by lowercased name
    pub fn attribute_values(&self, name: &str) -> Vec<String> {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "objectclass" => vec!["top".into(), "changeLogEntry".into()],
            "changenumber" => self.change_number.map(|n| n.to_string()).into_iter().collect(),
            "targetdn" => vec![self.record.dn.clone()],
            "changetype" => vec![self.change_type().to_string()],
            "changetime" => vec![self.change_time()],
            "replicationcsn" => vec![self.record.csn.to_string()],
            "replicaidentifier" => vec![self.record.csn.replica_id().to_string()],
            "replicadn" => vec![self.base_dn.clone()],
            "targetentryuuid" => vec![self.record.entry_uuid.to_string()],
            "changelogcookie" => vec![self.cookie.to_string()],
            "changes" => self.changes().into_iter().collect(),
            "newrdn" | "deleteoldrdn" | "newsuperior" => match &self.record.operation {
                Operation::ModifyDn {
                    new_rdn,
                    delete_old_rdn,
                    new_superior,
                } => match name.as_str() {
                    "newrdn" => vec![new_rdn.clone()],
                    "deleteoldrdn" => vec![if *delete_old_rdn { "TRUE" } else { "FALSE" }.into()],
                    _ => new_superior.clone().into_iter().collect(),
                },
                _ => Vec::new(),
            },
            other => self
                .entry_attributes
                .iter()
                .filter(|attribute| attribute.is_named(other))
                .flat_map(|attribute| attribute.values.iter().cloned())
                .collect(),
        }
    }
}

/// Changelog attribute names in presentation order
const CHANGELOG_ATTRIBUTES: [&str; 14] = [
    "objectClass",
    "changeNumber",
    "targetDN",
    "changeType",
    "changeTime",
    "replicationCSN",
    "replicaIdentifier",
    "replicaDN",
    "targetEntryUUID",
    "changeLogCookie",
    "changes",
    "newRDN",
    "deleteOldRDN",
    "newSuperior",
];

impl EclEntry {
    /// JSON rendering of the entry, one array of values per attribute
    pub fn to_json(&self) -> Value {
        let mut attributes = Map::new();
        let names = CHANGELOG_ATTRIBUTES
            .iter()
            .copied()
            .chain(self.entry_attributes.iter().map(|a| a.name.as_str()));
        for name in names {
            let values = self.attribute_values(name);
            if !values.is_empty() && !attributes.contains_key(name) {
                attributes.insert(name.to_string(), Value::from(values));
            }
        }
        serde_json::json!({
            "dn": self.dn,
            "attributes": attributes,
        })
    }
}

/// Attributes selected by an include list, `*` selecting all
fn project(attributes: &[Attribute], include: &[String]) -> Vec<Attribute> {
    if include.iter().any(|name| name == "*") {
        return attributes.to_vec();
    }
    attributes
        .iter()
        .filter(|attribute| include.iter().any(|name| attribute.is_named(name)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordFactory;

    #[test]
    fn test_cookie_mode_dn_and_time() {
        let mut factory = RecordFactory::new(3, 1_700_000_000_000);
        let record = factory.add("uid=a,dc=example,dc=com");
        let csn = record.csn;
        let mut cookie = MultiDomainState::new();
        cookie.update("dc=example,dc=com", csn);

        let entry = EclEntry::new("dc=example,dc=com", record, cookie, &[]);
        assert_eq!(
            entry.dn,
            format!("replicationCSN={csn},dc=example,dc=com,cn=changelog")
        );
        assert_eq!(entry.change_time(), "20231114221320Z");
        assert_eq!(entry.attribute_values("changeType"), vec!["add".to_string()]);
        assert_eq!(entry.attribute_values("replicaIdentifier"), vec!["3".to_string()]);
        assert!(entry.attribute_values("changenumber").is_empty());

        let entry = entry.with_change_number(12);
        assert_eq!(entry.dn, "changeNumber=12,cn=changelog");
        assert_eq!(entry.attribute_values("changenumber"), vec!["12".to_string()]);
    }

    #[test]
    fn test_projection() {
        let mut factory = RecordFactory::new(1, 1_000);
        let record = factory.add("uid=a,dc=example,dc=com");

        let none = EclEntry::new("dc=example,dc=com", record.clone(), MultiDomainState::new(), &[]);
        assert!(none.entry_attributes.is_empty());

        let some = EclEntry::new(
            "dc=example,dc=com",
            record.clone(),
            MultiDomainState::new(),
            &["CN".to_string()],
        );
        assert_eq!(some.entry_attributes.len(), 1);
        assert_eq!(some.attribute_values("cn"), vec!["a".to_string()]);

        let all = EclEntry::new("dc=example,dc=com", record, MultiDomainState::new(), &["*".to_string()]);
        assert_eq!(all.entry_attributes.len(), 3);
    }

    #[test]
    fn test_changes_ldif() {
        let mut factory = RecordFactory::new(1, 1_000);
        let entry = EclEntry::new(
            "dc=example,dc=com",
            factory.modify("uid=a,dc=example,dc=com"),
            MultiDomainState::new(),
            &[],
        );
        assert_eq!(
            entry.changes().unwrap(),
            "replace: description\ndescription: modified\n-\n"
        );

        let rename = EclEntry::new(
            "dc=example,dc=com",
            factory.modify_dn("uid=a,dc=example,dc=com", "uid=b"),
            MultiDomainState::new(),
            &[],
        );
        assert!(rename.changes().is_none());
        assert_eq!(rename.attribute_values("newRDN"), vec!["uid=b".to_string()]);
        assert_eq!(rename.change_type(), ChangeType::ModifyDn);
    }

    #[test]
    fn test_json_rendering() {
        let mut factory = RecordFactory::new(2, 1_000);
        let record = factory.delete("uid=a,dc=example,dc=com");
        let entry = EclEntry::new("dc=example,dc=com", record, MultiDomainState::new(), &[])
            .with_change_number(7);

        let json = entry.to_json();
        assert_eq!(json["dn"], "changeNumber=7,cn=changelog");
        let attributes = json["attributes"].as_object().unwrap();
        assert_eq!(attributes["changeType"], serde_json::json!(["delete"]));
        assert_eq!(attributes["changeNumber"], serde_json::json!(["7"]));
        assert!(!attributes.contains_key("changes"));
        assert!(!attributes.contains_key("newRDN"));
    }
}
