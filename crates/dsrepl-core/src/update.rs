//! Update records: the replicated unit of change
//!
//! A record is produced by the directory server once an operation has been
//! committed locally, stamped with the CSN the operation was assigned, and
//! never mutated afterwards.

use crate::csn::Csn;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Attribute with its values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute type name
    pub name: String,
    /// Values, possibly empty for a delete-all modification
    pub values: Vec<String>,
}

impl Attribute {
    /// Create an attribute
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Case-insensitive attribute name comparison
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Kind of attribute modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationType {
    /// Add values
    Add,
    /// Delete values (all when none are listed)
    Delete,
    /// Replace all values
    Replace,
    /// Increment an integer value
    Increment,
}

impl fmt::Display for ModificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Increment => "increment",
        })
    }
}

/// One modification of a modify operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What to do
    pub kind: ModificationType,
    /// Which attribute and values
    pub attribute: Attribute,
}

impl Modification {
    /// Create a modification
    pub fn new(kind: ModificationType, attribute: Attribute) -> Self {
        Self { kind, attribute }
    }
}

/// Operation-specific payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Entry creation
    Add {
        /// Attributes of the new entry
        attributes: Vec<Attribute>,
    },
    /// Entry removal
    Delete,
    /// Attribute changes
    Modify {
        /// Ordered modifications
        modifications: Vec<Modification>,
    },
    /// Rename and/or move
    ModifyDn {
        /// New RDN
        new_rdn: String,
        /// Whether the old RDN values are removed
        delete_old_rdn: bool,
        /// New parent DN when moving
        new_superior: Option<String>,
    },
}

impl Operation {
    /// ECL change type of this operation
    pub fn change_type(&self) -> ChangeType {
        match self {
            Self::Add { .. } => ChangeType::Add,
            Self::Delete => ChangeType::Delete,
            Self::Modify { .. } => ChangeType::Modify,
            Self::ModifyDn { .. } => ChangeType::ModifyDn,
        }
    }
}

/// Change type as exposed by the changelog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// add
    Add,
    /// delete
    Delete,
    /// modify
    Modify,
    /// modrdn
    ModifyDn,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Modify => "modify",
            Self::ModifyDn => "modrdn",
        })
    }
}

/// A committed directory change tagged with its CSN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Change Sequence Number assigned by the originating replica
    pub csn: Csn,
    /// Stable identifier of the target entry
    pub entry_uuid: Uuid,
    /// Target DN at the time of the change
    pub dn: String,
    /// What happened
    pub operation: Operation,
    /// Original-entry attributes attached for changelog projection
    pub entry_attributes: Vec<Attribute>,
}

impl UpdateRecord {
    /// Create a record
    pub fn new(csn: Csn, entry_uuid: Uuid, dn: impl Into<String>, operation: Operation) -> Self {
        Self {
            csn,
            entry_uuid,
            dn: dn.into(),
            operation,
            entry_attributes: Vec::new(),
        }
    }

    /// Add record
    pub fn add(csn: Csn, entry_uuid: Uuid, dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self::new(csn, entry_uuid, dn, Operation::Add { attributes })
    }

    /// Delete record
    pub fn delete(csn: Csn, entry_uuid: Uuid, dn: impl Into<String>) -> Self {
        Self::new(csn, entry_uuid, dn, Operation::Delete)
    }

    /// Modify record
    pub fn modify(
        csn: Csn,
        entry_uuid: Uuid,
        dn: impl Into<String>,
        modifications: Vec<Modification>,
    ) -> Self {
        Self::new(csn, entry_uuid, dn, Operation::Modify { modifications })
    }

    /// Modify-DN record
    pub fn modify_dn(
        csn: Csn,
        entry_uuid: Uuid,
        dn: impl Into<String>,
        new_rdn: impl Into<String>,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    ) -> Self {
        Self::new(
            csn,
            entry_uuid,
            dn,
            Operation::ModifyDn {
                new_rdn: new_rdn.into(),
                delete_old_rdn,
                new_superior,
            },
        )
    }

    /// Attach the original-entry attribute snapshot
    pub fn with_entry_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.entry_attributes = attributes;
        self
    }

    /// Changelog change type
    pub fn change_type(&self) -> ChangeType {
        self.operation.change_type()
    }
}
