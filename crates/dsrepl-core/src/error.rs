//! Error types for the replication core

use crate::csn::Csn;
use thiserror::Error;

/// Result type alias using the replication Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for replication and the external changelog
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage or transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Encoding or decoding of a stored value or wire frame failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A CSN could not be parsed from its textual or binary form
    #[error("Invalid CSN: {0}")]
    InvalidCsn(String),

    /// An ECL search filter could not be parsed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Append violates per-replica CSN monotonicity
    #[error("Out of order change {csn} in {domain}: last appended for this replica is {last}")]
    OutOfOrder {
        /// Replicated base DN
        domain: String,
        /// Rejected CSN
        csn: Csn,
        /// Newest CSN already appended for the same replica
        last: Csn,
    },

    /// Two different changes carry the same CSN
    #[error("CSN collision in {domain}: {csn} is already present")]
    CsnCollision {
        /// Replicated base DN
        domain: String,
        /// Colliding CSN
        csn: Csn,
    },

    /// No window credit left on a replica link
    #[error("Window exhausted: {window} unacknowledged messages in flight")]
    WindowExhausted {
        /// Negotiated window size
        window: usize,
    },

    /// Replica generation ID does not match the domain
    #[error("Generation ID mismatch in {domain}: domain has {expected:?}, replica has {actual:?}")]
    GenerationMismatch {
        /// Replicated base DN
        domain: String,
        /// Domain generation ID
        expected: Option<u64>,
        /// Generation ID presented by the replica
        actual: Option<u64>,
    },

    /// A cookie could not be parsed or references an unusable domain
    #[error("Malformed cookie at domain '{domain}': {reason}")]
    MalformedCookie {
        /// Offending domain token
        domain: String,
        /// Why the token was rejected
        reason: String,
    },

    /// The cookie points before the oldest retained change
    #[error("Cookie state for {domain} is no longer available in the changelog")]
    StateNoLongerAvailable {
        /// Replicated base DN
        domain: String,
    },

    /// The requested draft change number was issued and has since been purged
    #[error("Change number {number} has been purged (first available: {first:?})")]
    ChangeNumberPurged {
        /// Requested change number
        number: u64,
        /// First change number still available
        first: Option<u64>,
    },

    /// Transport-level disconnection of a replica link
    #[error("Replica link disconnected")]
    LinkDisconnected,

    /// Domain is not replicated by this server
    #[error("Unknown replicated domain: {0}")]
    UnknownDomain(String),

    /// Another link with the same replica ID is already connected
    #[error("Replica {replica_id} is already connected to {domain}")]
    DuplicateReplica {
        /// Replicated base DN
        domain: String,
        /// Replica identifier
        replica_id: u16,
    },

    /// Persistent search slots are all in use
    #[error("Too many ECL subscribers (max {max})")]
    TooManySubscribers {
        /// Configured maximum
        max: usize,
    },

    /// A caller-supplied timeout elapsed
    #[error("Operation timed out")]
    Timeout,

    /// Generic replication failure
    #[error("Replication error: {0}")]
    Replication(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a malformed cookie error
    pub fn malformed_cookie(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedCookie {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WindowExhausted { .. } | Self::Timeout | Self::LinkDisconnected
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
