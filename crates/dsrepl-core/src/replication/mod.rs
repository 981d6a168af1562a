//! Replication server side of the directory replication core
//!
//! Directory servers connect to the replication server over replica links,
//! one link per replicated domain. Every domain has a coordinator that stores
//! incoming changes in its change log and forwards them to the other links.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   Update/Heartbeat   ┌──────────────────────────────┐
//! │  DS replica 1│ ───────────────────► │  ReplicationDomain (per DN)  │
//! └──────────────┘ ◄─────────────────── │   - generation ID            │
//!                      forwarded        │   - link status/ack state    │
//! ┌──────────────┐                      │   - ChangeLogStore (LMDB)    │
//! │  DS replica 2│ ◄──────────────────► └──────────────┬───────────────┘
//! └──────────────┘                                     │ eligible changes
//!                                                      ▼
//!                                       ┌──────────────────────────────┐
//!                                       │  ExternalChangelog (cookie / │
//!                                       │  draft change numbers)       │
//!                                       └──────────────────────────────┘
//! ```
//!
//! # Link states
//!
//! - **Active**: generation ID matches, the link sends and receives changes
//! - **Degraded**: generation ID mismatch, only error notifications flow
//!   until the replica is reinitialized with a full-content transfer
//! - **Disconnected**: closed or silent for longer than the liveness timeout
//!
//! # Wire Protocol
//!
//! All messages use bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

pub mod client;
pub mod config;
pub mod domain;
mod handler;
pub mod link;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ReplicaClient, ReplicaClientConfig};
pub use config::{DomainConfig, EligibilityPolicy, ReplicationServerConfig};
pub use domain::{Eligibility, LinkId, LinkInfo, ReplicationDomain};
pub use link::{Handshake, LinkGuard, LinkReceiver, LinkSender, ReplicaLink, Welcome};
pub use protocol::{
    ErrorCode, LinkKind, LinkStatus, ReplicationCodec, ReplicationMessage, ReplicationMessageType,
    RoutingTarget,
};
pub use server::{DomainPurge, ReplicationServer};

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 8989;
