//! dsrepl Core - Multi-master Directory Replication Engine
//!
//! This crate provides the replication core of a directory server:
//! - Change Sequence Numbers (CSN) and their per-replica generator
//! - Replica state vectors and the multi-domain ECL cookie
//! - Durable per-domain change logs on LMDB, with retention purge
//! - Replication domain coordinators (generation IDs, degraded links,
//!   eligibility, heartbeats, full-content reinitialization routing)
//! - Flow-controlled replica links, in-process or over TCP
//! - The External Changelog (cookie mode, draft change numbers, persistent search)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        External Changelog (ECL)             │
//! │  (Cookie mode, Draft numbers, Persistent)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │          Replication Server                 │
//! │   (Domains, Replica Links, Transport)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Storage Layer                    │
//! │  (Change Log Stores, Draft Number Index)    │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cookie;
pub mod csn;
pub mod ecl;
pub mod error;
pub mod generation;
pub mod replication;
pub mod state;
pub mod storage;
pub mod testing;
pub mod update;

pub use cookie::MultiDomainState;
pub use csn::{Clock, Csn, CsnGenerator, ReplicaId, SystemClock};
pub use ecl::{EclEntry, ExternalChangelog, Filter, PersistentSearch};
pub use error::{Error, Result};
pub use replication::{Handshake, ReplicaLink, ReplicationServer, ReplicationServerConfig};
pub use state::ReplicaStateVector;
pub use update::{Operation, UpdateRecord};
