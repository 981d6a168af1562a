//! Change Sequence Numbers and their per-replica generator
//!
//! A CSN is `(timestamp, seq, replica_id)`. The derived ordering compares the
//! fields in declaration order, which gives the total order used everywhere in
//! the change log: wall-clock milliseconds, then the sequence counter, then the
//! replica identifier as a deterministic tie-break.

use crate::state::ReplicaStateVector;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Replica (server) identifier inside a replication topology
pub type ReplicaId = u16;

/// Change Sequence Number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    // Field order is the comparison order.
    timestamp: u64,
    seq: u32,
    replica_id: ReplicaId,
}

impl Csn {
    /// Length of the binary key form
    pub const KEY_LEN: usize = 14;

    /// Length of the textual form
    pub const TEXT_LEN: usize = 28;

    /// Smallest possible CSN
    pub const MIN: Csn = Csn::new(0, 0, 0);

    /// Create a CSN from its parts
    pub const fn new(timestamp: u64, seq: u32, replica_id: ReplicaId) -> Self {
        Self {
            timestamp,
            seq,
            replica_id,
        }
    }

    /// Wall-clock milliseconds since the Unix epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Sequence counter within the millisecond
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Originating replica
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Lowest CSN carrying the given timestamp, used as a purge boundary
    pub fn at_timestamp(timestamp: u64) -> Self {
        Self::new(timestamp, 0, 0)
    }

    /// Big-endian key whose byte order matches CSN order
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        key[8..12].copy_from_slice(&self.seq.to_be_bytes());
        key[12..].copy_from_slice(&self.replica_id.to_be_bytes());
        key
    }

    /// Decode a key produced by [`Csn::to_key`]
    pub fn from_key(key: &[u8]) -> Result<Self> {
        let key: [u8; Self::KEY_LEN] = key
            .try_into()
            .map_err(|_| Error::InvalidCsn(format!("key length {} != 14", key.len())))?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&key[..8]);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&key[8..12]);
        let mut rid = [0u8; 2];
        rid.copy_from_slice(&key[12..]);
        Ok(Self::new(
            u64::from_be_bytes(ts),
            u32::from_be_bytes(seq),
            u16::from_be_bytes(rid),
        ))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{:04x}",
            self.timestamp, self.seq, self.replica_id
        )
    }
}

impl FromStr for Csn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != Self::TEXT_LEN || !s.is_ascii() {
            return Err(Error::InvalidCsn(format!(
                "'{s}' is not {} hex digits",
                Self::TEXT_LEN
            )));
        }
        let invalid = |_| Error::InvalidCsn(format!("'{s}' is not hexadecimal"));
        let timestamp = u64::from_str_radix(&s[..16], 16).map_err(invalid)?;
        let seq = u32::from_str_radix(&s[16..24], 16).map_err(invalid)?;
        let replica_id = u16::from_str_radix(&s[24..], 16).map_err(invalid)?;
        Ok(Self::new(timestamp, seq, replica_id))
    }
}

/// Source of wall-clock time for CSN generation
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// The operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }
}

/// Generates strictly increasing CSNs for a single replica
///
/// One generator belongs to one replica process and is passed explicitly to
/// whoever needs to stamp changes (the write path, the heartbeat task).
#[derive(Debug)]
pub struct CsnGenerator<C: Clock = SystemClock> {
    replica_id: ReplicaId,
    clock: C,
    last_timestamp: u64,
    seq: u32,
}

impl CsnGenerator<SystemClock> {
    /// Create a generator driven by the system clock
    pub fn new(replica_id: ReplicaId) -> Self {
        Self::with_clock(replica_id, SystemClock)
    }
}

impl<C: Clock> CsnGenerator<C> {
    /// Create a generator driven by the given clock
    pub fn with_clock(replica_id: ReplicaId, clock: C) -> Self {
        Self {
            replica_id,
            clock,
            last_timestamp: 0,
            seq: 0,
        }
    }

    /// Replica this generator stamps changes for
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Issue the next CSN
    pub fn next(&mut self) -> Csn {
        let now = self.clock.now_millis();
        if now <= self.last_timestamp {
            // Clock stalled or went backwards: stay on the baseline.
            if self.seq == u32::MAX {
                self.last_timestamp += 1;
                self.seq = 0;
            } else {
                self.seq += 1;
            }
        } else {
            self.last_timestamp = now;
            self.seq = 0;
        }
        Csn::new(self.last_timestamp, self.seq, self.replica_id)
    }

    /// Move the baseline past a CSN observed from a peer
    pub fn adjust(&mut self, seen: &Csn) {
        if seen.timestamp() > self.last_timestamp {
            tracing::debug!(
                replica_id = self.replica_id,
                ahead_ms = seen.timestamp() - self.last_timestamp,
                "adjusting CSN baseline to peer time"
            );
            self.last_timestamp = seen.timestamp();
            self.seq = seen.seq();
        } else if seen.timestamp() == self.last_timestamp && seen.seq() > self.seq {
            self.seq = seen.seq();
        }
    }

    /// Adjust past every CSN of a state vector
    pub fn adjust_to_state(&mut self, state: &ReplicaStateVector) {
        for csn in state.csns() {
            self.adjust(&csn);
        }
    }
}
