//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4 LE][payload:N][crc32:4 LE]
//!
//! The CRC covers type, length and payload.

use crate::csn::{Csn, ReplicaId};
use crate::state::ReplicaStateVector;
use crate::update::UpdateRecord;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Type byte + length
const HEADER_LEN: usize = 5;
/// Trailing CRC32
const CRC_LEN: usize = 4;

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Handshake from a replica
    Hello = 0x01,
    /// Handshake response from the server
    Welcome = 0x02,
    /// Replicated change
    Update = 0x10,
    /// Idle-replica clock advance
    Heartbeat = 0x11,
    /// Link status change
    Status = 0x12,
    /// Full-content initialization request
    InitializeRequest = 0x20,
    /// Start of a full-content export
    InitializeTarget = 0x21,
    /// One exported entry
    Entry = 0x22,
    /// End of a full-content export
    Done = 0x23,
    /// Orderly session end
    Stop = 0x30,
    /// Error notification
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x10 => Ok(Self::Update),
            0x11 => Ok(Self::Heartbeat),
            0x12 => Ok(Self::Status),
            0x20 => Ok(Self::InitializeRequest),
            0x21 => Ok(Self::InitializeTarget),
            0x22 => Ok(Self::Entry),
            0x23 => Ok(Self::Done),
            0x30 => Ok(Self::Stop),
            0xFF => Ok(Self::Error),
            _ => Err(Error::protocol(format!("Unknown message type: {value:#04x}"))),
        }
    }
}

/// What is on the other end of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    /// A directory server replicating the domain
    DirectoryServer,
    /// A changelog consumer that only reads
    ChangelogReader,
}

/// Replication status of a link inside its domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStatus {
    /// Exchanging updates
    Active,
    /// Generation ID mismatch; receives errors only until reinitialized
    Degraded,
    /// Gone
    Disconnected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Machine-readable error classes carried by error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Generation ID does not match the domain
    GenerationMismatch,
    /// Update older than the replica's previous one
    OutOfOrder,
    /// Two changes with one CSN
    CsnCollision,
    /// Replica ID already connected
    DuplicateReplica,
    /// Domain not replicated here
    UnknownDomain,
    /// Unexpected message
    Protocol,
    /// Server-side failure
    Internal,
}

/// Destination of a full-content initialization message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingTarget {
    /// One replica
    Replica(ReplicaId),
    /// Every other directory server of the domain
    AllServers,
}

impl RoutingTarget {
    /// Whether `replica_id` is addressed, excluding the sender
    pub fn includes(&self, replica_id: ReplicaId, source: ReplicaId) -> bool {
        match self {
            Self::Replica(target) => *target == replica_id,
            Self::AllServers => replica_id != source,
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Handshake from a replica
    Hello {
        /// Replicated base DN
        base_dn: String,
        /// Replica identifier
        replica_id: ReplicaId,
        /// Replica's generation ID, if it has data
        generation_id: Option<u64>,
        /// Replica's own state vector
        state: ReplicaStateVector,
        /// Requested window, or the server default
        window: Option<u32>,
        /// Protocol version spoken by the replica
        protocol_version: u32,
        /// Kind of link
        kind: LinkKind,
    },

    /// Handshake answer
    Welcome {
        /// Replication server identifier
        server_id: ReplicaId,
        /// Domain generation ID
        generation_id: Option<u64>,
        /// Domain state vector
        state: ReplicaStateVector,
        /// Negotiated window
        window: u32,
        /// Initial link status
        status: LinkStatus,
    },

    /// Replicated change
    Update {
        /// The change
        record: UpdateRecord,
    },

    /// Clock advance from an idle replica
    Heartbeat {
        /// Heartbeat CSN
        csn: Csn,
    },

    /// Link status change
    Status {
        /// New status
        status: LinkStatus,
    },

    /// Error notification
    Error {
        /// Error class
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },

    /// Ask `target` to export its content to `source`
    InitializeRequest {
        /// Requesting replica
        source: ReplicaId,
        /// Replica that should export
        target: ReplicaId,
    },

    /// Announces an export from `source`
    InitializeTarget {
        /// Exporting replica
        source: ReplicaId,
        /// Importing replica(s)
        target: RoutingTarget,
        /// Number of entries that follow
        entry_count: u64,
        /// Generation ID of the exported data
        generation_id: u64,
        /// Reset the domain generation ID to the exported one
        reset_generation: bool,
    },

    /// One exported entry
    Entry {
        /// Exporting replica
        source: ReplicaId,
        /// Importing replica(s)
        target: RoutingTarget,
        /// Serialized entry
        data: Vec<u8>,
    },

    /// End of an export
    Done {
        /// Exporting replica
        source: ReplicaId,
        /// Importing replica(s)
        target: RoutingTarget,
    },

    /// Orderly session end
    Stop,
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Hello { .. } => ReplicationMessageType::Hello,
            Self::Welcome { .. } => ReplicationMessageType::Welcome,
            Self::Update { .. } => ReplicationMessageType::Update,
            Self::Heartbeat { .. } => ReplicationMessageType::Heartbeat,
            Self::Status { .. } => ReplicationMessageType::Status,
            Self::Error { .. } => ReplicationMessageType::Error,
            Self::InitializeRequest { .. } => ReplicationMessageType::InitializeRequest,
            Self::InitializeTarget { .. } => ReplicationMessageType::InitializeTarget,
            Self::Entry { .. } => ReplicationMessageType::Entry,
            Self::Done { .. } => ReplicationMessageType::Done,
            Self::Stop => ReplicationMessageType::Stop,
        }
    }

    /// Whether this is part of a full-content initialization
    pub fn is_total_update(&self) -> bool {
        matches!(
            self,
            Self::InitializeRequest { .. }
                | Self::InitializeTarget { .. }
                | Self::Entry { .. }
                | Self::Done { .. }
        )
    }

    /// Error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::serialization(format!("Serialization failed: {e}")))?;
        let length = u32::try_from(payload.len())
            .map_err(|_| Error::protocol(format!("payload of {} bytes", payload.len())))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode one complete frame
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::protocol("Message too short"));
        }

        let crc_offset = buf.len() - CRC_LEN;
        let stored_crc = read_u32_le(&buf[crc_offset..]);
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {stored_crc:x}, got {computed_crc:x}"
            )));
        }

        let length = read_u32_le(&buf[1..HEADER_LEN]) as usize;
        if buf.len() != HEADER_LEN + length + CRC_LEN {
            return Err(Error::protocol(format!(
                "Length mismatch: header says {length}, frame carries {}",
                crc_offset - HEADER_LEN
            )));
        }

        let message_type = ReplicationMessageType::try_from(buf[0])?;
        let message: Self = bincode::deserialize(&buf[HEADER_LEN..crc_offset])
            .map_err(|e| Error::serialization(format!("Deserialization failed: {e}")))?;
        if message.message_type() != message_type {
            return Err(Error::protocol(format!(
                "Type byte {message_type:?} does not match payload {:?}",
                message.message_type()
            )));
        }
        Ok(message)
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

/// Frame codec for `tokio_util::codec::Framed`
#[derive(Debug, Clone)]
pub struct ReplicationCodec {
    max_frame_bytes: usize,
}

impl ReplicationCodec {
    /// Codec refusing payloads above `max_frame_bytes`
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for ReplicationCodec {
    type Item = ReplicationMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = read_u32_le(&src[1..HEADER_LEN]) as usize;
        if length > self.max_frame_bytes {
            tracing::error!(length, max = self.max_frame_bytes, "Replication frame too large");
            return Err(Error::protocol(format!(
                "Frame of {length} bytes exceeds limit {}",
                self.max_frame_bytes
            )));
        }
        let frame_len = HEADER_LEN + length + CRC_LEN;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(frame_len);
        ReplicationMessage::decode(frame.chunk()).map(Some)
    }
}

impl Encoder<ReplicationMessage> for ReplicationCodec {
    type Error = Error;

    fn encode(&mut self, msg: ReplicationMessage, dst: &mut BytesMut) -> Result<()> {
        let buf = msg.encode()?;
        if buf.len() - HEADER_LEN - CRC_LEN > self.max_frame_bytes {
            return Err(Error::protocol(format!(
                "Refusing to send {} byte frame (limit {})",
                buf.len(),
                self.max_frame_bytes
            )));
        }
        dst.extend_from_slice(&buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordFactory;

    #[test]
    fn test_message_encode_decode() {
        let msg = ReplicationMessage::Heartbeat {
            csn: Csn::new(1234567890, 0, 3),
        };
        let decoded = ReplicationMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_hello_message() {
        let msg = ReplicationMessage::Hello {
            base_dn: "dc=example,dc=com".into(),
            replica_id: 3,
            generation_id: Some(48),
            state: [Csn::new(5, 0, 3)].into_iter().collect(),
            window: Some(10),
            protocol_version: PROTOCOL_VERSION,
            kind: LinkKind::DirectoryServer,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], ReplicationMessageType::Hello as u8);
        assert_eq!(ReplicationMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_crc_validation() {
        let msg = ReplicationMessage::Status {
            status: LinkStatus::Degraded,
        };
        let mut encoded = msg.encode().unwrap();
        encoded[5] ^= 0xFF;
        let err = ReplicationMessage::decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_truncated_frame() {
        assert!(ReplicationMessage::decode(&[0x01, 0, 0]).is_err());
        let encoded = ReplicationMessage::Stop.encode().unwrap();
        assert!(ReplicationMessage::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_codec_handles_partial_frames() {
        let mut factory = RecordFactory::new(1, 1_000);
        let first = ReplicationMessage::Update {
            record: factory.add("uid=a,o=test"),
        };
        let second = ReplicationMessage::Done {
            source: 1,
            target: RoutingTarget::AllServers,
        };

        let mut codec = ReplicationCodec::new(1024 * 1024);
        let mut wire = BytesMut::new();
        codec.encode(first.clone(), &mut wire).unwrap();
        codec.encode(second.clone(), &mut wire).unwrap();

        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        // feed three bytes at a time
        while !wire.is_empty() {
            let n = wire.len().min(3);
            src.extend_from_slice(&wire.split_to(n));
            while let Some(msg) = codec.decode(&mut src).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = ReplicationCodec::new(16);
        let mut src = BytesMut::new();
        src.extend_from_slice(&[ReplicationMessageType::Entry as u8]);
        src.extend_from_slice(&1_000u32.to_le_bytes());
        assert!(matches!(codec.decode(&mut src), Err(Error::Protocol(_))));

        let msg = ReplicationMessage::Entry {
            source: 1,
            target: RoutingTarget::Replica(2),
            data: vec![0u8; 64],
        };
        assert!(codec.encode(msg, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_routing_target() {
        assert!(RoutingTarget::Replica(2).includes(2, 1));
        assert!(!RoutingTarget::Replica(2).includes(3, 1));
        assert!(RoutingTarget::AllServers.includes(3, 1));
        assert!(!RoutingTarget::AllServers.includes(1, 1));
    }
}
