//! Node Protocol
//!
//! Structured messages exchanged with data nodes and the transaction
//! manager. Every write carries its version stamp alongside the value
//! instead of packing both into one token.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::version::VersionStamp;

/// A value together with the stamp it was written with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub version: VersionStamp,
}

/// Requests sent to data nodes and the transaction manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    // ========== Data Writes ==========
    /// Unconditional write
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        version: VersionStamp,
        transaction: Option<String>,
    },

    /// Write only if the key does not exist
    SetIfAbsent {
        key: Vec<u8>,
        value: Vec<u8>,
        version: VersionStamp,
        transaction: Option<String>,
    },

    /// Write only if the stored stamp equals `expected`
    SetIfVersion {
        key: Vec<u8>,
        value: Vec<u8>,
        version: VersionStamp,
        expected: VersionStamp,
        transaction: Option<String>,
    },

    /// Delete a key
    Remove {
        key: Vec<u8>,
        transaction: Option<String>,
    },

    /// Add `key` to the key list stored under `tag`
    AppendTagKey {
        tag: Vec<u8>,
        key: Vec<u8>,
        version: VersionStamp,
        transaction: Option<String>,
    },

    /// Drop `key` from the key list stored under `tag`
    RemoveTagKey {
        tag: Vec<u8>,
        key: Vec<u8>,
        transaction: Option<String>,
    },

    /// Add `delta` to a numeric value, store the result under `version` and
    /// return it
    Calc {
        key: Vec<u8>,
        delta: i64,
        version: VersionStamp,
        transaction: Option<String>,
    },

    /// Evaluate `script` against the stored value; the node may store a
    /// modified value under `version`
    GetScriptForUpdate {
        key: Vec<u8>,
        script: String,
        version: VersionStamp,
        transaction: Option<String>,
    },

    // ========== Data Reads ==========
    /// Read a key
    Get { key: Vec<u8> },

    /// Evaluate `script` against the stored value without modifying it
    GetScript { key: Vec<u8>, script: String },

    /// Read the key list stored under a tag
    GetTagKeys { tag: Vec<u8> },

    // ========== Locks ==========
    /// Acquire a lock, waiting up to `wait_secs`; `hold_secs = 0` holds forever
    Lock {
        key: Vec<u8>,
        transaction: String,
        hold_secs: u64,
        wait_secs: u64,
    },

    /// Release a lock held by `transaction`
    Unlock { key: Vec<u8>, transaction: String },

    /// Current lock holder of a key
    LockOwner { key: Vec<u8> },

    // ========== Health ==========
    Ping,
}

impl NodeRequest {
    /// Short name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeRequest::Set { .. } => "Set",
            NodeRequest::SetIfAbsent { .. } => "SetIfAbsent",
            NodeRequest::SetIfVersion { .. } => "SetIfVersion",
            NodeRequest::Remove { .. } => "Remove",
            NodeRequest::AppendTagKey { .. } => "AppendTagKey",
            NodeRequest::RemoveTagKey { .. } => "RemoveTagKey",
            NodeRequest::Calc { .. } => "Calc",
            NodeRequest::GetScriptForUpdate { .. } => "GetScriptForUpdate",
            NodeRequest::Get { .. } => "Get",
            NodeRequest::GetScript { .. } => "GetScript",
            NodeRequest::GetTagKeys { .. } => "GetTagKeys",
            NodeRequest::Lock { .. } => "Lock",
            NodeRequest::Unlock { .. } => "Unlock",
            NodeRequest::LockOwner { .. } => "LockOwner",
            NodeRequest::Ping => "Ping",
        }
    }

    /// Turn a conditional write into the unconditional write replicas receive
    /// once the conditional one has succeeded elsewhere
    pub fn unconditional(&self) -> NodeRequest {
        match self {
            NodeRequest::SetIfAbsent { key, value, version, transaction }
            | NodeRequest::SetIfVersion { key, value, version, transaction, .. } => NodeRequest::Set {
                key: key.clone(),
                value: value.clone(),
                version: *version,
                transaction: transaction.clone(),
            },
            other => other.clone(),
        }
    }
}

/// Node answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeResponse {
    /// Write applied
    Stored,
    /// Read result
    Value(StoredValue),
    /// Tag key list
    Keys(Vec<Vec<u8>>),
    /// Removal result; `None` when nothing was stored
    Removed(Option<StoredValue>),
    /// Result of a calculation
    Calculated(i64),
    /// Key or tag not present
    NotFound,
    /// The node refused the request
    Rejected { reason: String },
    LockGranted,
    LockReleased,
    LockHolder(Option<String>),
    Pong,
}

impl NodeResponse {
    /// Short name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeResponse::Stored => "Stored",
            NodeResponse::Value(_) => "Value",
            NodeResponse::Keys(_) => "Keys",
            NodeResponse::Removed(_) => "Removed",
            NodeResponse::Calculated(_) => "Calculated",
            NodeResponse::NotFound => "NotFound",
            NodeResponse::Rejected { .. } => "Rejected",
            NodeResponse::LockGranted => "LockGranted",
            NodeResponse::LockReleased => "LockReleased",
            NodeResponse::LockHolder(_) => "LockHolder",
            NodeResponse::Pong => "Pong",
        }
    }
}

/// Wire wrapper; `reply = false` tells the node not to answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEnvelope {
    pub reply: bool,
    pub request: NodeRequest,
}

/// Serialize any protocol value with bincode
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize any protocol value with bincode
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Frame header for length-prefixed, checksummed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// CRC32 of the body
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_BODY: u32 = 64 * 1024 * 1024;

    /// Create a header for `data`
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Whether `body` matches this header
    pub fn verify(&self, body: &[u8]) -> bool {
        body.len() == self.length as usize && crc32fast::hash(body) == self.checksum
    }
}
