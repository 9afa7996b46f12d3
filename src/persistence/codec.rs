//! Binary snapshot format.
//!
//! ```text
//! +--------+---------+-----------+------------------+
//! | magic  | version | crc32 (4) | msgpack body ... |
//! | SNP\0  |   u8    |    LE     |                  |
//! +--------+---------+-----------+------------------+
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::types::Timestamp;

const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 4;

/// Persisted subset of the state tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: Timestamp,
    pub namespaces: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new(namespaces: BTreeMap<String, Value>, saved_at: Timestamp) -> Self {
        Self {
            saved_at,
            namespaces,
        }
    }

    /// SHA-256 of the namespace contents, ignoring `saved_at`.
    pub fn content_hash(&self) -> Result<String> {
        let body = serde_json::to_vec(&self.namespaces)?;
        Ok(hex::encode(Sha256::digest(&body)))
    }
}

pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(snapshot)?;
    let checksum = crc32fast::hash(&body);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(SyncError::InvalidFormat("Snapshot truncated".into()));
    }
    if &bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(SyncError::InvalidFormat("Invalid snapshot magic".into()));
    }
    if bytes[4] != SNAPSHOT_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            bytes[4]
        )));
    }

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&bytes[5..9]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let body = &bytes[HEADER_LEN..];
    let computed_checksum = crc32fast::hash(body);
    if stored_checksum != computed_checksum {
        return Err(SyncError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    Ok(rmp_serde::from_slice(body)?)
}
