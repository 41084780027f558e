//! On-disk record format shared by every backend.
//!
//! ```text
//! Record (bincode, standard config)
//! ┌──────────┬───────────┬──────────────────────────┬──────────┐
//! │ seq: u64 │ time: u64 │ payload: LZ4(prepended)  │ checksum │
//! └──────────┴───────────┴──────────────────────────┴──────────┘
//! ```
//!
//! The checksum is FNV-1a over the document id, the sequence number and the
//! uncompressed payload, so a record copied under the wrong key is rejected
//! as well as a damaged one.

use quire_core::DocumentId;
use serde::{Deserialize, Serialize};

use super::{Snapshot, StoreError, StoreResult, UpdateLogEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    seq: u64,
    timestamp: u64,
    payload: Vec<u8>,
    checksum: u32,
}

/// FNV-1a over the fields that identify a record.
fn compute_checksum(document_id: &DocumentId, seq: u64, payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut mix = |byte: u8| {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    };
    for byte in document_id.as_str().as_bytes() {
        mix(*byte);
    }
    for byte in seq.to_le_bytes() {
        mix(byte);
    }
    for byte in payload {
        mix(*byte);
    }
    hash
}

fn encode(document_id: &DocumentId, seq: u64, timestamp: u64, data: &[u8]) -> StoreResult<Vec<u8>> {
    let record = Record {
        seq,
        timestamp,
        payload: lz4_flex::compress_prepend_size(data),
        checksum: compute_checksum(document_id, seq, data),
    };
    bincode::serde::encode_to_vec(&record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode and verify. Returns `(seq, timestamp, data)`.
fn decode(document_id: &DocumentId, bytes: &[u8]) -> Result<(u64, u64, Vec<u8>), String> {
    let (record, _): (Record, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| format!("undecodable record: {e}"))?;
    let data = lz4_flex::decompress_size_prepended(&record.payload)
        .map_err(|e| format!("decompression failed: {e}"))?;
    if compute_checksum(document_id, record.seq, &data) != record.checksum {
        return Err("checksum mismatch".to_string());
    }
    Ok((record.seq, record.timestamp, data))
}

pub fn encode_entry(entry: &UpdateLogEntry) -> StoreResult<Vec<u8>> {
    encode(&entry.document_id, entry.seq, entry.recorded_at, &entry.data)
}

/// Decode the log entry stored under `(document_id, seq)`.
pub fn decode_entry(document_id: &DocumentId, seq: u64, bytes: &[u8]) -> StoreResult<UpdateLogEntry> {
    let (stored_seq, recorded_at, data) =
        decode(document_id, bytes).map_err(|reason| StoreError::Corrupt { seq, reason })?;
    if stored_seq != seq {
        return Err(StoreError::Corrupt {
            seq,
            reason: format!("record carries seq {stored_seq}"),
        });
    }
    Ok(UpdateLogEntry {
        document_id: document_id.clone(),
        seq,
        data,
        recorded_at,
    })
}

pub fn encode_snapshot(snapshot: &Snapshot) -> StoreResult<Vec<u8>> {
    encode(
        &snapshot.document_id,
        snapshot.covered_seq,
        snapshot.created_at,
        &snapshot.data,
    )
}

pub fn decode_snapshot(document_id: &DocumentId, bytes: &[u8]) -> StoreResult<Snapshot> {
    let (covered_seq, created_at, data) =
        decode(document_id, bytes).map_err(StoreError::CorruptSnapshot)?;
    Ok(Snapshot {
        document_id: document_id.clone(),
        data,
        covered_seq,
        created_at,
    })
}
