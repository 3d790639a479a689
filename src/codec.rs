//! Versioned rkyv codec for stored records.
//!
//! Every stored value carries a single leading version byte so schemas can
//! evolve without guessing at bytes. Decoding validates the archive up
//! front and returns an owned value, since callers mutate records on every
//! state transition.

use rkyv::{AlignedVec, Deserialize as RkyvDeserialize};

use crate::batch::BatchRecord;
use crate::ledger::IdempotencyRecord;
use crate::task::TaskRecord;

/// Error type for versioned codec operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Data is too short to contain a version header
    #[error("data too short to contain version header")]
    TooShort,
    /// Version byte doesn't match expected version
    #[error("unsupported version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: u8, found: u8 },
    /// Underlying rkyv serialization/deserialization error
    #[error("rkyv error: {0}")]
    Rkyv(String),
}

// Version constants for each serializable type.
// When evolving schemas, bump these and add migration logic in the decode functions.

/// Version for TaskRecord serialization format
pub const TASK_RECORD_VERSION: u8 = 1;
/// Version for IdempotencyRecord serialization format
pub const IDEMPOTENCY_RECORD_VERSION: u8 = 1;
/// Version for BatchRecord serialization format
pub const BATCH_RECORD_VERSION: u8 = 1;

/// Size of the version header - just a single byte.
/// Alignment is handled at decode time by copying into an AlignedVec.
const VERSION_HEADER_SIZE: usize = 1;

/// Prepend a single version byte to the rkyv-serialized data.
#[inline]
fn prepend_version(version: u8, data: AlignedVec) -> Vec<u8> {
    let mut result = Vec::with_capacity(VERSION_HEADER_SIZE + data.len());
    result.push(version);
    result.extend_from_slice(&data);
    result
}

/// Strip the version byte and return the remaining data, validating the version matches.
/// Copies into an AlignedVec to ensure proper alignment for rkyv deserialization.
#[inline]
fn strip_version(expected: u8, data: &[u8]) -> Result<AlignedVec, CodecError> {
    if data.len() < VERSION_HEADER_SIZE {
        return Err(CodecError::TooShort);
    }
    let found = data[0];
    if found != expected {
        return Err(CodecError::UnsupportedVersion { expected, found });
    }
    // Copy into an AlignedVec to ensure proper alignment for rkyv
    let rkyv_data = &data[VERSION_HEADER_SIZE..];
    let mut aligned = AlignedVec::with_capacity(rkyv_data.len());
    aligned.extend_from_slice(rkyv_data);
    Ok(aligned)
}

// ============================================================================
// TaskRecord encoding/decoding
// ============================================================================

#[inline]
pub fn encode_task_record(record: &TaskRecord) -> Result<Vec<u8>, CodecError> {
    let data = rkyv::to_bytes::<TaskRecord, 256>(record)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    Ok(prepend_version(TASK_RECORD_VERSION, data))
}

#[inline]
pub fn decode_task_record(bytes: &[u8]) -> Result<TaskRecord, CodecError> {
    let data = strip_version(TASK_RECORD_VERSION, bytes)?;
    let archived = rkyv::check_archived_root::<TaskRecord>(&data)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    let mut des = rkyv::Infallible;
    Ok(RkyvDeserialize::deserialize(archived, &mut des)
        .unwrap_or_else(|_| unreachable!("infallible deserialization for TaskRecord")))
}

// ============================================================================
// IdempotencyRecord encoding/decoding
// ============================================================================

#[inline]
pub fn encode_idempotency_record(record: &IdempotencyRecord) -> Result<Vec<u8>, CodecError> {
    let data = rkyv::to_bytes::<IdempotencyRecord, 256>(record)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    Ok(prepend_version(IDEMPOTENCY_RECORD_VERSION, data))
}

#[inline]
pub fn decode_idempotency_record(bytes: &[u8]) -> Result<IdempotencyRecord, CodecError> {
    let data = strip_version(IDEMPOTENCY_RECORD_VERSION, bytes)?;
    let archived = rkyv::check_archived_root::<IdempotencyRecord>(&data)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    let mut des = rkyv::Infallible;
    Ok(RkyvDeserialize::deserialize(archived, &mut des)
        .unwrap_or_else(|_| unreachable!("infallible deserialization for IdempotencyRecord")))
}

// ============================================================================
// BatchRecord encoding/decoding
// ============================================================================

#[inline]
pub fn encode_batch_record(record: &BatchRecord) -> Result<Vec<u8>, CodecError> {
    let data = rkyv::to_bytes::<BatchRecord, 256>(record)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    Ok(prepend_version(BATCH_RECORD_VERSION, data))
}

#[inline]
pub fn decode_batch_record(bytes: &[u8]) -> Result<BatchRecord, CodecError> {
    let data = strip_version(BATCH_RECORD_VERSION, bytes)?;
    let archived = rkyv::check_archived_root::<BatchRecord>(&data)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    let mut des = rkyv::Infallible;
    Ok(RkyvDeserialize::deserialize(archived, &mut des)
        .unwrap_or_else(|_| unreachable!("infallible deserialization for BatchRecord")))
}
