//! Idempotency ledger - at-most-once execution guard.
//!
//! A ledger record exists for every idempotency key ever observed. The
//! atomic insert-if-absent on the storage layer ensures that of any number
//! of concurrent callers presenting the same key, exactly one wins the
//! in-flight slot; everyone else either replays the completed result or
//! fails fast with `DuplicateInFlight` and applies their own retry policy.

use std::sync::Arc;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::codec::{decode_idempotency_record, encode_idempotency_record, CodecError};
use crate::keys::ledger_key;
use crate::storage::{Storage, StorageError};

/// Ledger entry lifecycle. `InFlight` marks a caller currently executing;
/// `Completed` is permanent and replayed to every later caller.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum LedgerState {
    InFlight,
    Completed {
        result: Vec<u8>,
        completed_at_ms: i64,
    },
}

/// Stored representation of one guarded logical operation.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: LedgerState,
    pub created_at_ms: i64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("operation already in flight for key {0}")]
    DuplicateInFlight(String),
    #[error("no in-flight record for key {0}")]
    NotInFlight(String),
    #[error("record for key {0} is already completed")]
    AlreadyCompleted(String),
}

/// Outcome of `begin_or_reuse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// First observation of the key; the caller owns execution.
    New,
    /// The key completed previously; the caller must return this cached
    /// result without re-executing side effects.
    Replayed(Vec<u8>),
}

pub struct IdempotencyLedger {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyLedger {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Claim execution of `key`, or learn that it is taken.
    ///
    /// Exactly one concurrent caller per key observes `Begin::New`; a
    /// completed key replays its result; a key still executing elsewhere
    /// fails fast with `DuplicateInFlight` rather than blocking.
    pub async fn begin_or_reuse(&self, key: &str) -> Result<Begin, LedgerError> {
        let record = IdempotencyRecord {
            key: key.to_string(),
            state: LedgerState::InFlight,
            created_at_ms: self.clock.now_epoch_ms(),
        };
        let encoded = encode_idempotency_record(&record)?;
        match self.storage.create(&ledger_key(key), &encoded).await {
            Ok(()) => {
                debug!(key = %key, "idempotency key claimed");
                Ok(Begin::New)
            }
            Err(StorageError::AlreadyExists(_)) => {
                let existing = self.load(key).await?.ok_or_else(|| {
                    // Deleted between the failed create and this read; the
                    // prior holder abandoned it. Treat as in flight and let
                    // the caller retry.
                    LedgerError::DuplicateInFlight(key.to_string())
                })?;
                match existing.state {
                    LedgerState::Completed { result, .. } => {
                        debug!(key = %key, "idempotency key replayed");
                        Ok(Begin::Replayed(result))
                    }
                    LedgerState::InFlight => Err(LedgerError::DuplicateInFlight(key.to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record the durable result of the single successful execution.
    ///
    /// Double completion is a caller contract violation, reported as
    /// `AlreadyCompleted` rather than silently overwriting.
    pub async fn complete(&self, key: &str, result: &[u8]) -> Result<(), LedgerError> {
        let mut record = self
            .load(key)
            .await?
            .ok_or_else(|| LedgerError::NotInFlight(key.to_string()))?;
        match record.state {
            LedgerState::Completed { .. } => Err(LedgerError::AlreadyCompleted(key.to_string())),
            LedgerState::InFlight => {
                record.state = LedgerState::Completed {
                    result: result.to_vec(),
                    completed_at_ms: self.clock.now_epoch_ms(),
                };
                let encoded = encode_idempotency_record(&record)?;
                self.storage.put(&ledger_key(key), &encoded).await?;
                Ok(())
            }
        }
    }

    /// Release an in-flight claim after a failed execution so a later
    /// attempt may claim the key again. Completed records are immutable and
    /// cannot be abandoned.
    pub async fn abandon(&self, key: &str) -> Result<(), LedgerError> {
        let record = self
            .load(key)
            .await?
            .ok_or_else(|| LedgerError::NotInFlight(key.to_string()))?;
        match record.state {
            LedgerState::Completed { .. } => Err(LedgerError::AlreadyCompleted(key.to_string())),
            LedgerState::InFlight => {
                self.storage.delete(&ledger_key(key)).await?;
                Ok(())
            }
        }
    }

    /// Fetch the record for a key, if any.
    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, LedgerError> {
        self.load(key).await
    }

    async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>, LedgerError> {
        match self.storage.get(&ledger_key(key)).await? {
            Some(raw) => Ok(Some(decode_idempotency_record(&raw)?)),
            None => Ok(None),
        }
    }
}
