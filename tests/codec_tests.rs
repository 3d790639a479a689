use redrive::backoff::RetryPolicy;
use redrive::batch::{BatchRecord, BatchStatus};
use redrive::codec::{
    decode_batch_record, decode_idempotency_record, decode_task_record, encode_batch_record,
    encode_idempotency_record, encode_task_record, CodecError,
};
use redrive::ledger::{IdempotencyRecord, LedgerState};
use redrive::task::{TaskRecord, TaskState};

fn sample_task() -> TaskRecord {
    TaskRecord {
        id: "task-1".to_string(),
        attempt: 2,
        state: TaskState::Pending {
            next_run_at_ms: 1_234_567,
        },
        policy: RetryPolicy {
            max_attempts: 4,
            base_ms: 500,
            jitter_max_ms: 100,
            max_exponent: 10,
        },
        payload: b"{\"order\":42}".to_vec(),
        idempotency_key: Some("order-42".to_string()),
        batch_id: None,
        last_error: Some("transient".to_string()),
    }
}

#[redrive::test]
fn task_record_roundtrip() {
    let record = sample_task();
    let encoded = encode_task_record(&record).expect("encode");
    let decoded = decode_task_record(&encoded).expect("decode");
    assert_eq!(decoded.id, "task-1");
    assert_eq!(decoded.attempt, 2);
    assert_eq!(decoded.policy, record.policy);
    assert_eq!(decoded.idempotency_key.as_deref(), Some("order-42"));
    assert_eq!(decoded.last_error.as_deref(), Some("transient"));
    match decoded.state {
        TaskState::Pending { next_run_at_ms } => assert_eq!(next_run_at_ms, 1_234_567),
        other => panic!("expected Pending, got {:?}", other.kind()),
    }
}

#[redrive::test]
fn empty_input_is_too_short() {
    assert!(matches!(
        decode_task_record(&[]),
        Err(CodecError::TooShort)
    ));
}

#[redrive::test]
fn wrong_version_byte_is_rejected() {
    let mut encoded = encode_task_record(&sample_task()).expect("encode");
    encoded[0] = 99;
    assert!(matches!(
        decode_task_record(&encoded),
        Err(CodecError::UnsupportedVersion {
            expected: 1,
            found: 99
        })
    ));
}

#[redrive::test]
fn truncated_payload_fails_validation() {
    let encoded = encode_task_record(&sample_task()).expect("encode");
    let truncated = &encoded[..encoded.len() / 2];
    assert!(matches!(
        decode_task_record(truncated),
        Err(CodecError::Rkyv(_))
    ));
}

#[redrive::test]
fn idempotency_record_roundtrip() {
    let record = IdempotencyRecord {
        key: "order-42".to_string(),
        state: LedgerState::Completed {
            result: b"shipped".to_vec(),
            completed_at_ms: 2_000,
        },
        created_at_ms: 1_000,
    };
    let encoded = encode_idempotency_record(&record).expect("encode");
    let decoded = decode_idempotency_record(&encoded).expect("decode");
    assert_eq!(decoded.key, "order-42");
    assert_eq!(decoded.created_at_ms, 1_000);
    match decoded.state {
        LedgerState::Completed {
            result,
            completed_at_ms,
        } => {
            assert_eq!(result, b"shipped");
            assert_eq!(completed_at_ms, 2_000);
        }
        LedgerState::InFlight => panic!("expected Completed"),
    }
}

#[redrive::test]
fn batch_record_roundtrip() {
    let record = BatchRecord {
        id: "batch-1".to_string(),
        total_items: 5,
        completed_items: 3,
        status: BatchStatus::Processing,
        created_at_ms: 42,
    };
    let encoded = encode_batch_record(&record).expect("encode");
    let decoded = decode_batch_record(&encoded).expect("decode");
    assert_eq!(decoded.total_items, 5);
    assert_eq!(decoded.completed_items, 3);
    assert_eq!(decoded.status, BatchStatus::Processing);
}
