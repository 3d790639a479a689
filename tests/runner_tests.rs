
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use redrive::backoff::RetryPolicy;
use redrive::ledger::{IdempotencyLedger, LedgerState};
use redrive::runner::{RunnerError, TaskRunner};
use redrive::scheduler::ManualScheduler;
use redrive::task::{TaskSpec, TaskState, TaskStateKind, WorkError};

use test_helpers::*;

fn no_jitter_policy(max_attempts: u32, base_ms: i64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_ms,
        jitter_max_ms: 0,
        max_exponent: 10,
    }
}

#[redrive::test]
async fn successful_first_attempt_reaches_succeeded() {
    with_timeout!(5_000, {
        let h = harness();
        let work = ok_work(b"payload-result");
        let id = h
            .runner
            .submit(TaskSpec::default(), work.clone(), None)
            .await
            .expect("submit");

        h.scheduler.advance_to(T0).await;

        let record = h.runner.task(&id).await.expect("get").expect("exists");
        match record.state {
            TaskState::Succeeded { result, .. } => assert_eq!(result, b"payload-result"),
            other => panic!("expected Succeeded, got {:?}", other.kind()),
        }
        assert_eq!(record.attempt, 0);
        assert_eq!(work.calls(), 1);
        assert_eq!(h.scheduler.pending_len(), 0);
    });
}

#[redrive::test]
async fn retryable_failures_back_off_then_succeed() {
    with_timeout!(5_000, {
        let h = harness();
        let work = flaky_work(2);
        let id = h
            .runner
            .submit(
                TaskSpec {
                    policy: no_jitter_policy(5, 1_000),
                    ..TaskSpec::default()
                },
                work.clone(),
                None,
            )
            .await
            .expect("submit");

        // Attempt 0 fails; retry scheduled 1000ms out (base * 2^0).
        h.scheduler.advance_to(T0).await;
        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert_eq!(record.attempt, 1);
        match record.state {
            TaskState::Pending { next_run_at_ms } => assert_eq!(next_run_at_ms, T0 + 1_000),
            other => panic!("expected Pending, got {:?}", other.kind()),
        }
        assert_eq!(record.last_error.as_deref(), Some("transient 0"));

        // Attempt 1 fails; retry scheduled another 2000ms out (base * 2^1).
        h.scheduler.advance_to(T0 + 1_000).await;
        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert_eq!(record.attempt, 2);
        match record.state {
            TaskState::Pending { next_run_at_ms } => assert_eq!(next_run_at_ms, T0 + 3_000),
            other => panic!("expected Pending, got {:?}", other.kind()),
        }

        // Attempt 2 succeeds.
        h.scheduler.advance_to(T0 + 3_000).await;
        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert!(matches!(record.state, TaskState::Succeeded { .. }));
        assert_eq!(work.calls(), 3);
        assert_eq!(h.scheduler.pending_len(), 0);
    });
}

#[redrive::test]
async fn exhausted_retries_reach_failed_terminal_with_no_extra_attempt() {
    with_timeout!(5_000, {
        let h = harness();
        let work = always_failing_work();
        let id = h
            .runner
            .submit(
                TaskSpec {
                    policy: no_jitter_policy(3, 1_000),
                    ..TaskSpec::default()
                },
                work.clone(),
                None,
            )
            .await
            .expect("submit");

        // Three attempts at T0, T0+1000, T0+3000; the third failure is final.
        h.scheduler.drain().await;

        let record = h.runner.task(&id).await.unwrap().unwrap();
        match &record.state {
            TaskState::FailedTerminal {
                error_code,
                finished_at_ms,
            } => {
                assert_eq!(error_code, "exhausted-retries");
                assert_eq!(*finished_at_ms, T0 + 3_000);
            }
            other => panic!("expected FailedTerminal, got {:?}", other.kind()),
        }
        assert_eq!(record.attempt, 2);
        assert_eq!(record.last_error.as_deref(), Some("still broken"));
        // Exactly max_attempts executions, and nothing further scheduled.
        assert_eq!(work.calls(), 3);
        assert_eq!(h.scheduler.pending_len(), 0);
    });
}

#[redrive::test]
async fn fatal_error_short_circuits_remaining_attempts() {
    with_timeout!(5_000, {
        let h = harness();
        let work = ScriptedWork::new(vec![Err(WorkError::Fatal("bad input".to_string()))]);
        let id = h
            .runner
            .submit(
                TaskSpec {
                    policy: no_jitter_policy(5, 1_000),
                    ..TaskSpec::default()
                },
                work.clone(),
                None,
            )
            .await
            .expect("submit");

        h.scheduler.advance_to(T0).await;

        let record = h.runner.task(&id).await.unwrap().unwrap();
        match &record.state {
            TaskState::FailedTerminal { error_code, .. } => assert_eq!(error_code, "fatal"),
            other => panic!("expected FailedTerminal, got {:?}", other.kind()),
        }
        assert_eq!(record.attempt, 0);
        assert_eq!(record.last_error.as_deref(), Some("bad input"));
        assert_eq!(work.calls(), 1);
        assert_eq!(h.scheduler.pending_len(), 0);
    });
}

#[redrive::test]
async fn duplicate_task_id_is_rejected() {
    with_timeout!(5_000, {
        let h = harness();
        let spec = TaskSpec {
            id: Some("job-1".to_string()),
            ..TaskSpec::default()
        };
        h.runner
            .submit(spec.clone(), ok_work(b"a"), None)
            .await
            .expect("first submit");
        match h.runner.submit(spec, ok_work(b"b"), None).await {
            Err(RunnerError::TaskAlreadyExists(id)) => assert_eq!(id, "job-1"),
            other => panic!("expected TaskAlreadyExists, got {:?}", other),
        }
    });
}

#[redrive::test]
async fn zero_max_attempts_is_rejected() {
    with_timeout!(5_000, {
        let h = harness();
        let spec = TaskSpec {
            policy: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            ..TaskSpec::default()
        };
        assert!(matches!(
            h.runner.submit(spec, ok_work(b"x"), None).await,
            Err(RunnerError::InvalidPolicy(_))
        ));
    });
}

#[redrive::test]
async fn idempotent_success_records_ledger_result() {
    with_timeout!(5_000, {
        let h = harness();
        let id = h
            .runner
            .submit(
                TaskSpec {
                    idempotency_key: Some("order-42".to_string()),
                    ..TaskSpec::default()
                },
                ok_work(b"shipped"),
                None,
            )
            .await
            .expect("submit");

        h.scheduler.advance_to(T0).await;

        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert!(matches!(record.state, TaskState::Succeeded { .. }));

        let ledger = IdempotencyLedger::new(h.storage.clone(), h.clock.clone());
        let entry = ledger.get("order-42").await.unwrap().expect("ledger entry");
        match entry.state {
            LedgerState::Completed { result, .. } => assert_eq!(result, b"shipped"),
            LedgerState::InFlight => panic!("expected Completed"),
        }
    });
}

#[redrive::test]
async fn completed_key_replays_without_reinvoking_work() {
    with_timeout!(5_000, {
        let h = harness();
        let first = ok_work(b"shipped");
        h.runner
            .submit(
                TaskSpec {
                    idempotency_key: Some("order-42".to_string()),
                    ..TaskSpec::default()
                },
                first,
                None,
            )
            .await
            .expect("submit first");
        h.scheduler.advance_to(T0).await;

        // Second task reuses the key; its work must never run.
        let second = ok_work(b"would-differ");
        let id = h
            .runner
            .submit(
                TaskSpec {
                    idempotency_key: Some("order-42".to_string()),
                    ..TaskSpec::default()
                },
                second.clone(),
                None,
            )
            .await
            .expect("submit second");
        h.scheduler.advance_to(T0 + 10).await;

        let record = h.runner.task(&id).await.unwrap().unwrap();
        match record.state {
            TaskState::Succeeded { result, .. } => assert_eq!(result, b"shipped"),
            other => panic!("expected Succeeded, got {:?}", other.kind()),
        }
        assert_eq!(second.calls(), 0);
    });
}

#[redrive::test]
async fn in_flight_key_defers_the_colliding_task() {
    with_timeout!(5_000, {
        let h = harness();
        let ledger = IdempotencyLedger::new(h.storage.clone(), h.clock.clone());
        // Another holder is mid-execution.
        ledger.begin_or_reuse("order-42").await.expect("claim");

        let work = ok_work(b"late");
        let id = h
            .runner
            .submit(
                TaskSpec {
                    idempotency_key: Some("order-42".to_string()),
                    policy: no_jitter_policy(3, 1_000),
                    ..TaskSpec::default()
                },
                work.clone(),
                None,
            )
            .await
            .expect("submit");

        h.scheduler.advance_to(T0).await;
        // The collision backs the task off rather than running the work.
        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert_eq!(record.state.kind(), TaskStateKind::Pending);
        assert_eq!(work.calls(), 0);

        // Holder abandons; the retry claims the key and executes.
        ledger.abandon("order-42").await.expect("abandon");
        h.scheduler.drain().await;
        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert!(matches!(record.state, TaskState::Succeeded { .. }));
        assert_eq!(work.calls(), 1);
    });
}

#[redrive::test]
async fn cancel_pending_task_removes_its_scheduled_run() {
    with_timeout!(5_000, {
        let h = harness();
        let work = ok_work(b"never");
        let id = h
            .runner
            .submit(
                TaskSpec {
                    start_at_ms: Some(T0 + 5_000),
                    ..TaskSpec::default()
                },
                work.clone(),
                None,
            )
            .await
            .expect("submit");

        assert!(h.runner.cancel(&id).await.expect("cancel"));
        assert_eq!(h.scheduler.pending_len(), 0);

        let record = h.runner.task(&id).await.unwrap().unwrap();
        match &record.state {
            TaskState::FailedTerminal { error_code, .. } => assert_eq!(error_code, "cancelled"),
            other => panic!("expected FailedTerminal, got {:?}", other.kind()),
        }

        // Past the would-be run time, the work never executed.
        h.scheduler.advance_to(T0 + 10_000).await;
        assert_eq!(work.calls(), 0);

        // Cancelling again reports the terminal state.
        assert!(matches!(
            h.runner.cancel(&id).await,
            Err(RunnerError::TaskAlreadyTerminal(_, TaskStateKind::FailedTerminal))
        ));
    });
}

#[redrive::test]
async fn recover_reschedules_pending_and_running_tasks() {
    with_timeout!(5_000, {
        let h = harness();
        let id_pending = h
            .runner
            .submit(
                TaskSpec {
                    id: Some("survivor".to_string()),
                    start_at_ms: Some(T0 + 1_000),
                    ..TaskSpec::default()
                },
                ok_work(b"a"),
                None,
            )
            .await
            .expect("submit");
        let id_done = h
            .runner
            .submit(
                TaskSpec {
                    id: Some("finished".to_string()),
                    ..TaskSpec::default()
                },
                ok_work(b"b"),
                None,
            )
            .await
            .expect("submit");
        // Run only the immediate task to completion before the "crash".
        h.scheduler.advance_to(T0).await;

        // Simulate a crash mid-attempt: rewrite the surviving record as
        // Running, the state a dying process leaves behind.
        {
            use redrive::codec::{decode_task_record, encode_task_record};
            use redrive::keys::task_key;
            use redrive::storage::Storage;

            let key = task_key(&id_pending);
            let raw = h.storage.get(&key).await.unwrap().unwrap();
            let mut record = decode_task_record(&raw).unwrap();
            record.state = TaskState::Running { started_at_ms: T0 };
            h.storage
                .put(&key, &encode_task_record(&record).unwrap())
                .await
                .unwrap();
        }

        // Fresh process: new runner over the same storage.
        let scheduler2 = ManualScheduler::new(h.clock.clone());
        let runner2 = TaskRunner::new(
            h.storage.clone(),
            scheduler2.clone(),
            h.clock.clone(),
            None,
        );
        let work = ok_work(b"recovered");
        let resolver_work = work.clone();
        let recovered = runner2
            .recover(&move |record| {
                (record.id == "survivor").then(|| resolver_work.clone() as Arc<dyn redrive::task::Work>)
            })
            .await
            .expect("recover");
        // Terminal records are skipped.
        assert_eq!(recovered, 1);

        scheduler2.drain().await;
        let record = runner2.task(&id_pending).await.unwrap().unwrap();
        assert!(matches!(record.state, TaskState::Succeeded { .. }));
        assert_eq!(work.calls(), 1);

        let done = runner2.task(&id_done).await.unwrap().unwrap();
        assert!(matches!(done.state, TaskState::Succeeded { .. }));
    });
}

#[redrive::test]
async fn delayed_start_waits_for_its_time() {
    with_timeout!(5_000, {
        let h = harness();
        let work = ok_work(b"later");
        let id = h
            .runner
            .submit(
                TaskSpec {
                    start_at_ms: Some(T0 + 2_500),
                    ..TaskSpec::default()
                },
                work.clone(),
                None,
            )
            .await
            .expect("submit");

        h.scheduler.advance_to(T0 + 2_499).await;
        assert_eq!(work.calls(), 0);
        h.scheduler.advance_to(T0 + 2_500).await;
        assert_eq!(work.calls(), 1);
        let record = h.runner.task(&id).await.unwrap().unwrap();
        assert!(matches!(record.state, TaskState::Succeeded { .. }));
    });
}

#[redrive::test]
async fn completion_hook_fires_once_with_the_terminal_record() {
    with_timeout!(5_000, {
        let h = harness();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_hook = fired.clone();
        h.runner
            .submit(
                TaskSpec {
                    id: Some("hooked".to_string()),
                    ..TaskSpec::default()
                },
                ok_work(b"r"),
                Some(Box::new(move |record| {
                    assert_eq!(record.id, "hooked");
                    assert!(record.state.is_terminal());
                    fired_in_hook.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .expect("submit");

        h.scheduler.drain().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    });
}
