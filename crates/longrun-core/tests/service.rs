use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use longrun_core::app::RECOVERED_REASON;
use longrun_core::domain::TaskContext;
use longrun_core::ports::FixedClock;
use longrun_core::{
    CheckpointPolicy, FileStoreConfig, FileTaskStore, InMemoryTaskStore, LongLivedTaskService,
    Outcome, RetryPolicy, ServiceConfig, ServiceError, TaskConfiguration, TaskError,
    TaskEvent, TaskEventKind, TaskExecutionStore, TaskId, TaskMetadata, TaskStatus,
    WorkflowContext,
};

const LONG: Duration = Duration::from_secs(10);
const WAIT: Duration = Duration::from_secs(2);

fn service() -> LongLivedTaskService {
    LongLivedTaskService::new(Arc::new(InMemoryTaskStore::new()))
}

fn config() -> TaskConfiguration {
    TaskConfiguration::new("agent")
}

async fn wait_for_status(
    service: &LongLivedTaskService,
    task_id: TaskId,
    expected: TaskStatus,
) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if service.status(task_id).await.unwrap() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn event_names(service: &LongLivedTaskService, task_id: TaskId) -> Vec<&'static str> {
    service
        .events(task_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.name())
        .collect()
}

#[tokio::test]
async fn completed_task_records_result() {
    let service = service();
    let handle = service
        .start(config(), |ctx: WorkflowContext| async move {
            Outcome::completed(json!({ "attempt": ctx.attempt() }))
        })
        .await
        .unwrap();

    let value = handle.await_result(WAIT).await.unwrap();
    assert_eq!(value, json!({ "attempt": 1 }));
    assert_eq!(
        service.status(handle.task_id()).await.unwrap(),
        Some(TaskStatus::Completed)
    );

    let events = service.events(handle.task_id()).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, TaskEventKind::Started);
    assert_eq!(
        events[1].kind,
        TaskEventKind::Completed {
            result: r#"{"attempt":1}"#.to_string()
        }
    );
}

#[tokio::test]
async fn cancel_during_long_body_does_not_hang() {
    let service = service();
    let handle = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("too late")
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.cancel(handle.task_id()).await.unwrap());

    let result = handle.await_result(WAIT).await;
    assert_eq!(result, Err(TaskError::Cancelled(handle.task_id())));
    assert_eq!(handle.status().await.unwrap(), Some(TaskStatus::Cancelled));
    assert_eq!(event_names(&service, handle.task_id()).await, vec!["started", "cancelled"]);

    // 2 回目以降は何もしない
    assert!(!service.cancel(handle.task_id()).await.unwrap());
    assert_eq!(event_names(&service, handle.task_id()).await.len(), 2);
}

#[tokio::test]
async fn handle_cancel_uses_the_same_path() {
    let service = service();
    let handle = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("too late")
        })
        .await
        .unwrap();

    assert!(handle.cancel().await.unwrap());
    assert!(!handle.cancel().await.unwrap());
    assert_eq!(
        handle.await_result(WAIT).await,
        Err(TaskError::Cancelled(handle.task_id()))
    );
}

#[tokio::test]
async fn timeout_cancels_without_explicit_cancel() {
    let service = service();
    let started = Instant::now();
    let handle = service
        .start(
            config().with_timeout(Duration::from_millis(200)),
            |_ctx: WorkflowContext| async {
                tokio::time::sleep(LONG).await;
                Outcome::completed("too late")
            },
        )
        .await
        .unwrap();

    let result = handle.await_result(WAIT).await;
    assert_eq!(result, Err(TaskError::Cancelled(handle.task_id())));
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(
        service.status(handle.task_id()).await.unwrap(),
        Some(TaskStatus::Cancelled)
    );
}

#[tokio::test]
async fn finished_task_is_not_cancelled_by_its_timeout() {
    let service = service();
    let handle = service
        .start(
            config().with_timeout(Duration::from_millis(50)),
            |_ctx: WorkflowContext| async { Outcome::completed("quick") },
        )
        .await
        .unwrap();

    assert!(handle.await_result(WAIT).await.is_ok());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        service.status(handle.task_id()).await.unwrap(),
        Some(TaskStatus::Completed)
    );
}

#[tokio::test]
async fn retries_are_exhausted_then_failed() {
    let service = service();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let handle = service
        .start(
            config().with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(10))),
            move |_ctx: WorkflowContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::failed("boom")
                }
            },
        )
        .await
        .unwrap();

    let err = handle.await_result(WAIT).await.unwrap_err();
    assert!(matches!(err, TaskError::Failed(ref f) if f.message == "boom"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let events = service.events(handle.task_id()).await.unwrap();
    let retries: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            TaskEventKind::Retried {
                attempt,
                max_retries,
                ..
            } => Some((*attempt, *max_retries)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 2), (2, 2)]);
    assert_eq!(events.last().map(|e| e.name()), Some("failed"));

    let metadata = service.metadata(handle.task_id()).await.unwrap().unwrap();
    assert_eq!(metadata.status(), TaskStatus::Failed);
    assert_eq!(metadata.failure_reason(), Some("boom"));
}

#[tokio::test]
async fn transient_failures_recover_on_retry() {
    let service = service();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let handle = service
        .start(
            config().with_retry_policy(RetryPolicy::exponential(3, Duration::from_millis(5), 2.0)),
            move |ctx: WorkflowContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 3 {
                        Outcome::failed_with("transient", "flaky upstream")
                    } else {
                        Outcome::completed(json!("ok"))
                    }
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(handle.await_result(WAIT).await, Ok(json!("ok")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        event_names(&service, handle.task_id()).await,
        vec!["started", "retried", "retried", "completed"]
    );
}

#[tokio::test]
async fn non_retryable_kind_fails_immediately() {
    let service = service();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let policy = RetryPolicy::fixed(3, Duration::from_millis(5)).retry_on("transient");
    let handle = service
        .start(config().with_retry_policy(policy), move |_ctx: WorkflowContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Outcome::failed_with("fatal", "bad request")
            }
        })
        .await
        .unwrap();

    assert!(matches!(
        handle.await_result(WAIT).await,
        Err(TaskError::Failed(_))
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_during_backoff_stops_retrying() {
    let service = service();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let handle = service
        .start(
            config().with_retry_policy(RetryPolicy::fixed(5, LONG)),
            move |_ctx: WorkflowContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::failed("boom")
                }
            },
        )
        .await
        .unwrap();

    assert!(wait_for_status(&service, handle.task_id(), TaskStatus::Retrying).await);
    assert!(service.cancel(handle.task_id()).await.unwrap());

    assert_eq!(
        handle.await_result(WAIT).await,
        Err(TaskError::Cancelled(handle.task_id()))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        service.status(handle.task_id()).await.unwrap(),
        Some(TaskStatus::Cancelled)
    );
}

#[tokio::test]
async fn pause_is_never_retried() {
    let service = service();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let handle = service
        .start(
            config().with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(5))),
            move |_ctx: WorkflowContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::paused("need approval", "approval")
                }
            },
        )
        .await
        .unwrap();

    let err = handle.await_result(WAIT).await.unwrap_err();
    let TaskError::Paused(signal) = err else {
        panic!("expected pause, got {err:?}");
    };
    assert_eq!(signal.input_key.as_deref(), Some("approval"));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        service.status(handle.task_id()).await.unwrap(),
        Some(TaskStatus::Paused)
    );
    assert_eq!(event_names(&service, handle.task_id()).await, vec!["started", "paused"]);
}

#[tokio::test]
async fn after_each_agent_pause_writes_paused_checkpoint() {
    let service = service();
    let handle = service
        .start(
            config().with_checkpoint_policy(CheckpointPolicy::AfterEachAgent),
            |_ctx: WorkflowContext| async { Outcome::paused("need input", "answer") },
        )
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;

    let checkpoint = service
        .store()
        .load_checkpoint(handle.task_id())
        .await
        .unwrap()
        .expect("checkpoint written at pause");
    assert_eq!(checkpoint.metadata.status(), TaskStatus::Paused);
}

#[tokio::test]
async fn after_each_agent_keeps_workflow_scope() {
    let service = service();
    let handle = service
        .start(
            config().with_checkpoint_policy(CheckpointPolicy::AfterEachAgent),
            |ctx: WorkflowContext| async move {
                assert!(ctx.checkpoint_step(json!({ "step": 1 })).await.unwrap());
                Outcome::paused("need input", "answer")
            },
        )
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;

    let checkpoint = service
        .store()
        .load_checkpoint(handle.task_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.metadata.status(), TaskStatus::Paused);
    assert_eq!(checkpoint.scope, Some(json!({ "step": 1 })));
}

#[tokio::test]
async fn after_root_call_engine_writes_no_checkpoint() {
    let service = service();
    let paused = service
        .start(
            config().with_checkpoint_policy(CheckpointPolicy::AfterRootCall),
            |_ctx: WorkflowContext| async { Outcome::paused("need input", "answer") },
        )
        .await
        .unwrap();
    let completed = service
        .start(
            config().with_checkpoint_policy(CheckpointPolicy::AfterRootCall),
            |_ctx: WorkflowContext| async { Outcome::completed("done") },
        )
        .await
        .unwrap();
    let _ = paused.await_result(WAIT).await;
    let _ = completed.await_result(WAIT).await;

    for id in [paused.task_id(), completed.task_id()] {
        assert!(service.store().load_checkpoint(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn after_root_call_accepts_only_scope_checkpoints() {
    let service = service();
    let handle = service
        .start(
            config().with_checkpoint_policy(CheckpointPolicy::AfterRootCall),
            |ctx: WorkflowContext| async move {
                let step = ctx.checkpoint_step(json!("step")).await.unwrap();
                let root = ctx.checkpoint_scope(json!("root")).await.unwrap();
                Outcome::completed(json!([step, root]))
            },
        )
        .await
        .unwrap();

    assert_eq!(handle.await_result(WAIT).await, Ok(json!([false, true])));
    let checkpoint = service
        .store()
        .load_checkpoint(handle.task_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.scope, Some(json!("root")));
}

#[tokio::test]
async fn none_policy_writes_nothing() {
    let service = LongLivedTaskService::builder(Arc::new(InMemoryTaskStore::new()))
        .config(ServiceConfig::default().with_default_checkpoint_policy(CheckpointPolicy::None))
        .build();
    let handle = service
        .start(config(), |ctx: WorkflowContext| async move {
            assert!(!ctx.checkpoint_scope(json!("root")).await.unwrap());
            Outcome::paused("need input", "answer")
        })
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;

    assert!(
        service
            .store()
            .load_checkpoint(handle.task_id())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn paused_task_resumes_with_provided_input() {
    let service = service();
    let handle = service
        .start(config(), |_ctx: WorkflowContext| async {
            Outcome::paused("need approval", "approval")
        })
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;
    let id = handle.task_id();

    service
        .provide_input(id, "approval", json!("yes"))
        .await
        .unwrap();
    assert_eq!(service.status(id).await.unwrap(), Some(TaskStatus::Paused));

    let resumed = service
        .resume(
            id,
            |ctx: WorkflowContext| async move {
                let inputs = ctx.provided_inputs().await.unwrap();
                Outcome::completed(inputs.get("approval").cloned().unwrap_or_default())
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(resumed.await_result(WAIT).await, Ok(json!("yes")));
    assert_eq!(
        event_names(&service, id).await,
        vec!["started", "paused", "input_provided", "resumed", "completed"]
    );
    // 古いハンドルの結果は変わらない
    assert!(matches!(handle.try_result(), Some(Err(TaskError::Paused(_)))));
}

#[tokio::test]
async fn provide_input_requires_pause() {
    let service = service();
    let handle = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("late")
        })
        .await
        .unwrap();

    let err = service
        .provide_input(handle.task_id(), "k", json!(1))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(TaskStatus::Running));
    assert!(err.to_string().contains("not paused"));

    assert!(matches!(
        service
            .provide_input(TaskId::from_u128(404), "k", json!(1))
            .await,
        Err(ServiceError::NotFound(_))
    ));
    service.cancel(handle.task_id()).await.unwrap();
}

#[tokio::test]
async fn resume_rejects_incompatible_states() {
    let service = service();

    let running = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("late")
        })
        .await
        .unwrap();
    let err = service
        .resume(
            running.task_id(),
            |_ctx: WorkflowContext| async { Outcome::completed("x") },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(TaskStatus::Running));
    assert!(err.to_string().contains("already RUNNING"));

    service.cancel(running.task_id()).await.unwrap();
    let err = service
        .resume(
            running.task_id(),
            |_ctx: WorkflowContext| async { Outcome::completed("x") },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(TaskStatus::Cancelled));
    assert!(err.to_string().contains("in state: CANCELLED"));

    let err = service
        .resume(
            TaskId::from_u128(404),
            |_ctx: WorkflowContext| async { Outcome::completed("x") },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn failed_task_resumes_exactly_once() {
    let service = service();
    let handle = service
        .start(config(), |_ctx: WorkflowContext| async { Outcome::failed("boom") })
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;
    let id = handle.task_id();
    assert_eq!(service.status(id).await.unwrap(), Some(TaskStatus::Failed));

    let slow = |_ctx: WorkflowContext| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Outcome::completed("second wind")
    };
    let (a, b) = tokio::join!(service.resume(id, slow, None), service.resume(id, slow, None));

    let winners: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].await_result(WAIT).await, Ok(json!("second wind")));

    let metadata = service.metadata(id).await.unwrap().unwrap();
    assert_eq!(metadata.status(), TaskStatus::Completed);
    assert_eq!(metadata.failure_reason(), None);
}

async fn race_cancel_against_completion(service: &LongLivedTaskService, rounds: usize) {
    for _ in 0..rounds {
        let handle = service
            .start(config(), |_ctx: WorkflowContext| async {
                tokio::task::yield_now().await;
                Outcome::completed("done")
            })
            .await
            .unwrap();

        let cancelled = service.cancel(handle.task_id()).await.unwrap();
        let result = handle.await_result(WAIT).await;
        let status = service.status(handle.task_id()).await.unwrap();

        match status {
            Some(TaskStatus::Cancelled) => {
                assert!(cancelled);
                assert_eq!(result, Err(TaskError::Cancelled(handle.task_id())));
            }
            Some(TaskStatus::Completed) => {
                assert!(!cancelled);
                assert_eq!(result, Ok(json!("done")));
            }
            other => panic!("unexpected final status {other:?}"),
        }
    }
}

#[tokio::test]
async fn cancel_racing_completion_never_errors() {
    race_cancel_against_completion(&service(), 20).await;
}

#[tokio::test]
async fn cancel_racing_completion_on_file_store_respects_the_winner() {
    let dir = tempfile::tempdir().unwrap();
    let service =
        LongLivedTaskService::new(Arc::new(FileTaskStore::new(FileStoreConfig::new(dir.path()))));
    race_cancel_against_completion(&service, 10).await;
}

#[tokio::test]
async fn terminal_tasks_ignore_cancel() {
    let service = service();
    let done = service
        .start(config(), |_ctx: WorkflowContext| async { Outcome::completed(1) })
        .await
        .unwrap();
    let failed = service
        .start(config(), |_ctx: WorkflowContext| async { Outcome::failed("boom") })
        .await
        .unwrap();
    let _ = done.await_result(WAIT).await;
    let _ = failed.await_result(WAIT).await;

    assert!(!service.cancel(done.task_id()).await.unwrap());
    assert!(!service.cancel(failed.task_id()).await.unwrap());
    assert_eq!(
        service.status(done.task_id()).await.unwrap(),
        Some(TaskStatus::Completed)
    );
    assert_eq!(
        service.status(failed.task_id()).await.unwrap(),
        Some(TaskStatus::Failed)
    );
}

#[tokio::test]
async fn recovery_pauses_orphaned_tasks_only() {
    let store = Arc::new(InMemoryTaskStore::new());
    let orphan = |n: u128, status: TaskStatus| {
        let mut m = TaskMetadata::create(TaskId::from_u128(n), "agent", TaskContext::new(), Utc::now());
        m.transition_to(status);
        m
    };
    for m in [
        orphan(1, TaskStatus::Running),
        orphan(2, TaskStatus::Retrying),
        orphan(3, TaskStatus::Completed),
        orphan(4, TaskStatus::Paused),
    ] {
        store.save_metadata(&m).await.unwrap();
    }

    let service = LongLivedTaskService::new(store);
    let live = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("late")
        })
        .await
        .unwrap();

    let recovered = service.recover_interrupted_tasks().await.unwrap();
    assert_eq!(
        recovered.into_iter().collect::<Vec<_>>(),
        vec![TaskId::from_u128(1), TaskId::from_u128(2)]
    );

    for n in [1, 2] {
        let id = TaskId::from_u128(n);
        assert_eq!(service.status(id).await.unwrap(), Some(TaskStatus::Paused));
        let events = service.events(id).await.unwrap();
        assert_eq!(
            events[0].kind,
            TaskEventKind::Paused {
                reason: RECOVERED_REASON.to_string(),
                input_key: None
            }
        );
    }
    assert_eq!(
        service.status(live.task_id()).await.unwrap(),
        Some(TaskStatus::Running)
    );
    assert_eq!(
        service.list_tasks_by_status(TaskStatus::Paused).await.unwrap().len(),
        3
    );
    service.cancel(live.task_id()).await.unwrap();
}

#[tokio::test]
async fn cleanup_only_removes_terminal_tasks() {
    let service = service();
    let handle = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("late")
        })
        .await
        .unwrap();
    let id = handle.task_id();

    let err = service.cleanup(id).await.unwrap_err();
    assert_eq!(err.status(), Some(TaskStatus::Running));

    service.cancel(id).await.unwrap();
    assert!(service.cleanup(id).await.unwrap());
    assert!(service.metadata(id).await.unwrap().is_none());
    assert!(service.events(id).await.unwrap().is_empty());
    assert!(!service.cleanup(id).await.unwrap());
    assert!(service.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_with_existing_id_is_rejected() {
    let service = service();
    let id = TaskId::from_u128(42);
    let handle = service
        .start_with_id(id, config(), |_ctx: WorkflowContext| async {
            Outcome::completed(1)
        })
        .await
        .unwrap();
    assert_eq!(handle.task_id(), id);
    let _ = handle.await_result(WAIT).await;

    let err = service
        .start_with_id(id, config(), |_ctx: WorkflowContext| async {
            Outcome::completed(2)
        })
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(TaskStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_with_one_id_have_one_winner() {
    let service = service();
    let id = TaskId::from_u128(7);
    let slow = |_ctx: WorkflowContext| async {
        tokio::time::sleep(LONG).await;
        Outcome::completed("late")
    };

    let (a, b) = tokio::join!(
        service.start_with_id(id, config(), slow),
        service.start_with_id(id, config(), slow),
    );
    let winners = [a.is_ok(), b.is_ok()].into_iter().filter(|ok| *ok).count();
    assert_eq!(winners, 1);
    assert_eq!(event_names(&service, id).await, vec!["started"]);
    assert_eq!(service.active_task_ids().await.len(), 1);

    service.cancel(id).await.unwrap();
}

#[tokio::test]
async fn injected_clock_stamps_records_events_and_checkpoints() {
    let at = Utc::now() - chrono::Duration::days(1);
    let service = LongLivedTaskService::builder(Arc::new(InMemoryTaskStore::new()))
        .clock(Arc::new(FixedClock::new(at)))
        .build();

    let handle = service
        .start(
            config().with_checkpoint_policy(CheckpointPolicy::AfterEachAgent),
            |_ctx: WorkflowContext| async { Outcome::paused("need input", "answer") },
        )
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;
    let id = handle.task_id();
    service.provide_input(id, "answer", json!(1)).await.unwrap();
    assert!(service.cancel(id).await.unwrap());

    assert_eq!(service.metadata(id).await.unwrap().unwrap().created_at(), at);
    let events = service.events(id).await.unwrap();
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.at == at));
    let checkpoint = service.store().load_checkpoint(id).await.unwrap().unwrap();
    assert_eq!(checkpoint.taken_at, at);
}

#[tokio::test]
async fn shutdown_aborts_stragglers_for_later_recovery() {
    let service = service();
    let quick = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Outcome::completed("quick")
        })
        .await
        .unwrap();
    let slow = service
        .start(config(), |_ctx: WorkflowContext| async {
            tokio::time::sleep(LONG).await;
            Outcome::completed("late")
        })
        .await
        .unwrap();

    let aborted = service.shutdown_with_grace(Duration::from_millis(200)).await;
    assert_eq!(aborted, vec![slow.task_id()]);
    assert!(matches!(
        slow.await_result(WAIT).await,
        Err(TaskError::Aborted { .. })
    ));
    assert_eq!(quick.await_result(WAIT).await, Ok(json!("quick")));

    // 永続状態は RUNNING のまま → 次回起動時に PAUSED へ
    assert_eq!(
        service.status(slow.task_id()).await.unwrap(),
        Some(TaskStatus::Running)
    );
    let recovered = service.recover_interrupted_tasks().await.unwrap();
    assert!(recovered.contains(&slow.task_id()));
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        LongLivedTaskService::new(Arc::new(FileTaskStore::new(FileStoreConfig::new(
            dir.path(),
        ))))
    };

    let first = open();
    let handle = first
        .start(
            config().with_context("topic", json!("rust")),
            |_ctx: WorkflowContext| async { Outcome::paused("need input", "answer") },
        )
        .await
        .unwrap();
    let _ = handle.await_result(WAIT).await;
    let id = handle.task_id();

    // 別プロセス相当: 新しい store インスタンス
    let second = open();
    let metadata = second.metadata(id).await.unwrap().unwrap();
    assert_eq!(metadata.status(), TaskStatus::Paused);
    assert_eq!(metadata.context()["topic"], json!("rust"));

    second.provide_input(id, "answer", json!(42)).await.unwrap();
    let resumed = second
        .resume(
            id,
            |ctx: WorkflowContext| async move {
                let inputs = ctx.provided_inputs().await.unwrap();
                Outcome::completed(inputs["answer"].clone())
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(resumed.await_result(WAIT).await, Ok(json!(42)));

    let checkpoint = second.store().load_checkpoint(id).await.unwrap().unwrap();
    assert_eq!(checkpoint.metadata.status(), TaskStatus::Paused);
    assert_eq!(
        event_names(&second, id).await,
        vec!["started", "paused", "input_provided", "resumed", "completed"]
    );
}

#[tokio::test]
async fn torn_journal_tail_does_not_break_recovery_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTaskStore::new(FileStoreConfig::new(dir.path())));
    let id = TaskId::from_u128(5);

    // クラッシュ直前: RUNNING のまま、ジャーナル末尾に書きかけの行
    let metadata = TaskMetadata::create(id, "agent", TaskContext::new(), Utc::now());
    store.save_metadata(&metadata).await.unwrap();
    store
        .append_event(&TaskEvent::new(id, TaskEventKind::Started))
        .await
        .unwrap();
    let journal = dir.path().join(id.to_string()).join("journal.jsonl");
    let mut f = OpenOptions::new().append(true).open(&journal).unwrap();
    write!(f, "{{\"task_id\":\"task-").unwrap();
    drop(f);

    let service = LongLivedTaskService::new(store);
    let recovered = service.recover_interrupted_tasks().await.unwrap();
    assert!(recovered.contains(&id));
    assert_eq!(event_names(&service, id).await, vec!["started", "paused"]);

    service.provide_input(id, "answer", json!("yes")).await.unwrap();
    assert_eq!(
        event_names(&service, id).await,
        vec!["started", "paused", "input_provided"]
    );

    let resumed = service
        .resume(
            id,
            |ctx: WorkflowContext| async move {
                let inputs = ctx.provided_inputs().await.unwrap();
                Outcome::completed(inputs["answer"].clone())
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(resumed.await_result(WAIT).await, Ok(json!("yes")));
    assert_eq!(
        event_names(&service, id).await,
        vec!["started", "paused", "input_provided", "resumed", "completed"]
    );
}
