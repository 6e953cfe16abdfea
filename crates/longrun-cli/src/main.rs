use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde_json::json;

use longrun_core::{
    FileStoreConfig, FileTaskStore, LongLivedTaskService, Outcome, RetryPolicy, ServiceConfig,
    TaskConfiguration, TaskError, TaskId, TaskStatus, Workflow, WorkflowContext,
};

const USAGE: &str = "\
usage: longrun <command>

commands:
  demo                     run a flaky workflow and a paused one against the file store
  list [STATUS]            list stored tasks, optionally filtered by status
  status <task-id>         print a task's metadata
  events <task-id>         print a task's event journal
  input <task-id> <key> <json>
                           deliver input to a paused task
  cancel <task-id>         cancel a task
  recover                  mark tasks left RUNNING/RETRYING by a dead process as PAUSED
  cleanup <task-id>        delete a terminal task's records

environment:
  LONGRUN_STORE_DIR, LONGRUN_CHECKPOINT_POLICY, LONGRUN_SHUTDOWN_GRACE_MS, RUST_LOG";

/// Fails a fixed number of times, then writes a summary.
struct FlakyWriter {
    remaining_failures: AtomicU32,
}

impl FlakyWriter {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Workflow for FlakyWriter {
    async fn run(&self, ctx: WorkflowContext) -> Outcome {
        tokio::time::sleep(Duration::from_millis(50)).await;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Outcome::failed_with("transient", format!("intentional failure (left={left})"));
        }

        if let Err(e) = ctx.checkpoint_step(json!({ "draft": "done" })).await {
            return Outcome::failed(e.to_string());
        }
        Outcome::completed(json!({ "summary": "hello from longrun", "attempt": ctx.attempt() }))
    }
}

fn open_service() -> anyhow::Result<LongLivedTaskService> {
    let store_config = FileStoreConfig::from_env().context("reading store configuration")?;
    let service_config = ServiceConfig::from_env().context("reading service configuration")?;
    tracing::debug!(dir = %store_config.base_dir.display(), "opening file store");

    Ok(LongLivedTaskService::builder(Arc::new(FileTaskStore::new(store_config)))
        .config(service_config)
        .build())
}

fn task_id_arg(args: &[String], i: usize) -> anyhow::Result<TaskId> {
    let raw = args
        .get(i)
        .with_context(|| format!("missing <task-id>\n\n{USAGE}"))?;
    raw.parse()
        .with_context(|| format!("invalid task id {raw:?}"))
}

async fn demo(service: &LongLivedTaskService) -> anyhow::Result<()> {
    // (A) 2 回失敗してから成功する workflow
    let config = TaskConfiguration::new("flaky-writer")
        .with_retry_policy(RetryPolicy::exponential(3, Duration::from_millis(100), 2.0))
        .with_timeout(Duration::from_secs(10))
        .with_context("topic", json!("durable execution"));
    let handle = service.start(config, FlakyWriter::new(2)).await?;
    println!("started {}", handle.task_id());

    let value = handle.await_result(Duration::from_secs(15)).await?;
    println!("completed {}: {value}", handle.task_id());

    // (B) 入力待ちで止まる workflow → 入力を渡して resume
    let approval = |ctx: WorkflowContext| async move {
        match ctx.provided_inputs().await {
            Ok(inputs) => match inputs.get("approval") {
                Some(answer) => Outcome::completed(json!({ "approved": answer })),
                None => Outcome::paused("waiting for a reviewer", "approval"),
            },
            Err(e) => Outcome::failed(e.to_string()),
        }
    };
    let handle = service
        .start(TaskConfiguration::new("approval"), approval)
        .await?;
    match handle.await_result(Duration::from_secs(5)).await {
        Err(TaskError::Paused(signal)) => {
            println!("paused {}: {}", handle.task_id(), signal.reason)
        }
        other => bail!("expected the approval task to pause, got {other:?}"),
    }

    service
        .provide_input(handle.task_id(), "approval", json!("yes"))
        .await?;
    let resumed = service.resume(handle.task_id(), approval, None).await?;
    let value = resumed.await_result(Duration::from_secs(5)).await?;
    println!("resumed and completed {}: {value}", resumed.task_id());
    Ok(())
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let Some(command) = args.get(1) else {
        println!("{USAGE}");
        return Ok(());
    };
    let service = open_service()?;

    match command.as_str() {
        "demo" => {
            let recovered = service.recover_interrupted_tasks().await?;
            if !recovered.is_empty() {
                println!("recovered {} interrupted task(s)", recovered.len());
            }
            let result = demo(&service).await;
            service.shutdown().await;
            result?;
        }
        "list" => {
            let tasks = match args.get(2) {
                Some(raw) => {
                    let status: TaskStatus = raw
                        .parse()
                        .with_context(|| format!("unknown status {raw:?}"))?;
                    service.list_tasks_by_status(status).await?
                }
                None => service.list_tasks().await?,
            };
            for task in tasks {
                println!(
                    "{}  {:<10} {:<16} {}",
                    task.id(),
                    task.status(),
                    task.workflow_name(),
                    task.updated_at().to_rfc3339()
                );
            }
        }
        "status" => {
            let task_id = task_id_arg(&args, 2)?;
            let metadata = service
                .metadata(task_id)
                .await?
                .with_context(|| format!("task not found: {task_id}"))?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        "events" => {
            let task_id = task_id_arg(&args, 2)?;
            for event in service.events(task_id).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        "input" => {
            let task_id = task_id_arg(&args, 2)?;
            let (Some(key), Some(raw)) = (args.get(3), args.get(4)) else {
                bail!("usage: longrun input <task-id> <key> <json>");
            };
            let value = serde_json::from_str(raw).unwrap_or_else(|_| json!(raw));
            service.provide_input(task_id, key.as_str(), value).await?;
            println!("input {key:?} recorded for {task_id}");
        }
        "cancel" => {
            let task_id = task_id_arg(&args, 2)?;
            if service.cancel(task_id).await? {
                println!("cancelled {task_id}");
            } else {
                println!("{task_id} was not cancelled (unknown or already terminal)");
            }
        }
        "recover" => {
            for task_id in service.recover_interrupted_tasks().await? {
                println!("recovered {task_id}");
            }
        }
        "cleanup" => {
            let task_id = task_id_arg(&args, 2)?;
            if service.cleanup(task_id).await? {
                println!("removed {task_id}");
            } else {
                println!("nothing stored for {task_id}");
            }
        }
        other => bail!("unknown command {other:?}\n\n{USAGE}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    run(std::env::args().collect()).await
}
