//! LongLivedTaskService - オーケストレータ
//!
//! # 責務
//! - start / resume: メタデータを作って（または CAS して）worker を起動
//! - cancel: 共有の cancel 経路（watchdog と同じ）
//! - 読み取り系: status / metadata / events / list
//! - provide_input, cleanup
//! - 起動時の回復: RUNNING / RETRYING のまま残ったタスクを PAUSED に倒す
//! - shutdown: 猶予期間だけ待ってから残りを abort
//!
//! 正しさの境界は store の CAS。registry はプロセス内の配線でしかない。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::app::cancel::cancel_task;
use crate::app::config::ServiceConfig;
use crate::app::handle::TaskHandle;
use crate::app::registry::ActiveHandles;
use crate::app::watchdog;
use crate::app::worker::Execution;
use crate::domain::{
    CheckpointPolicy, RetryPolicy, ServiceError, StoreError, TaskConfiguration, TaskError,
    TaskEvent, TaskEventKind, TaskId, TaskMetadata, TaskStatus,
};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskExecutionStore, UlidGenerator, Workflow};

/// Paused-event reason written by crash recovery.
pub const RECOVERED_REASON: &str = "Recovered after process restart";

/// Orchestrates executions against one store.
///
/// Cheap to clone; clones share the store and the active-handle table.
///
/// # 使用例
/// ```ignore
/// let service = LongLivedTaskService::builder(Arc::new(InMemoryTaskStore::new())).build();
/// service.recover_interrupted_tasks().await?;
///
/// let handle = service
///     .start(TaskConfiguration::new("writer"), |_ctx: WorkflowContext| async {
///         Outcome::completed("hello")
///     })
///     .await?;
/// let value = handle.await_result(Duration::from_secs(5)).await?;
/// ```
#[derive(Clone)]
pub struct LongLivedTaskService {
    store: Arc<dyn TaskExecutionStore>,
    id_generator: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
    registry: ActiveHandles,
}

/// Wiring for [`LongLivedTaskService`]. Only the store is mandatory.
pub struct ServiceBuilder {
    store: Arc<dyn TaskExecutionStore>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    config: ServiceConfig,
}

impl ServiceBuilder {
    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> LongLivedTaskService {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)) as Arc<dyn IdGenerator>);

        LongLivedTaskService {
            store: self.store,
            id_generator,
            clock,
            config: self.config,
            registry: ActiveHandles::default(),
        }
    }
}

/// Per-execution settings after defaults are applied.
struct ExecutionPlan {
    retry_policy: RetryPolicy,
    checkpoint_policy: CheckpointPolicy,
    timeout: Option<Duration>,
}

impl LongLivedTaskService {
    pub fn builder(store: Arc<dyn TaskExecutionStore>) -> ServiceBuilder {
        ServiceBuilder {
            store,
            id_generator: None,
            clock: None,
            config: ServiceConfig::default(),
        }
    }

    /// Service with default id generator, clock and config.
    pub fn new(store: Arc<dyn TaskExecutionStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn store(&self) -> &Arc<dyn TaskExecutionStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Starts a new task under a generated id. Returns as soon as the worker
    /// is scheduled.
    pub async fn start<W>(
        &self,
        config: TaskConfiguration,
        workflow: W,
    ) -> Result<TaskHandle, ServiceError>
    where
        W: Workflow + 'static,
    {
        let task_id = self.id_generator.generate_task_id();
        self.start_with_id(task_id, config, workflow).await
    }

    /// Starts a new task under a caller-chosen id. The id must be unused;
    /// of several concurrent starts with one id, exactly one succeeds.
    pub async fn start_with_id<W>(
        &self,
        task_id: TaskId,
        config: TaskConfiguration,
        workflow: W,
    ) -> Result<TaskHandle, ServiceError>
    where
        W: Workflow + 'static,
    {
        let metadata = TaskMetadata::create(
            task_id,
            config.workflow_name.clone(),
            config.context.clone(),
            self.clock.now(),
        );
        if !self.store.create_metadata(&metadata).await? {
            let status = self.status(task_id).await?.unwrap_or(TaskStatus::Running);
            return Err(ServiceError::illegal_state(
                task_id,
                status,
                format!("Cannot start task {task_id}: it already exists in state {status}"),
            ));
        }
        self.append(task_id, TaskEventKind::Started).await?;
        tracing::info!(task_id = %task_id, workflow = %config.workflow_name, "task started");

        let plan = self.plan(Some(&config));
        Ok(self.schedule(task_id, Arc::new(workflow), plan).await)
    }

    /// Cancels a non-terminal task. False when it was already terminal,
    /// unknown, or another transition won.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, ServiceError> {
        Ok(cancel_task(
            self.store.as_ref(),
            &self.registry,
            self.clock.as_ref(),
            task_id,
        )
        .await?)
    }

    /// Re-runs a `PAUSED` or `FAILED` task with a fresh handle.
    ///
    /// Without `config` the run uses the service's default checkpoint policy,
    /// no retries and no timeout.
    pub async fn resume<W>(
        &self,
        task_id: TaskId,
        workflow: W,
        config: Option<TaskConfiguration>,
    ) -> Result<TaskHandle, ServiceError>
    where
        W: Workflow + 'static,
    {
        let metadata = self
            .store
            .load_metadata(task_id)
            .await?
            .ok_or(ServiceError::NotFound(task_id))?;

        let status = metadata.status();
        match status {
            TaskStatus::Paused | TaskStatus::Failed => {}
            TaskStatus::Running | TaskStatus::Retrying => {
                return Err(ServiceError::illegal_state(
                    task_id,
                    status,
                    format!(
                        "Cannot resume task {task_id} that is already {status}; cancel it first or wait for it to finish"
                    ),
                ));
            }
            TaskStatus::Completed | TaskStatus::Cancelled => {
                return Err(ServiceError::illegal_state(
                    task_id,
                    status,
                    format!("Cannot resume task {task_id} in state: {status}"),
                ));
            }
        }

        // 二重 resume はここで片方だけが勝つ
        if self
            .store
            .compare_and_set_status(task_id, status, TaskStatus::Running, None)
            .await?
            .is_none()
        {
            let now = self.status(task_id).await?.unwrap_or(status);
            return Err(ServiceError::illegal_state(
                task_id,
                now,
                format!("Cannot resume task {task_id}: concurrent transition already in progress"),
            ));
        }

        self.append(task_id, TaskEventKind::Resumed).await?;
        tracing::info!(task_id = %task_id, from = %status, "task resumed");

        let plan = self.plan(config.as_ref());
        Ok(self.schedule(task_id, Arc::new(workflow), plan).await)
    }

    pub async fn status(&self, task_id: TaskId) -> Result<Option<TaskStatus>, ServiceError> {
        Ok(self
            .store
            .load_metadata(task_id)
            .await?
            .map(|m| m.status()))
    }

    pub async fn metadata(&self, task_id: TaskId) -> Result<Option<TaskMetadata>, ServiceError> {
        Ok(self.store.load_metadata(task_id).await?)
    }

    pub async fn events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, ServiceError> {
        Ok(self.store.load_events(task_id).await?)
    }

    /// Every stored task, in id order.
    pub async fn list_tasks(&self) -> Result<Vec<TaskMetadata>, ServiceError> {
        let ids = self.store.task_ids().await?;
        self.load_all(ids).await
    }

    pub async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<TaskMetadata>, ServiceError> {
        let ids = self.store.task_ids_by_status(status).await?;
        self.load_all(ids).await
    }

    /// Ids of executions running in this process.
    pub async fn active_task_ids(&self) -> BTreeSet<TaskId> {
        self.registry.active_ids().await
    }

    /// Records an input for a paused task. Does not resume it.
    pub async fn provide_input(
        &self,
        task_id: TaskId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), ServiceError> {
        let status = self
            .status(task_id)
            .await?
            .ok_or(ServiceError::NotFound(task_id))?;
        if status != TaskStatus::Paused {
            return Err(ServiceError::illegal_state(
                task_id,
                status,
                format!("Cannot provide input to task {task_id} that is not paused (state: {status})"),
            ));
        }

        let key = key.into();
        self.append(
            task_id,
            TaskEventKind::InputProvided {
                key: key.clone(),
                value,
            },
        )
        .await?;
        tracing::info!(task_id = %task_id, %key, "input provided");
        Ok(())
    }

    /// Deletes a terminal task's records. False if there was nothing to delete.
    pub async fn cleanup(&self, task_id: TaskId) -> Result<bool, ServiceError> {
        if let Some(status) = self.status(task_id).await?
            && !status.is_terminal()
        {
            return Err(ServiceError::illegal_state(
                task_id,
                status,
                format!("Cannot clean up task {task_id} while it is {status}"),
            ));
        }

        self.registry.remove(task_id).await;
        let removed = self.store.delete(task_id).await?;
        if removed {
            tracing::info!(task_id = %task_id, "task cleaned up");
        }
        Ok(removed)
    }

    /// Moves every `RUNNING`/`RETRYING` record not owned by this process to
    /// `PAUSED`. Call once at startup.
    pub async fn recover_interrupted_tasks(&self) -> Result<BTreeSet<TaskId>, ServiceError> {
        let mut recovered = BTreeSet::new();
        for status in [TaskStatus::Running, TaskStatus::Retrying] {
            for task_id in self.store.task_ids_by_status(status).await? {
                if self.registry.contains(task_id).await {
                    continue;
                }

                let swapped = self
                    .store
                    .compare_and_set_status(task_id, status, TaskStatus::Paused, None)
                    .await?;
                if swapped.is_none() {
                    tracing::warn!(task_id = %task_id, expected = %status, "recovery lost a status race, skipping");
                    continue;
                }

                self.append(
                    task_id,
                    TaskEventKind::Paused {
                        reason: RECOVERED_REASON.to_string(),
                        input_key: None,
                    },
                )
                .await?;
                tracing::info!(task_id = %task_id, from = %status, "recovered interrupted task as PAUSED");
                recovered.insert(task_id);
            }
        }
        Ok(recovered)
    }

    /// [`LongLivedTaskService::shutdown_with_grace`] with the configured grace.
    pub async fn shutdown(&self) -> Vec<TaskId> {
        self.shutdown_with_grace(self.config.shutdown_grace).await
    }

    /// Waits up to `grace` for in-flight executions, then aborts the rest.
    ///
    /// Aborted tasks keep their persisted status and are picked up by
    /// `recover_interrupted_tasks` on the next start. Returns their ids.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> Vec<TaskId> {
        let deadline = tokio::time::Instant::now() + grace;
        let drained = self.registry.drain().await;
        tracing::info!(in_flight = drained.len(), grace_ms = grace.as_millis() as u64, "shutting down");

        let mut aborted = Vec::new();
        for entry in drained {
            let Some(mut join) = entry.join else {
                continue;
            };
            if tokio::time::timeout_at(deadline, &mut join).await.is_ok() {
                continue;
            }

            join.abort();
            entry.slot.settle(Err(TaskError::Aborted {
                task_id: entry.task_id,
                reason: "service shut down".to_string(),
            }));
            tracing::warn!(task_id = %entry.task_id, "execution aborted at shutdown");
            aborted.push(entry.task_id);
        }
        aborted
    }

    fn plan(&self, config: Option<&TaskConfiguration>) -> ExecutionPlan {
        let default_checkpoint = self.config.default_checkpoint_policy;
        match config {
            Some(config) => ExecutionPlan {
                retry_policy: config.retry_policy.clone(),
                checkpoint_policy: config.checkpoint_policy.unwrap_or(default_checkpoint),
                timeout: config.timeout,
            },
            None => ExecutionPlan {
                retry_policy: RetryPolicy::none(),
                checkpoint_policy: default_checkpoint,
                timeout: None,
            },
        }
    }

    async fn schedule(
        &self,
        task_id: TaskId,
        workflow: Arc<dyn Workflow>,
        plan: ExecutionPlan,
    ) -> TaskHandle {
        let (handle, slot) = TaskHandle::new(
            task_id,
            Arc::clone(&self.store),
            self.registry.clone(),
            Arc::clone(&self.clock),
        );
        let registration = self.registry.register(task_id, slot.clone()).await;

        let done = plan.timeout.map(|timeout| {
            let (done_tx, done_rx) = oneshot::channel();
            watchdog::spawn(
                Arc::clone(&self.store),
                self.registry.clone(),
                Arc::clone(&self.clock),
                task_id,
                registration.generation,
                timeout,
                done_rx,
            );
            done_tx
        });

        let execution = Execution {
            task_id,
            generation: registration.generation,
            workflow,
            retry_policy: plan.retry_policy,
            checkpoint_policy: plan.checkpoint_policy,
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            registry: self.registry.clone(),
            slot,
            cancel_rx: registration.cancel_rx,
            _done: done,
        };
        let join = tokio::spawn(execution.run());
        self.registry
            .attach_join(task_id, registration.generation, join)
            .await;
        handle
    }

    async fn load_all(&self, ids: BTreeSet<TaskId>) -> Result<Vec<TaskMetadata>, ServiceError> {
        let mut tasks = Vec::with_capacity(ids.len());
        for task_id in ids {
            if let Some(metadata) = self.store.load_metadata(task_id).await? {
                tasks.push(metadata);
            }
        }
        Ok(tasks)
    }

    async fn append(&self, task_id: TaskId, kind: TaskEventKind) -> Result<(), StoreError> {
        self.store
            .append_event(&TaskEvent::at(task_id, kind, self.clock.now()))
            .await
    }
}

impl std::fmt::Debug for LongLivedTaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongLivedTaskService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
