//! Cancellation path shared by `LongLivedTaskService::cancel`,
//! `TaskHandle::cancel` and the timeout watchdog.

use crate::app::registry::ActiveHandles;
use crate::domain::{StoreError, TaskEvent, TaskEventKind, TaskId, TaskStatus};
use crate::ports::{Clock, TaskExecutionStore};

/// Status reads before giving up on a status that keeps moving.
const CANCEL_READS: usize = 2;

/// CAS the persisted status to `CANCELLED`.
///
/// Returns true only when this call won the CAS. A terminal (or unknown)
/// task yields false and is left untouched.
pub(crate) async fn cancel_task(
    store: &dyn TaskExecutionStore,
    registry: &ActiveHandles,
    clock: &dyn Clock,
    task_id: TaskId,
) -> Result<bool, StoreError> {
    for _ in 0..CANCEL_READS {
        let Some(current) = store.load_metadata(task_id).await? else {
            return Ok(false);
        };
        let status = current.status();
        if status.is_terminal() {
            tracing::debug!(task_id = %task_id, status = %status, "cancel ignored, task is terminal");
            return Ok(false);
        }

        if store
            .compare_and_set_status(task_id, status, TaskStatus::Cancelled, None)
            .await?
            .is_some()
        {
            let journaled = store
                .append_event(&TaskEvent::at(task_id, TaskEventKind::Cancelled, clock.now()))
                .await;
            registry.cancel(task_id).await;
            tracing::info!(task_id = %task_id, from = %status, "task cancelled");
            journaled?;
            return Ok(true);
        }

        tracing::debug!(task_id = %task_id, expected = %status, "status moved during cancel, re-reading");
    }
    Ok(false)
}
