//! ActiveHandles - プロセス内の実行中タスク表
//!
//! service が所有し、worker・cancel 経路・watchdog に明示的に渡す。
//!
//! # 不変条件
//! - 1 タスクにつきエントリは高々 1 つ（最新の実行）
//! - エントリは generation 付き。worker は自分の generation のエントリしか消さない
//!   （resume が入れた新しいエントリを古い worker が消さないため）
//! - 置き換えられた古いエントリの結果スロットは `Superseded` で settle される

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::app::handle::ResultSlot;
use crate::domain::{TaskError, TaskId};

/// What a freshly scheduled execution needs to know about its entry.
pub(crate) struct Registration {
    pub(crate) generation: u64,
    pub(crate) cancel_rx: watch::Receiver<bool>,
}

/// An entry removed from the table at shutdown.
pub(crate) struct Drained {
    pub(crate) task_id: TaskId,
    pub(crate) slot: ResultSlot,
    pub(crate) join: Option<JoinHandle<()>>,
}

struct ActiveEntry {
    generation: u64,
    slot: ResultSlot,
    cancel_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Entries {
    by_task: HashMap<TaskId, ActiveEntry>,
    next_generation: u64,
}

/// Handle table shared (by `Clone`) between the service and its workers.
#[derive(Clone, Default)]
pub struct ActiveHandles {
    entries: Arc<Mutex<Entries>>,
}

impl ActiveHandles {
    /// Installs a new execution for `task_id`, superseding any previous one.
    pub(crate) async fn register(&self, task_id: TaskId, slot: ResultSlot) -> Registration {
        let mut entries = self.entries.lock().await;
        entries.next_generation += 1;
        let generation = entries.next_generation;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let entry = ActiveEntry {
            generation,
            slot,
            cancel_tx,
            join: None,
        };

        if let Some(previous) = entries.by_task.insert(task_id, entry) {
            previous.slot.settle(Err(TaskError::Superseded(task_id)));
            let _ = previous.cancel_tx.send(true);
        }

        Registration {
            generation,
            cancel_rx,
        }
    }

    /// Keeps the worker's JoinHandle for shutdown. Dropped (detached) if the
    /// execution already left the table.
    pub(crate) async fn attach_join(&self, task_id: TaskId, generation: u64, join: JoinHandle<()>) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.by_task.get_mut(&task_id)
            && entry.generation == generation
        {
            entry.join = Some(join);
        }
    }

    /// Removes the entry only if it still belongs to `generation`.
    pub(crate) async fn remove_if_current(&self, task_id: TaskId, generation: u64) -> bool {
        let mut entries = self.entries.lock().await;
        let is_current = entries
            .by_task
            .get(&task_id)
            .is_some_and(|entry| entry.generation == generation);
        if is_current {
            entries.by_task.remove(&task_id);
        }
        is_current
    }

    pub(crate) async fn is_current(&self, task_id: TaskId, generation: u64) -> bool {
        let entries = self.entries.lock().await;
        entries
            .by_task
            .get(&task_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Signals the worker, settles its handle as cancelled and forgets it.
    pub(crate) async fn cancel(&self, task_id: TaskId) -> bool {
        let removed = self.entries.lock().await.by_task.remove(&task_id);
        match removed {
            Some(entry) => {
                let _ = entry.cancel_tx.send(true);
                entry.slot.settle(Err(TaskError::Cancelled(task_id)));
                true
            }
            None => false,
        }
    }

    /// Forgets the entry without signalling anything.
    pub(crate) async fn remove(&self, task_id: TaskId) -> bool {
        self.entries.lock().await.by_task.remove(&task_id).is_some()
    }

    pub(crate) async fn drain(&self) -> Vec<Drained> {
        let mut entries = self.entries.lock().await;
        entries
            .by_task
            .drain()
            .map(|(task_id, entry)| Drained {
                task_id,
                slot: entry.slot,
                join: entry.join,
            })
            .collect()
    }

    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.entries.lock().await.by_task.contains_key(&task_id)
    }

    pub async fn active_ids(&self) -> BTreeSet<TaskId> {
        self.entries.lock().await.by_task.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.by_task.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handle::TaskHandle;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::SystemClock;

    fn new_handle(registry: &ActiveHandles, task_id: TaskId) -> (TaskHandle, ResultSlot) {
        TaskHandle::new(
            task_id,
            Arc::new(InMemoryTaskStore::new()),
            registry.clone(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn stale_generation_cannot_remove_newer_entry() {
        let registry = ActiveHandles::default();
        let id = TaskId::from_u128(1);

        let (_h1, s1) = new_handle(&registry, id);
        let first = registry.register(id, s1).await;
        let (_h2, s2) = new_handle(&registry, id);
        let second = registry.register(id, s2).await;

        assert!(!registry.remove_if_current(id, first.generation).await);
        assert!(registry.contains(id).await);
        assert!(registry.remove_if_current(id, second.generation).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn superseded_entry_settles_and_is_signalled() {
        let registry = ActiveHandles::default();
        let id = TaskId::from_u128(1);

        let (old, s1) = new_handle(&registry, id);
        let first = registry.register(id, s1).await;
        let (_new, s2) = new_handle(&registry, id);
        registry.register(id, s2).await;

        assert_eq!(old.try_result(), Some(Err(TaskError::Superseded(id))));
        assert!(*first.cancel_rx.borrow());
    }

    #[tokio::test]
    async fn cancel_settles_and_removes() {
        let registry = ActiveHandles::default();
        let id = TaskId::from_u128(1);

        let (handle, slot) = new_handle(&registry, id);
        let reg = registry.register(id, slot).await;

        assert!(registry.cancel(id).await);
        assert!(*reg.cancel_rx.borrow());
        assert_eq!(handle.try_result(), Some(Err(TaskError::Cancelled(id))));
        assert!(!registry.cancel(id).await);
    }

    #[tokio::test]
    async fn drain_returns_every_entry() {
        let registry = ActiveHandles::default();
        for n in 1..=3 {
            let (_h, slot) = new_handle(&registry, TaskId::from_u128(n));
            registry.register(TaskId::from_u128(n), slot).await;
        }

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty().await);
    }
}
