#![deny(clippy::unwrap_used)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;

use crate::trace::TraceId;

// Callbacks capture the id and re-resolve through the registry instead of
// holding a cyclic reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: TaskId,
    pub trace_id: TraceId,
    pub state: String,
    pub short_name: String,
}

struct TaskEntry {
    refcount: AtomicUsize,
    summary: RwLock<TaskSummary>,
}

// The creating IPC handler holds one reference; the engine holds a second
// for as long as the task is non-terminal. Entry drops once both release.
pub struct TaskRegistry {
    next_id: AtomicU64,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
}

pub struct TaskHandle {
    registry: Arc<TaskRegistry>,
    id: TaskId,
    entry: Arc<TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(self: &Arc<Self>, trace_id: TraceId, short_name: String) -> TaskHandle {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(TaskEntry {
            refcount: AtomicUsize::new(1),
            summary: RwLock::new(TaskSummary {
                id,
                trace_id,
                state: "INIT".to_string(),
                short_name,
            }),
        });
        self.tasks.write().insert(id, entry.clone());
        TaskHandle {
            registry: self.clone(),
            id,
            entry,
        }
    }

    pub fn set_state(&self, id: TaskId, state: &str) {
        if let Some(entry) = self.tasks.read().get(&id) {
            entry.summary.write().state = state.to_string();
        }
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks
            .read()
            .values()
            .map(|entry| entry.summary.read().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_if_orphaned(&self, id: TaskId) {
        let mut tasks = self.tasks.write();
        if let Some(entry) = tasks.get(&id) {
            if entry.refcount.load(Ordering::Acquire) == 0 {
                tasks.remove(&id);
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn clone_ref(&self) -> TaskHandle {
        self.entry.refcount.fetch_add(1, Ordering::AcqRel);
        TaskHandle {
            registry: self.registry.clone(),
            id: self.id,
            entry: self.entry.clone(),
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.entry.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.registry.remove_if_orphaned(self.id);
        }
    }
}
