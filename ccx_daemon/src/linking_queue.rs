#![deny(clippy::unwrap_used)]

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::{Mutex, Notify};

use crate::task_registry::TaskId;

// Process-global FIFO ensuring only one link-mode task occupies FILE_REQ at
// a time. Link inputs are large; serializing their request phase bounds
// peak memory and avoids saturating upload bandwidth.
pub struct LinkingQueue {
    queue: Mutex<VecDeque<TaskId>>,
    notify: Notify,
}

pub struct LinkTurn {
    queue: Arc<LinkingQueue>,
    task_id: TaskId,
}

impl LinkingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn wait_for_turn(self: &Arc<Self>, task_id: TaskId) -> LinkTurn {
        {
            let mut queue = self.queue.lock().await;
            queue.push_back(task_id);
        }
        loop {
            {
                let queue = self.queue.lock().await;
                if queue.front() == Some(&task_id) {
                    break;
                }
            }
            self.notify.notified().await;
        }
        LinkTurn {
            queue: self.clone(),
            task_id,
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn release(&self, task_id: TaskId) {
        let mut queue = self.queue.lock().await;
        if queue.front() == Some(&task_id) {
            queue.pop_front();
        }
        self.notify.notify_waiters();
    }
}

impl Default for LinkingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinkTurn {
    fn drop(&mut self) {
        let queue = self.queue.clone();
        let task_id = self.task_id;
        // `Drop` can't be async; hand the pop off to a detached task. The
        // queue's own lock still serializes this against new entries, so the
        // only observable effect of the hop is that the next waiter wakes up
        // a task-switch later, not that ordering changes.
        tokio::spawn(async move {
            queue.release(task_id).await;
        });
    }
}
