#![deny(clippy::unwrap_used)]

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Semaphore, task::JoinHandle};

// Immediate is reserved for timeout, cancellation, and notification cleanup;
// everything else uses High down to Min.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Min,
    Low,
    Medium,
    High,
    Immediate,
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    // Per-named-thread serialization locks: a tokio::sync::Mutex is FIFO
    // over its waiters, so queuing closures for the same ThreadId here
    // gives them program order.
    thread_locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

pub struct PeriodicHandle {
    abort: tokio::task::AbortHandle,
}

impl PeriodicHandle {
    pub fn cancel(self) {
        self.abort.abort();
    }
}

impl WorkerPool {
    pub fn new(num: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(num)),
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    // Priority only affects ordering among closures waiting on the same
    // pool; once a closure has acquired its permit it runs to completion
    // regardless of later higher-priority submissions.
    pub fn run_closure<F, Fut, Out>(&self, f: F, priority: Priority) -> JoinHandle<Out>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Out> + Send + 'static,
        Out: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        // Immediate work skips the acquire entirely: it must not be
        // head-of-line blocked behind ordinary work holding every permit.
        if priority == Priority::Immediate {
            return tokio::task::spawn(async move { f().await });
        }
        tokio::task::spawn(async move {
            // The pool never closes its semaphore; `acquire_owned` only
            // errs if it does.
            let _permit = semaphore.acquire_owned().await.ok();
            f().await
        })
    }

    pub fn run_closure_in_thread<F, Fut, Out>(
        &self,
        thread_id: ThreadId,
        f: F,
        priority: Priority,
    ) -> JoinHandle<Out>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Out> + Send + 'static,
        Out: Send + 'static,
    {
        let lane = self
            .thread_locks
            .lock()
            .entry(thread_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let semaphore = self.semaphore.clone();
        tokio::task::spawn(async move {
            let _lane_guard = lane.lock().await;
            let _permit = if priority == Priority::Immediate {
                None
            } else {
                semaphore.acquire_owned().await.ok()
            };
            f().await
        })
    }

    pub fn run_delayed_closure_in_thread<F, Fut, Out>(
        &self,
        thread_id: ThreadId,
        delay: Duration,
        f: F,
    ) -> JoinHandle<Out>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Out> + Send + 'static,
        Out: Send + 'static,
    {
        self.run_closure_in_thread(
            thread_id,
            move || async move {
                tokio::time::sleep(delay).await;
                f().await
            },
            Priority::Medium,
        )
    }

    pub fn run_periodic<F, Fut>(&self, period: Duration, mut f: F) -> PeriodicHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                f().await;
            }
        });
        PeriodicHandle {
            abort: handle.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn run_closure_respects_concurrency_cap() {
        let pool = Arc::new(WorkerPool::new(2));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(pool.run_closure(
                move || async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                },
                Priority::Medium,
            ));
        }
        for handle in handles {
            handle.await.expect("task completes");
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn thread_lane_serializes_closures_in_order() {
        let pool = Arc::new(WorkerPool::new(4));
        let order = Arc::new(Mutex::new(vec![]));
        let mut handles = vec![];
        for i in 0..5 {
            let order = order.clone();
            handles.push(pool.run_closure_in_thread(
                ThreadId(1),
                move || async move {
                    order.lock().push(i);
                },
                Priority::Medium,
            ));
        }
        for handle in handles {
            handle.await.expect("task completes");
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn periodic_handle_stops_after_cancel() {
        let pool = WorkerPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = pool.run_periodic(Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
        let seen_after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen_after_cancel);
        assert!(seen_after_cancel >= 2);
    }
}
