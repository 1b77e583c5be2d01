#![deny(clippy::unwrap_used)]

use std::sync::atomic::{AtomicU64, Ordering};

// Process-wide budget for output bytes staged in memory rather than via a
// tmpfile.
pub struct OutputBufferPool {
    budget_bytes: u64,
    used_bytes: AtomicU64,
}

pub struct BufferReservation<'a> {
    pool: &'a OutputBufferPool,
    size: u64,
}

impl OutputBufferPool {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            used_bytes: AtomicU64::new(0),
        }
    }

    // Returns None if this would exceed the budget; caller falls back to
    // tmpfile staging.
    pub fn try_reserve(&self, size: u64) -> Option<BufferReservation<'_>> {
        let mut current = self.used_bytes.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size)?;
            if next > self.budget_bytes {
                return None;
            }
            match self.used_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(BufferReservation { pool: self, size }),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }
}

impl Drop for BufferReservation<'_> {
    fn drop(&mut self) {
        self.pool.used_bytes.fetch_sub(self.size, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_within_budget_succeeds_and_releases_on_drop() {
        let pool = OutputBufferPool::new(1024);
        {
            let _reservation = pool.try_reserve(512).expect("fits in budget");
            assert_eq!(pool.used_bytes(), 512);
        }
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn reservation_exceeding_budget_fails() {
        let pool = OutputBufferPool::new(100);
        assert!(pool.try_reserve(200).is_none());
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn sequential_reservations_respect_shared_budget() {
        let pool = OutputBufferPool::new(100);
        let first = pool.try_reserve(60).expect("first fits");
        assert!(pool.try_reserve(60).is_none());
        drop(first);
        assert!(pool.try_reserve(60).is_some());
    }
}
