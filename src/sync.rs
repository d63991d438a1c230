//! Coordination primitives shared by the builder and the search engine
//!
//! Both pipelines fan work out to thread pools and restore order on the way
//! back in: the builder re-orders plane results by plane id and block
//! summaries by batch id, the search engine re-orders query results by query
//! index. Artifact opens during a build are gated by a counting semaphore so
//! deep worker nesting cannot exhaust file descriptors.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore built on parking_lot primitives
///
/// Guards are RAII: a permit is released when the guard drops, including on
/// unwind, so an erroring worker never leaks its file-descriptor budget.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}
impl Semaphore {
    #[must_use]
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0);
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and takes it
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        drop(permits);
        self.available.notify_one();
    }
}

/// RAII permit handle returned by [`Semaphore::acquire`]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}
impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Restores a total order over items that arrive tagged but out of order
///
/// Items are pushed with their sequence id; `pop_ready` hands back the item
/// for the current cursor position, if it has arrived, and advances the
/// cursor. The buffer only ever holds the items of the reordering window.
pub struct ReorderBuffer<T> {
    pending: HashMap<u64, T>,
    cursor: u64,
}
impl<T> ReorderBuffer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            cursor: 0,
        }
    }

    /// The next sequence id the buffer will release
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, id: u64, item: T) {
        self.pending.insert(id, item);
    }

    /// Releases the item at the cursor, if present
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.cursor)?;
        self.cursor += 1;
        Some(item)
    }

    /// Drains whatever is left, sorted by sequence id
    ///
    /// Used at shutdown: if producers skipped ids (cancellation), the tail
    /// still comes out in a deterministic order.
    pub fn into_remaining(self) -> Vec<(u64, T)> {
        let mut items: Vec<_> = self.pending.into_iter().collect();
        items.sort_by_key(|(id, _)| *id);
        items
    }
}
impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
