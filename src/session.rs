//! Session bookkeeping shared by the proxy strategies.
//!
//! # Locking
//!
//! ```text
//! SessionTable
//! ├── slots: std Mutex<HashMap<PodId, Arc<tokio Mutex<Option<S>>>>>
//! │          held only to look up / insert / remove a slot, never across .await
//! └── current: std Mutex<Option<PodId>>
//!
//! register/unregister/connect on pod P  ──►  lock slot(P) for the whole operation
//! ```
//!
//! Lifecycle operations on the same pod queue on the slot mutex. Different
//! pods have different slots and run concurrently. A slot holding `None`
//! means "no session"; the last guard to leave it empty removes it.

use crate::constants::FIRST_STREAM_ID;
use crate::pod::PodId;
use crate::stream::StreamIds;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type Slot<S> = Arc<tokio::sync::Mutex<Option<S>>>;
type SlotMap<S> = Arc<Mutex<HashMap<PodId, Slot<S>>>>;

fn lock_map<S>(slots: &SlotMap<S>) -> std::sync::MutexGuard<'_, HashMap<PodId, Slot<S>>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive access to one pod's session slot.
///
/// Dropping the guard while the slot is empty removes the slot, unless
/// another operation is already waiting on it.
pub struct SessionGuard<S> {
    guard: OwnedMutexGuard<Option<S>>,
    slots: SlotMap<S>,
    id: PodId,
}

impl<S> Deref for SessionGuard<S> {
    type Target = Option<S>;

    fn deref(&self) -> &Option<S> {
        &self.guard
    }
}

impl<S> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut Option<S> {
        &mut self.guard
    }
}

impl<S> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            return;
        }
        let mut slots = lock_map(&self.slots);
        // Slot clones are only made under the map lock: one for the map,
        // one held by this guard.
        let ours = OwnedMutexGuard::mutex(&self.guard);
        let unshared = slots
            .get(&self.id)
            .is_some_and(|slot| Arc::ptr_eq(slot, ours) && Arc::strong_count(slot) == 2);
        if unshared {
            slots.remove(&self.id);
        }
    }
}

/// Per-pod session table.
pub struct SessionTable<S> {
    slots: SlotMap<S>,
    current: Mutex<Option<PodId>>,
}

impl<S: Send + 'static> SessionTable<S> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::default(),
            current: Mutex::new(None),
        }
    }

    /// Locks the slot for `id`, creating an empty one if needed.
    ///
    /// Waits while another lifecycle operation holds the same pod.
    pub async fn lock(&self, id: PodId) -> SessionGuard<S> {
        let slot = Arc::clone(lock_map(&self.slots).entry(id).or_default());
        SessionGuard {
            guard: slot.lock_owned().await,
            slots: Arc::clone(&self.slots),
            id,
        }
    }

    /// Returns the slots of every known pod.
    ///
    /// Callers lock them one at a time.
    pub fn slots(&self) -> Vec<(PodId, Slot<S>)> {
        lock_map(&self.slots)
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect()
    }

    /// Number of slots currently tracked, live or not.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        lock_map(&self.slots).len()
    }

    /// Marks `id` as the session `send_cmd` talks to.
    pub fn set_current(&self, id: PodId) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    /// Returns the current session's pod, if any.
    #[must_use]
    pub fn current(&self) -> Option<PodId> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clears the current session if it is `id`.
    pub fn clear_current_if(&self, id: PodId) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if *current == Some(id) {
            *current = None;
        }
    }

    /// Clears the current session unconditionally.
    pub fn clear_current(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl<S: Send + 'static> Default for SessionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Stream ID Allocation
// =============================================================================

/// Tracks which stream ids are live in one session.
///
/// Local strategies call [`allocate`](Self::allocate); strategies where the
/// remote side assigns ids call [`reserve`](Self::reserve) so duplicates
/// are caught before any bytes are routed.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: u64,
    live: HashSet<u64>,
}

impl StreamIdAllocator {
    /// Creates an allocator with no live ids.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: FIRST_STREAM_ID,
            live: HashSet::new(),
        }
    }

    fn next_free(&mut self) -> u64 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1).max(FIRST_STREAM_ID);
            if !self.live.contains(&id) {
                return id;
            }
        }
    }

    /// Allocates three fresh ids.
    pub fn allocate(&mut self) -> StreamIds {
        let stdin = self.next_free();
        self.live.insert(stdin);
        let stdout = self.next_free();
        self.live.insert(stdout);
        let stderr = self.next_free();
        self.live.insert(stderr);
        StreamIds {
            stdin,
            stdout,
            stderr,
        }
    }

    /// Records externally assigned ids.
    ///
    /// # Errors
    ///
    /// Returns the first id that is zero, repeated within the triple, or
    /// already live. Nothing is recorded on error.
    pub fn reserve(&mut self, ids: StreamIds) -> Result<(), u64> {
        let arr = ids.as_array();
        let taken = arr
            .iter()
            .find(|id| **id < FIRST_STREAM_ID || self.live.contains(*id));
        if let Some(id) = taken {
            return Err(*id);
        }
        if ids.has_internal_duplicate() {
            return Err(if ids.stdin == ids.stdout || ids.stdin == ids.stderr {
                ids.stdin
            } else {
                ids.stdout
            });
        }
        self.live.extend(arr);
        Ok(())
    }

    /// Returns ids to the pool.
    pub fn release(&mut self, ids: StreamIds) {
        for id in ids.as_array() {
            self.live.remove(&id);
        }
    }

    /// Returns true if `id` is live.
    #[must_use]
    pub fn is_live(&self, id: u64) -> bool {
        self.live.contains(&id)
    }

    /// Number of live ids.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_allocate_distinct() {
        let mut alloc = StreamIdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            for id in alloc.allocate().as_array() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(alloc.live_count(), 300);
    }

    #[test]
    fn test_allocate_skips_live_after_wrap() {
        let mut alloc = StreamIdAllocator::new();
        let first = alloc.allocate();
        alloc.next = FIRST_STREAM_ID;
        let second = alloc.allocate();
        for id in second.as_array() {
            assert!(!first.as_array().contains(&id));
        }
    }

    #[test]
    fn test_reserve_rejects_duplicates() {
        let mut alloc = StreamIdAllocator::new();
        let ids = StreamIds { stdin: 10, stdout: 11, stderr: 12 };
        alloc.reserve(ids).unwrap();
        let reused = StreamIds { stdin: 13, stdout: 11, stderr: 14 };
        assert_eq!(alloc.reserve(reused), Err(11));
        assert!(!alloc.is_live(13), "failed reserve must not record anything");
        let repeated = StreamIds { stdin: 20, stdout: 20, stderr: 21 };
        assert_eq!(alloc.reserve(repeated), Err(20));
        let zero = StreamIds { stdin: 0, stdout: 1, stderr: 2 };
        assert_eq!(alloc.reserve(zero), Err(0));

        alloc.release(ids);
        assert_eq!(alloc.live_count(), 0);
        alloc.reserve(ids).unwrap();
    }

    #[tokio::test]
    async fn test_lock_serializes_same_pod() {
        let table: Arc<SessionTable<u32>> = Arc::new(SessionTable::new());
        let id = PodId::new("p");

        let guard = table.lock(id).await;
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                let mut g = table.lock(id).await;
                *g = Some(2);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different pod is not blocked.
        *table.lock(PodId::new("q")).await = Some(9);

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(*table.lock(id).await, Some(2));
    }

    #[tokio::test]
    async fn test_empty_slots_removed_on_release() {
        let table: SessionTable<u32> = SessionTable::new();
        *table.lock(PodId::new("live")).await = Some(1);
        for i in 0..100 {
            drop(table.lock(PodId::new(format!("miss-{i}"))).await);
        }
        assert_eq!(table.slot_count(), 1);

        // Emptying a live slot removes it too.
        table.lock(PodId::new("live")).await.take();
        assert_eq!(table.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_slot_kept_for_waiter() {
        let table: Arc<SessionTable<u32>> = Arc::new(SessionTable::new());
        let id = PodId::new("p");

        let guard = table.lock(id).await;
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                *table.lock(id).await = Some(7);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(table.slot_count(), 1);
        assert_eq!(*table.lock(id).await, Some(7));
    }

    #[test]
    fn test_current_tracking() {
        let table: SessionTable<()> = SessionTable::new();
        let a = PodId::new("a");
        let b = PodId::new("b");
        table.set_current(a);
        table.clear_current_if(b);
        assert_eq!(table.current(), Some(a));
        table.clear_current_if(a);
        assert_eq!(table.current(), None);
    }
}
