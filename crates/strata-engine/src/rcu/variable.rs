//! Snapshot variable
//!
//! The current snapshot is an `Arc` turned into a raw pointer. Readers protect
//! the pointer with a hazard record instead of touching the reference count;
//! replaced snapshots go to a retired list and are dropped once no hazard
//! record points at them.

use super::guards::{ReadablePtr, SharedReadablePtr, WritablePtr};
use super::hazard::{HazardList, HazardRecord};
use crate::scheduler::current_task;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Where replaced snapshots are destroyed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DestructionType {
    /// Drop them on the writer's (or `cleanup` caller's) thread
    #[default]
    Sync,
    /// Hand them to a detached critical task on the current scheduler.
    /// Falls back to `Sync` outside a task.
    Async,
}

pub(crate) struct Snapshot<T> {
    pub(crate) value: T,
    pub(crate) version: u64,
}

/// Read-mostly value with lock-free reads and serialized writes.
///
/// ```ignore
/// let config = Variable::new(Settings::default());
/// let mut writer = config.start_write();
/// writer.timeout_ms = 500;
/// writer.commit();
/// assert_eq!(config.read().timeout_ms, 500);
/// ```
pub struct Variable<T: Send + Sync + 'static> {
    current: AtomicPtr<Snapshot<T>>,
    hazards: HazardList,
    writer: Mutex<()>,
    retired: Mutex<Vec<Arc<Snapshot<T>>>>,
    destruction: DestructionType,
    version: AtomicU64,
    _owns: PhantomData<Arc<Snapshot<T>>>,
}

impl<T: Send + Sync + 'static> Variable<T> {
    /// Variable holding `value`, destroying old snapshots synchronously
    pub fn new(value: T) -> Self {
        Self::with_destruction(DestructionType::Sync, value)
    }

    /// Variable holding `value` with the given destruction policy
    pub fn with_destruction(destruction: DestructionType, value: T) -> Self {
        let initial = Arc::new(Snapshot { value, version: 0 });
        Self {
            current: AtomicPtr::new(Arc::into_raw(initial) as *mut Snapshot<T>),
            hazards: HazardList::new(),
            writer: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            destruction,
            version: AtomicU64::new(0),
            _owns: PhantomData,
        }
    }

    /// Destruction policy
    pub fn destruction(&self) -> DestructionType {
        self.destruction
    }

    /// Version of the current snapshot; bumped by every commit
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Pin the current snapshot. Never blocks.
    pub fn read(&self) -> ReadablePtr<'_, T> {
        let (record, snapshot) = self.protect();
        ReadablePtr::new(self, record, snapshot)
    }

    /// Copy of the current value
    pub fn read_copy(&self) -> T
    where
        T: Clone,
    {
        self.read().clone_value()
    }

    /// Reference-counted pin of the current snapshot, independent of the
    /// variable and cheap to clone.
    pub fn read_shared(&self) -> SharedReadablePtr<T> {
        let (record, snapshot) = self.protect();
        // SAFETY: the hazard keeps `snapshot` alive, so its strong count is
        // at least one while we add ours
        let shared = unsafe {
            Arc::increment_strong_count(snapshot);
            Arc::from_raw(snapshot)
        };
        self.hazards.release(record);
        SharedReadablePtr::new(shared)
    }

    /// Open a writer holding a private copy of the current value. A second
    /// writer waits until the first one commits or is dropped.
    pub fn start_write(&self) -> WritablePtr<'_, T>
    where
        T: Clone,
    {
        let lock = self.writer.lock();
        let value = self.read().clone_value();
        WritablePtr::new(self, lock, value)
    }

    /// Replace the value without reading it
    pub fn assign(&self, value: T) {
        let _lock = self.writer.lock();
        self.publish(value);
    }

    /// Read-modify-write through a writer
    pub fn update<F>(&self, f: F)
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let mut writer = self.start_write();
        f(&mut writer);
        writer.commit();
    }

    /// Retry reclamation of replaced snapshots. Does not take the writer
    /// lock, so it is safe to call while a writer is open.
    pub fn cleanup(&self) {
        let garbage = self.collect_garbage();
        self.dispose(garbage);
    }

    /// Replaced snapshots still waiting for their readers
    pub fn pending_reclamation(&self) -> usize {
        self.retired.lock().len()
    }

    /// Number of hazard records this variable ever allocated
    pub fn hazard_records(&self) -> usize {
        self.hazards.len()
    }

    /// Publish `value`. The caller holds the writer lock.
    pub(crate) fn publish(&self, value: T) {
        let version = self.version.load(Ordering::Acquire) + 1;
        let fresh = Arc::into_raw(Arc::new(Snapshot { value, version })) as *mut Snapshot<T>;
        let old = self.current.swap(fresh, Ordering::SeqCst);
        self.version.store(version, Ordering::Release);

        // SAFETY: `current` owned one strong count of `old`
        let old = unsafe { Arc::from_raw(old) };
        self.retired.lock().push(old);
        self.cleanup();
    }

    pub(crate) fn hazard_list(&self) -> &HazardList {
        &self.hazards
    }

    pub(crate) fn release_hazard(&self, record: &HazardRecord) {
        self.hazards.release(record);
    }

    /// Load the current snapshot and publish a hazard for it
    fn protect(&self) -> (&HazardRecord, *const Snapshot<T>) {
        let record = self.hazards.acquire();
        loop {
            let snapshot = self.current.load(Ordering::SeqCst);
            record.protect(snapshot as *const ());
            if self.current.load(Ordering::SeqCst) == snapshot {
                return (record, snapshot);
            }
        }
    }

    fn collect_garbage(&self) -> Vec<Arc<Snapshot<T>>> {
        let mut retired = self.retired.lock();
        if retired.is_empty() {
            return Vec::new();
        }
        let protected = self.hazards.protected();
        let (busy, free): (Vec<_>, Vec<_>) = retired
            .drain(..)
            .partition(|snapshot| protected.contains(&(Arc::as_ptr(snapshot) as usize)));
        *retired = busy;
        if !retired.is_empty() {
            tracing::trace!(pending = retired.len(), "snapshots still protected by readers");
        }
        free
    }

    fn dispose(&self, garbage: Vec<Arc<Snapshot<T>>>) {
        if garbage.is_empty() {
            return;
        }
        if self.destruction == DestructionType::Async {
            if let Some(scheduler) = current_task::scheduler() {
                tracing::trace!(count = garbage.len(), "reclaiming snapshots in background");
                scheduler.spawn_critical(async move { drop(garbage) }).detach();
                return;
            }
        }
        drop(garbage);
    }
}

impl<T: Send + Sync + Default + 'static> Default for Variable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Send + Sync + 'static> From<T> for Variable<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Send + Sync + 'static> Drop for Variable<T> {
    fn drop(&mut self) {
        let current = *self.current.get_mut();
        // SAFETY: `current` owns one strong count and no reader can borrow
        // the variable any more
        drop(unsafe { Arc::from_raw(current) });
        self.retired.get_mut().clear();
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("value", &*self.read())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_sees_initial_value() {
        let var = Variable::new(1);
        assert_eq!(*var.read(), 1);
        assert_eq!(var.version(), 0);
        assert_eq!(var.read_copy(), 1);
    }

    #[test]
    fn test_snapshot_isolation() {
        let var = Variable::new(1);
        let before = var.read();
        var.assign(2);
        let after = var.read();
        assert_eq!(*before, 1);
        assert_eq!(*after, 2);
        assert_eq!(after.version(), 1);
        assert_eq!(var.pending_reclamation(), 1);

        drop(before);
        var.cleanup();
        assert_eq!(var.pending_reclamation(), 0);
    }

    #[test]
    fn test_dropped_writer_discards_changes() {
        let var = Variable::new(String::from("a"));
        {
            let mut writer = var.start_write();
            writer.push('b');
            assert_eq!(*writer, "ab");
            assert_eq!(*var.read(), "a");
        }
        assert_eq!(*var.read(), "a");
        assert_eq!(var.version(), 0);

        var.update(|s| s.push('c'));
        assert_eq!(*var.read(), "ac");
    }

    #[test]
    fn test_cleanup_with_open_writer() {
        let var = Variable::new(1);
        let writer = var.start_write();
        var.cleanup();
        writer.commit();
        assert_eq!(*var.read(), 1);
        assert_eq!(var.version(), 1);
    }

    #[test]
    fn test_shared_outlives_variable() {
        let var = Variable::new(vec![1, 2, 3]);
        let shared = var.read_shared();
        drop(var);
        assert_eq!(*shared, vec![1, 2, 3]);
    }
}
