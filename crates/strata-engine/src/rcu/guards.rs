//! Reader and writer handles for [`Variable`]

use super::hazard::HazardRecord;
use super::variable::{Snapshot, Variable};
use parking_lot::MutexGuard;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Hazard-protected view of one snapshot.
///
/// Keeps observing the same value even after later commits. Cloning takes a
/// fresh hazard record on the same snapshot.
pub struct ReadablePtr<'a, T: Send + Sync + 'static> {
    var: &'a Variable<T>,
    record: &'a HazardRecord,
    snapshot: *const Snapshot<T>,
}

// SAFETY: the snapshot is immutable and kept alive by the hazard record; all
// access is shared, so the pointer may cross threads like `&T`
unsafe impl<T: Send + Sync + 'static> Send for ReadablePtr<'_, T> {}
unsafe impl<T: Send + Sync + 'static> Sync for ReadablePtr<'_, T> {}

impl<'a, T: Send + Sync + 'static> ReadablePtr<'a, T> {
    pub(crate) fn new(
        var: &'a Variable<T>,
        record: &'a HazardRecord,
        snapshot: *const Snapshot<T>,
    ) -> Self {
        Self {
            var,
            record,
            snapshot,
        }
    }

    fn snapshot(&self) -> &Snapshot<T> {
        // SAFETY: protected by `self.record` until drop
        unsafe { &*self.snapshot }
    }

    /// Version of the pinned snapshot
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub(crate) fn clone_value(&self) -> T
    where
        T: Clone,
    {
        self.snapshot().value.clone()
    }
}

impl<T: Send + Sync + 'static> Deref for ReadablePtr<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.snapshot().value
    }
}

impl<T: Send + Sync + 'static> Clone for ReadablePtr<'_, T> {
    fn clone(&self) -> Self {
        let record = self.var.hazard_list().acquire();
        // Our own record still protects the snapshot, no revalidation needed
        record.protect(self.snapshot as *const ());
        Self {
            var: self.var,
            record,
            snapshot: self.snapshot,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for ReadablePtr<'_, T> {
    fn drop(&mut self) {
        self.var.release_hazard(self.record);
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for ReadablePtr<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadablePtr")
            .field("value", &**self)
            .field("version", &self.version())
            .finish()
    }
}

/// Reference-counted view of one snapshot.
///
/// Does not borrow the variable; copies only touch the reference count.
pub struct SharedReadablePtr<T> {
    snapshot: Arc<Snapshot<T>>,
}

impl<T> SharedReadablePtr<T> {
    pub(crate) fn new(snapshot: Arc<Snapshot<T>>) -> Self {
        Self { snapshot }
    }

    /// Version of the pinned snapshot
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }
}

impl<T> Clone for SharedReadablePtr<T> {
    fn clone(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<T> Deref for SharedReadablePtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.snapshot.value
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedReadablePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedReadablePtr")
            .field("value", &**self)
            .field("version", &self.version())
            .finish()
    }
}

/// Private copy of the value being prepared for publication.
///
/// Holds the variable's writer lock; the lock guard is `!Send`, so a writer
/// cannot be kept open across a suspension point of a `Send` task. Dropping
/// the writer without [`WritablePtr::commit`] discards the copy.
pub struct WritablePtr<'a, T: Send + Sync + 'static> {
    var: &'a Variable<T>,
    _lock: MutexGuard<'a, ()>,
    value: T,
}

impl<'a, T: Send + Sync + 'static> WritablePtr<'a, T> {
    pub(crate) fn new(var: &'a Variable<T>, lock: MutexGuard<'a, ()>, value: T) -> Self {
        Self {
            var,
            _lock: lock,
            value,
        }
    }

    /// Publish the copy as the new current snapshot
    pub fn commit(self) {
        let WritablePtr { var, _lock, value } = self;
        var.publish(value);
    }
}

impl<T: Send + Sync + 'static> Deref for WritablePtr<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Send + Sync + 'static> DerefMut for WritablePtr<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for WritablePtr<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritablePtr").field("value", &self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloned_reader_pins_same_snapshot() {
        let var = Variable::new(10);
        let first = var.read();
        let second = first.clone();
        var.assign(11);
        drop(first);
        var.cleanup();
        // `second` still protects the old snapshot
        assert_eq!(*second, 10);
        assert_eq!(var.pending_reclamation(), 1);
        drop(second);
        var.cleanup();
        assert_eq!(var.pending_reclamation(), 0);
    }

    #[test]
    fn test_reader_is_send() {
        fn assert_send<S: Send>(_: &S) {}
        let var = Variable::new(1u64);
        let reader = var.read();
        assert_send(&reader);
        std::thread::scope(|scope| {
            scope.spawn(move || assert_eq!(*reader, 1));
        });
    }

    #[test]
    fn test_shared_clone_and_version() {
        let var = Variable::new("x".to_string());
        var.assign("y".to_string());
        let shared = var.read_shared();
        let copy = shared.clone();
        assert_eq!(copy.version(), 1);
        assert_eq!(&*copy, "y");
    }
}
