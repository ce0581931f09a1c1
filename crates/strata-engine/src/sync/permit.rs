//! Scoped ownership of one semaphore unit

use super::semaphore::Semaphore;
use std::fmt;
use std::sync::Arc;

/// One held unit of a [`Semaphore`]'s capacity.
///
/// Released exactly once: by [`SemaphorePermit::unlock`] or on drop,
/// whichever comes first. A default-constructed permit owns nothing.
#[derive(Default)]
#[must_use = "dropping a permit releases it immediately"]
pub struct SemaphorePermit {
    sem: Option<Arc<Semaphore>>,
}

impl SemaphorePermit {
    pub(crate) fn new(sem: Arc<Semaphore>) -> Self {
        Self { sem: Some(sem) }
    }

    /// Whether this permit still holds a unit
    pub fn owns_permit(&self) -> bool {
        self.sem.is_some()
    }

    /// Release the unit now. Does nothing on an empty permit.
    pub fn unlock(&mut self) {
        if let Some(sem) = self.sem.take() {
            sem.release_unit();
        }
    }

    pub(crate) fn belongs_to(&self, sem: &Semaphore) -> bool {
        self.sem
            .as_ref()
            .is_some_and(|own| std::ptr::eq(Arc::as_ptr(own), sem))
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("owns_permit", &self.owns_permit())
            .finish()
    }
}
