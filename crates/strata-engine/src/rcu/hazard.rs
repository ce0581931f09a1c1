//! Hazard registry: which snapshots readers are looking at
//!
//! Records are pushed onto a lock-free list and never unlinked while the
//! owning variable lives; a released record is reused by the next reader.
//! Each thread remembers the last record it released, tagged with the id of
//! the variable instance it belongs to.

use rustc_hash::FxHashSet;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (instance id, record address) of the last record this thread released
    static CACHED_RECORD: Cell<(u64, usize)> = const { Cell::new((0, 0)) };
}

pub(crate) struct HazardRecord {
    protected: AtomicPtr<()>,
    in_use: AtomicBool,
    next: AtomicPtr<HazardRecord>,
}

impl HazardRecord {
    fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn protect(&self, ptr: *const ()) {
        self.protected.store(ptr as *mut (), Ordering::SeqCst);
    }
}

pub(crate) struct HazardList {
    instance: u64,
    head: AtomicPtr<HazardRecord>,
}

impl HazardList {
    pub(crate) fn new() -> Self {
        Self {
            instance: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Claim a free record, allocating one if every record is busy
    pub(crate) fn acquire(&self) -> &HazardRecord {
        let (instance, address) = CACHED_RECORD.with(|c| c.get());
        if instance == self.instance && address != 0 {
            // SAFETY: records of this instance live as long as `self`
            let record = unsafe { &*(address as *const HazardRecord) };
            if record.try_claim() {
                return record;
            }
        }

        for record in self.iter() {
            if record.try_claim() {
                return record;
            }
        }

        let record = Box::into_raw(Box::new(HazardRecord {
            protected: AtomicPtr::new(ptr::null_mut()),
            in_use: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `record` is not yet shared
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange(head, record, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        // SAFETY: published records are freed only in `Drop`
        unsafe { &*record }
    }

    /// Give a record back and remember it for this thread
    pub(crate) fn release(&self, record: &HazardRecord) {
        record.protected.store(ptr::null_mut(), Ordering::SeqCst);
        record.in_use.store(false, Ordering::Release);
        let address = record as *const HazardRecord as usize;
        CACHED_RECORD.with(|c| c.set((self.instance, address)));
    }

    /// Addresses currently protected by some reader
    pub(crate) fn protected(&self) -> FxHashSet<usize> {
        self.iter()
            .map(|record| record.protected.load(Ordering::SeqCst) as usize)
            .filter(|&address| address != 0)
            .collect()
    }

    /// Number of records ever allocated
    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }

    fn iter(&self) -> impl Iterator<Item = &HazardRecord> + '_ {
        let mut cursor = self.head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if cursor.is_null() {
                return None;
            }
            // SAFETY: published records are freed only in `Drop`
            let record = unsafe { &*cursor };
            cursor = record.next.load(Ordering::Acquire);
            Some(record)
        })
    }
}

impl Drop for HazardList {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: we own every record and nobody can borrow them any more
            let record = unsafe { Box::from_raw(cursor) };
            cursor = record.next.load(Ordering::Relaxed);
        }
    }
}
