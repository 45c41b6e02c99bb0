use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry;
use dashmap::DashMap;
use fnv::FnvBuildHasher;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Resource not found in the table")]
    NotFound,
    #[error("Resource exists in the table")]
    Exists,
    #[error("Resource still has {0} open references")]
    Busy(usize),
    #[error("Resource has been closed")]
    Closed,
}

/// A table mapping a key to a shared resource. Every entry carries its own
/// reference count, so inserting the same key twice collapses into one entry
/// that must be closed twice.
#[derive(Debug)]
pub struct ResourceTableGeneric<K: Eq + Hash, R> {
    table: DashMap<K, Entry<R>, FnvBuildHasher>,
}

impl<K: Eq + Hash, R> Default for ResourceTableGeneric<K, R> {
    fn default() -> Self {
        ResourceTableGeneric {
            table: DashMap::default(),
        }
    }
}

#[derive(Debug)]
pub struct Entry<R> {
    refcnt: AtomicUsize,
    data: Arc<R>,
}

impl<R> Entry<R> {
    fn new(data: Arc<R>, refcnt: usize) -> Self {
        Entry {
            refcnt: AtomicUsize::new(refcnt),
            data,
        }
    }

    #[inline]
    pub fn data(&self) -> Arc<R> {
        Arc::clone(&self.data)
    }

    #[inline]
    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// `Open` means to increment the reference count.
    #[inline]
    pub fn open(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if the resource has no more references to it.
    #[inline]
    pub fn close(&self) -> bool {
        self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl<K: Eq + Hash, R> ResourceTableGeneric<K, R> {
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn insert(&self, h: K, r: Arc<R>) -> Result<(), Error> {
        match self.table.entry(h) {
            entry::Entry::Occupied(_) => Err(Error::Exists),
            entry::Entry::Vacant(e) => {
                e.insert(Entry::new(r, 1));
                Ok(())
            }
        }
    }

    pub fn get(&self, h: &K) -> Result<Arc<R>, Error> {
        self.table.get(h).map(|r| r.data()).ok_or(Error::NotFound)
    }

    pub fn refcnt(&self, h: &K) -> Result<usize, Error> {
        self.table.get(h).map(|r| r.refcnt()).ok_or(Error::NotFound)
    }

    /// Returns the resource stored under `h`, creating it with `init` on a
    /// miss. The lookup and the insertion happen under the same shard lock.
    pub fn get_or_insert_with<F>(&self, h: K, init: F) -> Arc<R>
    where
        F: FnOnce() -> Arc<R>,
    {
        match self.table.entry(h) {
            entry::Entry::Occupied(e) => e.get().data(),
            entry::Entry::Vacant(e) => {
                let data = init();
                e.insert(Entry::new(Arc::clone(&data), 1));
                data
            }
        }
    }

    /// Increments the reference count of an existing entry, or inserts the
    /// resource with a reference count of one. Returns the resulting count.
    pub fn open_or_create_resource(&self, h: K, r: Arc<R>) -> usize {
        match self.table.entry(h) {
            entry::Entry::Occupied(e) => {
                e.get().open();
                e.get().refcnt()
            }
            entry::Entry::Vacant(e) => {
                e.insert(Entry::new(r, 1));
                1
            }
        }
    }

    /// Reduces the reference counter by one. Returns the resource when it is the last instance
    /// in the table.
    pub fn close_resource(&self, h: &K) -> Result<Option<Arc<R>>, Error> {
        // The decrement and the removal happen under the shard's write lock.
        let mut found = false;
        let removed = self.table.remove_if(h, |_, r| {
            found = true;
            r.close()
        });
        if !found {
            return Err(Error::NotFound);
        }
        Ok(removed.map(|(_, r)| r.data))
    }

    /// Removes the entry regardless of its reference count.
    pub fn remove(&self, h: &K) -> Option<Arc<R>> {
        self.table.remove(h).map(|(_, r)| r.data)
    }

    /// Clones out every resource so that callers can work on them without
    /// holding any shard lock.
    pub fn snapshot(&self) -> Vec<Arc<R>> {
        self.table.iter().map(|r| r.data()).collect()
    }
}

/// Reference count of an object that other objects hold on to while they are
/// open. Closing the object is only allowed once the count is back to zero,
/// and the check happens under the same lock as the increments so that a
/// close cannot race a concurrent open.
///
/// An owner that goes away while still referenced marks the close as
/// pending; whoever drops the last reference then finishes it.
#[derive(Debug, Default)]
pub struct RefCount {
    state: spin::Mutex<RefState>,
}

#[derive(Debug, Default)]
struct RefState {
    refs: usize,
    closed: bool,
    close_pending: bool,
}

impl RefCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reference. Fails once the owner has been closed or is about
    /// to be.
    pub fn open(&self) -> Result<usize, Error> {
        let mut state = self.state.lock();
        if state.closed || state.close_pending {
            return Err(Error::Closed);
        }
        state.refs += 1;
        Ok(state.refs)
    }

    /// Drops a reference. The count saturates at zero. Returns true when
    /// this was the last reference of an owner whose close is pending; the
    /// owner counts as closed from now on and the caller finishes closing
    /// it.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.refs > 0, "reference count underflow");
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 && state.close_pending {
            state.close_pending = false;
            state.closed = true;
            return true;
        }
        false
    }

    /// Marks the owner closed if nothing references it anymore.
    pub fn try_close(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.refs != 0 {
            return Err(Error::Busy(state.refs));
        }
        state.closed = true;
        Ok(())
    }

    /// Closes the owner now if nothing references it, and returns true.
    /// Otherwise the close is left to the last [`RefCount::release`].
    pub fn close_when_released(&self) -> Result<bool, Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.refs == 0 {
            state.closed = true;
            return Ok(true);
        }
        state.close_pending = true;
        Ok(false)
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.state.lock().refs
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
