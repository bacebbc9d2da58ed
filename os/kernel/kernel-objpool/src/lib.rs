//! # Object Pool
//!
//! A bounded cache in front of an expensive allocator. Freed objects are
//! parked in one of `capacity` recycling slots instead of being destroyed,
//! and the next [`ObjPool::acquire`] hands them out again without calling
//! the backend.
//!
//! ```text
//!  acquire ──► cached? ──yes──► pop slot ──► object
//!                │
//!                no ──► backend.allocate()   (outside the lock)
//!
//!  release ──► free slot? ──yes──► park in slot
//!                │
//!                no ──► backend.destroy()    (outside the lock)
//! ```
//!
//! The bookkeeping lock is a [`SpinLock`], so `acquire` and `release` may be
//! called from contexts that must not sleep. The backend itself is never
//! called with the lock held; slow page allocation does not stall other
//! users of the pool.
//!
//! The slot storage is reserved once in [`ObjPool::new`] and never grows, so
//! the critical sections never allocate either.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use kernel_sync::SpinLock;

/// Number of recycling slots used when a pool is created with capacity 0.
pub const DEFAULT_CAPACITY: usize = 5;

/// Log target for pool diagnostics.
pub const LOG_TARGET: &str = "knacs::objpool";

/// The allocator and destructor a pool sits in front of.
///
/// Any state the backend needs (the `user_data` of a C-style pool) lives in
/// the implementing type itself.
pub trait PoolBackend {
    type Object;
    type Error;

    /// Build a fresh object. Errors are handed to the [`ObjPool::acquire`]
    /// caller unchanged.
    fn allocate(&self) -> Result<Self::Object, Self::Error>;

    /// Tear an object down for good.
    fn destroy(&self, obj: Self::Object);
}

/// Slot storage for the pool could not be reserved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unable to reserve {slots} object pool slots")]
pub struct OutOfMemory {
    pub slots: usize,
}

/// A bounded recycling cache of `B::Object`s.
pub struct ObjPool<B: PoolBackend> {
    backend: B,
    capacity: usize,
    /// Parked objects. `len()` is the used-slot count; the reserved spare
    /// capacity is the free-slot list.
    cached: SpinLock<Vec<B::Object>>,
}

impl<B: PoolBackend> ObjPool<B> {
    /// Create a pool with `capacity` recycling slots ([`DEFAULT_CAPACITY`]
    /// if zero).
    ///
    /// # Errors
    /// [`OutOfMemory`] if the slot storage cannot be reserved.
    pub fn new(capacity: usize, backend: B) -> Result<Self, OutOfMemory> {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| OutOfMemory { slots: capacity })?;

        Ok(Self {
            backend,
            capacity,
            cached: SpinLock::new(slots),
        })
    }

    /// Hand out a cached object, or build a new one.
    ///
    /// # Errors
    /// Whatever the backend's `allocate` returns when the cache is empty.
    pub fn acquire(&self) -> Result<B::Object, B::Error> {
        let cached = self.cached.lock().pop();
        match cached {
            Some(obj) => Ok(obj),
            None => self.backend.allocate(),
        }
    }

    /// Park `obj` in a free slot, or destroy it if every slot is taken.
    pub fn release(&self, obj: B::Object) {
        let overflow = {
            let mut cached = self.cached.lock();
            if cached.len() < self.capacity {
                cached.push(obj);
                None
            } else {
                Some(obj)
            }
        };

        if let Some(obj) = overflow {
            self.backend.destroy(obj);
        }
    }

    /// Destroy every cached object and the pool itself.
    ///
    /// Taking `self` by value guarantees nobody can still be acquiring or
    /// releasing. Dropping the pool does the same.
    pub fn destroy(self) {
        drop(self);
    }

    /// Number of recycling slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of objects currently parked.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cached.lock().len()
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: PoolBackend> Drop for ObjPool<B> {
    fn drop(&mut self) {
        let cached = core::mem::take(self.cached.get_mut());
        if !cached.is_empty() {
            log::trace!(target: LOG_TARGET, "destroying {} cached objects", cached.len());
        }
        for obj in cached {
            self.backend.destroy(obj);
        }
    }
}
