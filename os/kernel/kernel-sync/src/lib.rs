//! # Kernel synchronization primitives
//!
//! The only lock in here is [`SpinLock`]: a busy-waiting lock that never
//! sleeps and therefore may be taken from completion-callback context. Locks
//! that are allowed to block (page-fault paths, the worker's completion wait)
//! live with the code that owns them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
