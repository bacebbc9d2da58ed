//! Where DMA pages come from.
//!
//! A [`FrameSource`] hands out single, page-aligned frames of DMA-capable
//! memory (the `__get_free_page(GFP_KERNEL | GFP_DMA)` of a kernel build).
//! [`HeapFrames`] is the hosted source backed by the global allocator.

use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One page-sized, page-aligned frame of memory.
#[derive(Debug)]
pub struct Frame {
    ptr: NonNull<u8>,
    phys: PhysicalAddress,
}

// Safety: a Frame is a unique handle to its memory; it carries no thread affinity.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    /// # Safety
    /// `ptr` must point to `PAGE_SIZE` bytes of page-aligned memory that
    /// nobody else owns, and `phys` must be its physical address.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<u8>, phys: PhysicalAddress) -> Self {
        Self { ptr, phys }
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn virt(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.ptr.as_ptr())
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }
}

/// A supplier of DMA-capable page frames.
pub trait FrameSource: Send + Sync {
    /// Allocate one frame, or `None` when memory is exhausted.
    fn alloc_frame(&self) -> Option<Frame>;

    /// Give a frame back.
    ///
    /// # Safety
    /// `frame` must have come from this source and must not be referenced
    /// afterwards.
    unsafe fn free_frame(&self, frame: Frame);
}

/// Frames carved from the global allocator, with identity physical addresses.
#[derive(Debug, Default)]
pub struct HeapFrames {
    limit: Option<usize>,
    live: AtomicUsize,
    allocated: AtomicUsize,
}

impl HeapFrames {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            limit: None,
            live: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// A source that fails once `limit` frames are live.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            live: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Frames ever allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    const fn layout() -> Layout {
        match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("page layout"),
        }
    }
}

impl FrameSource for HeapFrames {
    fn alloc_frame(&self) -> Option<Frame> {
        let reserved = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| match self.limit {
                Some(limit) if live >= limit => None,
                _ => Some(live + 1),
            });
        if reserved.is_err() {
            log::debug!(target: "knacs::frames", "frame limit of {:?} reached", self.limit);
            return None;
        }

        // Zeroed once so a recycled frame never exposes uninitialized bytes;
        // clearing on reuse is the page manager's business.
        let Some(ptr) = NonNull::new(unsafe { alloc_zeroed(Self::layout()) }) else {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return None;
        };
        self.allocated.fetch_add(1, Ordering::SeqCst);

        let phys = PhysicalAddress::new(ptr.as_ptr() as usize as u64);
        Some(unsafe { Frame::from_raw(ptr, phys) })
    }

    unsafe fn free_frame(&self, frame: Frame) {
        unsafe { dealloc(frame.as_ptr(), Self::layout()) };
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
