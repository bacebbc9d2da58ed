//! Pool-backed DMA pages.
//!
//! Getting a page from the frame source and returning it is expensive next
//! to the rate at which the streaming engine churns through receive buffers,
//! so pages are recycled through a [`kernel_objpool::ObjPool`].

use crate::error::{DmaError, Result};
use crate::frames::{Frame, FrameSource};
use core::ptr;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_objpool::{ObjPool, PoolBackend};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// One physical page usable for DMA.
///
/// The page memory is shared with the DMA engine (and, through a mapping,
/// with user space), so byte access goes through `&self`. Concurrent writers
/// race exactly as they would on a shared mapping.
///
/// A page carries no bus address of its own: the same page may sit in more
/// than one mapped packet, so the address lives in each packet's
/// scatter-gather list.
#[derive(Debug)]
pub struct PooledPage {
    frame: Frame,
    index: AtomicU32,
}

impl PooledPage {
    const fn new(frame: Frame) -> Self {
        Self {
            frame,
            index: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn virt(&self) -> VirtualAddress {
        self.frame.virt()
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.frame.phys()
    }

    /// Position of the page in the structure that owns it.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Relaxed);
    }

    /// Copy `data` into the page at `offset`.
    ///
    /// # Errors
    /// [`DmaError::InvalidArgument`] if the range leaves the page.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        Self::check_range(offset, data.len())?;
        // SAFETY: `check_range` keeps `offset..offset + len` inside the
        // frame, which this page owns until it is destroyed.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.frame.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy page bytes starting at `offset` into `buf`.
    ///
    /// # Errors
    /// [`DmaError::InvalidArgument`] if the range leaves the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        Self::check_range(offset, buf.len())?;
        // SAFETY: as in `write`; `buf` is a distinct Rust allocation.
        unsafe {
            ptr::copy_nonoverlapping(self.frame.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn fill(&self, byte: u8) {
        // SAFETY: the frame spans exactly `PAGE_SIZE` owned bytes.
        unsafe { ptr::write_bytes(self.frame.as_ptr(), byte, PAGE_SIZE) };
    }

    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.frame.as_ptr()
    }

    const fn check_range(offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(DmaError::InvalidArgument("range exceeds page")),
        }
    }

    fn into_frame(self) -> Frame {
        self.frame
    }
}

/// Turns frames into pages and back for the pool.
struct FrameBackend {
    frames: Arc<dyn FrameSource>,
}

impl PoolBackend for FrameBackend {
    type Object = PooledPage;
    type Error = DmaError;

    fn allocate(&self) -> Result<PooledPage> {
        self.frames
            .alloc_frame()
            .map(PooledPage::new)
            .ok_or(DmaError::OutOfMemory)
    }

    fn destroy(&self, page: PooledPage) {
        // SAFETY: every pooled page was built from a frame of this source in
        // `allocate`, and `page` is consumed here.
        unsafe { self.frames.free_frame(page.into_frame()) };
    }
}

/// Hands out DMA pages from a recycling pool.
pub struct PageManager {
    pool: ObjPool<FrameBackend>,
    outstanding: AtomicUsize,
}

impl PageManager {
    /// # Errors
    /// [`DmaError::OutOfMemory`] if the pool slots cannot be reserved.
    pub fn new(frames: Arc<dyn FrameSource>, capacity: usize) -> Result<Arc<Self>> {
        let pool = ObjPool::new(capacity, FrameBackend { frames })?;
        Ok(Arc::new(Self {
            pool,
            outstanding: AtomicUsize::new(0),
        }))
    }

    /// Take a page out of the pool, optionally zero-filled.
    ///
    /// # Errors
    /// [`DmaError::OutOfMemory`] when the pool is empty and the frame source
    /// is exhausted.
    pub fn new_page(&self, zero_init: bool) -> Result<PooledPage> {
        let page = self.pool.acquire()?;
        page.set_index(0);
        if zero_init {
            page.fill(0);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(page)
    }

    pub fn free_page(&self, page: PooledPage) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.pool.release(page);
    }

    /// Pages handed out and not yet freed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Pages parked in the pool.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.pool.cached()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

impl core::fmt::Debug for PageManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageManager")
            .field("capacity", &self.capacity())
            .field("cached", &self.cached())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
