//! Demand-paged backing store of one user mapping.
//!
//! Slots fill in lazily from the page-fault path, at most one page per
//! index, and the slot table grows to the next power of two past the
//! highest index requested. The area itself is shared as `Arc<DmaArea>`;
//! every mapping of it (including ones duplicated by `fork`) holds one
//! reference, and dropping the last one releases every populated page.

use crate::dma_page::DmaPage;
use crate::error::{DmaError, Result};
use crate::page_mgr::PageManager;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Slots {
    table: Vec<Option<Arc<DmaPage>>>,
    /// One past the highest populated index.
    num_pages: usize,
}

impl Slots {
    /// Make `table` cover `index`, doubling to the next power of two above it.
    fn ensure_capacity(&mut self, index: usize) -> Result<()> {
        if index < self.table.len() {
            return Ok(());
        }

        let wanted = 1usize
            .checked_shl(usize::BITS - index.leading_zeros())
            .ok_or(DmaError::InvalidArgument("page index out of range"))?;
        self.table
            .try_reserve_exact(wanted - self.table.len())
            .map_err(|_| DmaError::OutOfMemory)?;
        self.table.resize(wanted, None);
        log::trace!(target: "knacs::area", "grew slot table to {wanted}");
        Ok(())
    }

    fn get_or_insert(
        &mut self,
        pages: &Arc<PageManager>,
        index: usize,
        zero_init: bool,
    ) -> Result<Arc<DmaPage>> {
        self.ensure_capacity(index)?;
        if let Some(page) = &self.table[index] {
            return Ok(Arc::clone(page));
        }

        let raw_index = u32::try_from(index).map_err(|_| DmaError::InvalidArgument("page index out of range"))?;
        let page = DmaPage::new(pages, raw_index, zero_init)?;
        self.table[index] = Some(Arc::clone(&page));
        self.num_pages = self.num_pages.max(index + 1);
        Ok(page)
    }
}

/// The pages behind one DMA mapping.
#[derive(Debug)]
pub struct DmaArea {
    pages: Arc<PageManager>,
    slots: Mutex<Slots>,
}

impl DmaArea {
    /// An empty area drawing its pages from `pages`.
    #[must_use]
    pub fn new(pages: &Arc<PageManager>) -> Arc<Self> {
        Arc::new(Self {
            pages: Arc::clone(pages),
            slots: Mutex::new(Slots::default()),
        })
    }

    /// Fetch the page at `index`, allocating it if the slot is still empty.
    ///
    /// Concurrent callers for the same index observe the same page and only
    /// one of them allocates.
    ///
    /// # Errors
    /// - [`DmaError::InvalidArgument`] for a negative or unrepresentable index.
    /// - [`DmaError::OutOfMemory`] if growing the table or allocating fails.
    pub fn get_page(&self, index: i64, zero_init: bool) -> Result<Arc<DmaPage>> {
        self.lock().get_page(index, zero_init)
    }

    /// Hold the area lock across several operations.
    pub fn lock(&self) -> AreaGuard<'_> {
        AreaGuard {
            area: self,
            slots: self.slots.lock(),
        }
    }

    /// Snapshot of the slot table and the logical page count.
    ///
    /// Only the returned references are stable; the area may grow right
    /// after this returns.
    #[must_use]
    pub fn get_all_pages(&self) -> (Vec<Option<Arc<DmaPage>>>, usize) {
        let slots = self.slots.lock();
        (slots.table.clone(), slots.num_pages)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().table.len()
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.slots.lock().num_pages
    }

    /// The manager this area allocates from.
    #[must_use]
    pub const fn page_manager(&self) -> &Arc<PageManager> {
        &self.pages
    }
}

impl Drop for DmaArea {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        let populated = slots.table.iter().filter(|s| s.is_some()).count();
        log::trace!(target: "knacs::area", "releasing area with {populated} pages");
    }
}

/// The area lock, held.
pub struct AreaGuard<'a> {
    area: &'a DmaArea,
    slots: MutexGuard<'a, Slots>,
}

impl AreaGuard<'_> {
    /// [`DmaArea::get_page`] without re-taking the lock.
    ///
    /// # Errors
    /// See [`DmaArea::get_page`].
    pub fn get_page(&mut self, index: i64, zero_init: bool) -> Result<Arc<DmaPage>> {
        let index = usize::try_from(index).map_err(|_| DmaError::InvalidArgument("negative page index"))?;
        self.slots.get_or_insert(&self.area.pages, index, zero_init)
    }

    /// The page at `index`, if populated.
    #[must_use]
    pub fn page(&self, index: usize) -> Option<&Arc<DmaPage>> {
        self.slots.table.get(index).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn pages(&self) -> &[Option<Arc<DmaPage>>] {
        &self.slots.table
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.slots.num_pages
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.table.len()
    }

    /// Whether slots `0..count` are all populated.
    #[must_use]
    pub fn is_populated(&self, count: usize) -> bool {
        count <= self.slots.table.len() && self.slots.table[..count].iter().all(Option::is_some)
    }

    pub fn unlock(self) {}
}
