use crate::error::Result;
use crate::page_mgr::{PageManager, PooledPage};
use core::mem::ManuallyDrop;
use core::ops::Deref;
use std::sync::Arc;

/// A page that can be shared between a [`DmaArea`](crate::DmaArea) and
/// packets in flight.
///
/// Always handled as `Arc<DmaPage>`: cloning the `Arc` takes a reference and
/// dropping the last one gives the page back to its [`PageManager`]. Drop the
/// last reference outside of any spin lock; returning a page may fall
/// through to the frame source.
#[derive(Debug)]
pub struct DmaPage {
    page: ManuallyDrop<PooledPage>,
    owner: Arc<PageManager>,
}

impl DmaPage {
    /// Allocate a page from `owner` with one reference.
    ///
    /// # Errors
    /// Propagates [`PageManager::new_page`] failures.
    pub fn new(owner: &Arc<PageManager>, index: u32, zero_init: bool) -> Result<Arc<Self>> {
        let page = owner.new_page(zero_init)?;
        page.set_index(index);
        Ok(Arc::new(Self {
            page: ManuallyDrop::new(page),
            owner: Arc::clone(owner),
        }))
    }
}

impl Deref for DmaPage {
    type Target = PooledPage;

    fn deref(&self) -> &PooledPage {
        &self.page
    }
}

impl Drop for DmaPage {
    fn drop(&mut self) {
        // SAFETY: `page` is never touched again after this.
        let page = unsafe { ManuallyDrop::take(&mut self.page) };
        self.owner.free_page(page);
    }
}
