//! Bounded transfer units.

use crate::channel::{DmaChannel, Direction, SgEntry};
use crate::dma_area::AreaGuard;
use crate::dma_page::DmaPage;
use crate::error::{DmaError, Result};
use crate::page_mgr::PageManager;
use kernel_memory_addresses::{BusAddress, PAGE_SIZE, Size4K, pages_spanning, tail_length};
use std::sync::Arc;

struct Mapping {
    channel: Arc<dyn DmaChannel>,
    direction: Direction,
}

/// A run of pages moving to or from the device.
///
/// `pages` and `sg` always have `num_pages` entries. A packet is either
/// unmapped or mapped in full against one channel and direction; the bus
/// addresses in `sg` are only meaningful while mapped. Dropping a packet
/// unmaps it and releases its page references.
pub struct DmaPacket {
    len: usize,
    pages: Vec<Arc<DmaPage>>,
    sg: Vec<SgEntry>,
    mapping: Option<Mapping>,
}

impl DmaPacket {
    /// Reference the first `len` bytes worth of pages of a locked area.
    ///
    /// # Errors
    /// - [`DmaError::InvalidArgument`] for an empty packet.
    /// - [`DmaError::Fault`] if one of the pages is not populated.
    /// - [`DmaError::OutOfMemory`] if the page arrays cannot be allocated.
    pub fn from_area(area: &AreaGuard<'_>, len: usize) -> Result<Self> {
        let num_pages = Self::page_count(len)?;
        let mut pages = Self::page_vec(num_pages)?;
        for index in 0..num_pages {
            let page = area.page(index).ok_or(DmaError::Fault("page not populated"))?;
            pages.push(Arc::clone(page));
        }
        Self::with_pages(pages, len)
    }

    /// A receive packet of `num_pages` freshly allocated pages.
    ///
    /// # Errors
    /// [`DmaError::OutOfMemory`] if any page cannot be allocated; pages taken
    /// so far go back to the pool.
    pub fn fresh(manager: &Arc<PageManager>, num_pages: usize) -> Result<Self> {
        let len = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(DmaError::InvalidArgument("packet too large"))?;
        Self::page_count(len)?;

        let mut pages = Self::page_vec(num_pages)?;
        for index in 0..num_pages {
            let index = u32::try_from(index).map_err(|_| DmaError::InvalidArgument("packet too large"))?;
            pages.push(DmaPage::new(manager, index, false)?);
        }
        Self::with_pages(pages, len)
    }

    fn page_count(len: usize) -> Result<usize> {
        match pages_spanning::<Size4K>(len) {
            0 => Err(DmaError::InvalidArgument("empty packet")),
            n => Ok(n),
        }
    }

    fn page_vec(num_pages: usize) -> Result<Vec<Arc<DmaPage>>> {
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(num_pages)
            .map_err(|_| DmaError::OutOfMemory)?;
        Ok(pages)
    }

    fn with_pages(pages: Vec<Arc<DmaPage>>, len: usize) -> Result<Self> {
        let num_pages = pages.len();
        let mut sg = Vec::new();
        sg.try_reserve_exact(num_pages)
            .map_err(|_| DmaError::OutOfMemory)?;
        sg.extend((0..num_pages).map(|i| SgEntry {
            address: BusAddress::default(),
            length: if i + 1 == num_pages {
                tail_length::<Size4K>(len)
            } else {
                PAGE_SIZE
            },
        }));

        Ok(Self {
            len,
            pages,
            sg,
            mapping: None,
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Bytes carried by the last page.
    #[must_use]
    pub fn tail_length(&self) -> usize {
        self.sg.last().map_or(0, |e| e.length)
    }

    #[must_use]
    pub fn pages(&self) -> &[Arc<DmaPage>] {
        &self.pages
    }

    #[must_use]
    pub fn sg(&self) -> &[SgEntry] {
        &self.sg
    }

    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// The channel and direction the packet is mapped against.
    #[must_use]
    pub fn mapping(&self) -> Option<(&Arc<dyn DmaChannel>, Direction)> {
        self.mapping.as_ref().map(|m| (&m.channel, m.direction))
    }

    /// Map every page for `channel` in `direction`.
    ///
    /// A no-op when already mapped identically; a mapping against anything
    /// else is undone first. On failure the packet is left unmapped.
    ///
    /// # Errors
    /// Whatever [`DmaChannel::map_page`] reports.
    pub fn map(&mut self, channel: &Arc<dyn DmaChannel>, direction: Direction) -> Result<()> {
        if let Some(current) = &self.mapping {
            if Arc::ptr_eq(&current.channel, channel) && current.direction == direction {
                return Ok(());
            }
            self.unmap();
        }

        for index in 0..self.sg.len() {
            let length = self.sg[index].length;
            match channel.map_page(&self.pages[index], length, direction) {
                Ok(address) => self.sg[index].address = address,
                Err(err) => {
                    log::debug!(
                        target: "knacs::packet",
                        "mapping page {index} of {} on {} failed: {err}",
                        self.sg.len(),
                        channel.name()
                    );
                    self.unmap_range(channel.as_ref(), direction, index);
                    return Err(err);
                }
            }
        }

        self.mapping = Some(Mapping {
            channel: Arc::clone(channel),
            direction,
        });
        Ok(())
    }

    /// Undo [`map`](Self::map). A no-op when not mapped.
    pub fn unmap(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            self.unmap_range(mapping.channel.as_ref(), mapping.direction, self.sg.len());
        }
    }

    fn unmap_range(&mut self, channel: &dyn DmaChannel, direction: Direction, count: usize) {
        for entry in self.sg.iter_mut().take(count) {
            channel.unmap_page(entry.address, entry.length, direction);
            entry.address = BusAddress::default();
        }
    }

    /// Copy up to `limit` packet bytes into `buf`; returns the count copied.
    pub fn copy_to(&self, buf: &mut [u8], limit: usize) -> usize {
        let total = limit.min(self.len).min(buf.len());
        let mut copied = 0;
        for page in &self.pages {
            if copied == total {
                break;
            }
            let n = (total - copied).min(PAGE_SIZE);
            // In range by construction.
            if page.read(0, &mut buf[copied..copied + n]).is_err() {
                break;
            }
            copied += n;
        }
        copied
    }
}

impl Drop for DmaPacket {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl core::fmt::Debug for DmaPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaPacket")
            .field("len", &self.len)
            .field("num_pages", &self.pages.len())
            .field("mapped", &self.mapping().map(|(c, d)| (c.name().to_owned(), d)))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma_area::DmaArea;
    use crate::frames::{FrameSource, HeapFrames};

    fn manager() -> Arc<PageManager> {
        let frames: Arc<dyn FrameSource> = Arc::new(HeapFrames::new());
        PageManager::new(frames, 16).unwrap()
    }

    #[test]
    fn layout_follows_length() {
        let mgr = manager();
        let area = DmaArea::new(&mgr);
        for i in 0..3 {
            area.get_page(i, true).unwrap();
        }

        let guard = area.lock();
        let packet = DmaPacket::from_area(&guard, PAGE_SIZE * 2 + 10).unwrap();
        assert_eq!(packet.num_pages(), 3);
        assert_eq!(packet.sg().len(), 3);
        assert_eq!(packet.tail_length(), 10);
        assert_eq!(packet.sg()[0].length, PAGE_SIZE);

        let exact = DmaPacket::from_area(&guard, PAGE_SIZE).unwrap();
        assert_eq!(exact.num_pages(), 1);
        assert_eq!(exact.tail_length(), PAGE_SIZE);
    }

    #[test]
    fn area_packet_shares_pages() {
        let mgr = manager();
        let area = DmaArea::new(&mgr);
        let page = area.get_page(0, true).unwrap();
        page.write(0, b"payload").unwrap();

        let packet = DmaPacket::from_area(&area.lock(), 7).unwrap();
        drop(area);
        assert_eq!(mgr.outstanding(), 1);

        let mut buf = [0u8; 16];
        assert_eq!(packet.copy_to(&mut buf, usize::MAX), 7);
        assert_eq!(&buf[..7], b"payload");

        drop((page, packet));
        assert_eq!(mgr.outstanding(), 0);
    }

    #[test]
    fn unpopulated_page_is_a_fault() {
        let mgr = manager();
        let area = DmaArea::new(&mgr);
        area.get_page(0, true).unwrap();
        area.get_page(2, true).unwrap();

        let guard = area.lock();
        assert!(matches!(
            DmaPacket::from_area(&guard, PAGE_SIZE * 2 + 1),
            Err(DmaError::Fault(_))
        ));
        assert!(matches!(
            DmaPacket::from_area(&guard, 0),
            Err(DmaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fresh_packet_releases_pages_on_failure() {
        let frames: Arc<dyn FrameSource> = Arc::new(HeapFrames::with_limit(3));
        let mgr = PageManager::new(frames, 8).unwrap();
        assert_eq!(DmaPacket::fresh(&mgr, 4).unwrap_err(), DmaError::OutOfMemory);
        assert_eq!(mgr.outstanding(), 0);

        let packet = DmaPacket::fresh(&mgr, 3).unwrap();
        assert_eq!(packet.len(), 3 * PAGE_SIZE);
        assert_eq!(packet.pages()[2].index(), 2);
    }
}
