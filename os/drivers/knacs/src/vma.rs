//! User address space bookkeeping for device mappings.
//!
//! [`UserMemory`] stands in for a process' `mm`: a set of non-overlapping
//! [`Vma`]s created through [`Knacs::mmap`](crate::Knacs::mmap), demand
//! paged through [`UserMemory::fault`] and torn down by
//! [`UserMemory::unmap`]. Duplicating a VMA (on `fork`) takes another
//! reference on its DMA area; dropping one releases it.

use crate::device::FileId;
use crate::dma_area::DmaArea;
use crate::dma_page::DmaPage;
use crate::error::{DmaError, Result};
use kernel_memory_addresses::{PAGE_SIZE, PageSize, PhysicalAddress, Size4K, VirtualAddress};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Arguments of an `mmap` call on the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MmapRequest {
    pub start: VirtualAddress,
    pub len: usize,
    /// Selects what gets mapped: 0 registers, 1 DMA area.
    pub page_offset: u64,
    pub shared: bool,
}

/// The MMIO window of the pulse controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterWindow {
    pub base: PhysicalAddress,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub enum VmaKind {
    /// Register window, mapped in full when created.
    Registers(RegisterWindow),
    /// Demand-paged DMA area.
    DmaArea(Arc<DmaArea>),
}

/// One mapping of the device.
#[derive(Debug)]
pub struct Vma {
    start: VirtualAddress,
    len: usize,
    owner: FileId,
    kind: VmaKind,
}

impl Vma {
    pub(crate) const fn new(start: VirtualAddress, len: usize, owner: FileId, kind: VmaKind) -> Self {
        Self {
            start,
            len,
            owner,
            kind,
        }
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The file the mapping was created through.
    #[must_use]
    pub const fn owner(&self) -> FileId {
        self.owner
    }

    #[must_use]
    pub const fn kind(&self) -> &VmaKind {
        &self.kind
    }

    /// The backing area, for DMA mappings.
    #[must_use]
    pub const fn area(&self) -> Option<&Arc<DmaArea>> {
        match &self.kind {
            VmaKind::DmaArea(area) => Some(area),
            VmaKind::Registers(_) => None,
        }
    }

    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64()
            .checked_sub(self.start.as_u64())
            .is_some_and(|offset| offset < self.len as u64)
    }

    /// Page-fault hook: the page backing `page_offset` pages into the mapping,
    /// allocated and zeroed on first touch.
    ///
    /// # Errors
    /// - [`DmaError::Fault`] outside the mapping or on a register mapping.
    /// - Allocation failures from [`DmaArea::get_page`].
    pub fn fault(&self, page_offset: u64) -> Result<Arc<DmaPage>> {
        if page_offset >= self.len.div_ceil(PAGE_SIZE) as u64 {
            return Err(DmaError::Fault("fault outside the mapping"));
        }
        match &self.kind {
            VmaKind::DmaArea(area) => {
                let index = i64::try_from(page_offset).map_err(|_| DmaError::InvalidArgument("page offset out of range"))?;
                area.get_page(index, true)
            }
            VmaKind::Registers(_) => Err(DmaError::Fault("register mappings do not fault")),
        }
    }

    /// Copy for a child address space, sharing the backing area.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            start: self.start,
            len: self.len,
            owner: self.owner,
            kind: self.kind.clone(),
        }
    }

    fn end(&self) -> u64 {
        self.start.as_u64().saturating_add(self.len as u64)
    }
}

/// A process address space, as far as the device is concerned.
#[derive(Debug, Default)]
pub struct UserMemory {
    vmas: BTreeMap<u64, Vma>,
}

impl UserMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// [`DmaError::InvalidArgument`] for an empty or overlapping mapping.
    pub fn insert(&mut self, vma: Vma) -> Result<()> {
        if vma.is_empty() {
            return Err(DmaError::InvalidArgument("empty mapping"));
        }

        let start = vma.start.as_u64();
        let overlaps_prev = self
            .vmas
            .range(..=start)
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > start);
        let overlaps_next = self
            .vmas
            .range(start..)
            .next()
            .is_some_and(|(&next, _)| next < vma.end());
        if overlaps_prev || overlaps_next {
            return Err(DmaError::InvalidArgument("mapping overlaps an existing one"));
        }

        self.vmas.insert(start, vma);
        Ok(())
    }

    /// The mapping containing `addr`.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<&Vma> {
        self.vmas
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    /// Remove the mapping starting at `start`. Dropping the returned VMA
    /// releases its reference on the backing area.
    pub fn unmap(&mut self, start: VirtualAddress) -> Option<Vma> {
        self.vmas.remove(&start.as_u64())
    }

    /// Duplicate every mapping, as `fork` does.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            vmas: self
                .vmas
                .iter()
                .map(|(&start, vma)| (start, vma.duplicate()))
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    /// Resolve a user access at `addr` to its backing page.
    ///
    /// # Errors
    /// [`DmaError::Fault`] for an unmapped address, else see [`Vma::fault`].
    pub fn fault(&self, addr: VirtualAddress) -> Result<Arc<DmaPage>> {
        let vma = self.find(addr).ok_or(DmaError::Fault("address not mapped"))?;
        let offset = addr.as_u64() - vma.start.as_u64();
        vma.fault(offset >> Size4K::SHIFT)
    }

    /// Store `data` at `addr` the way a user-space write would, faulting
    /// pages in as needed.
    ///
    /// # Errors
    /// See [`fault`](Self::fault).
    pub fn write(&self, addr: VirtualAddress, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            let page = self.fault(at)?;
            let offset = usize::try_from(at.page_offset::<Size4K>()).map_err(|_| DmaError::Fault("bad offset"))?;
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            page.write(offset, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Load `buf.len()` bytes from `addr`, faulting pages in as needed.
    ///
    /// # Errors
    /// See [`fault`](Self::fault).
    pub fn read(&self, addr: VirtualAddress, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let page = self.fault(at)?;
            let offset = usize::try_from(at.page_offset::<Size4K>()).map_err(|_| DmaError::Fault("bad offset"))?;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            page.read(offset, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }
}
