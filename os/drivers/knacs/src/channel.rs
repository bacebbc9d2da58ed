//! The DMA engine as the streaming path sees it.
//!
//! The engine itself (descriptor rings, register programming) lives behind
//! [`DmaChannel`]; the driver only maps pages, prepares scatter-gather
//! transfers, submits them with a [`CompletionHandle`] and kicks the channel.

#[cfg(feature = "soft-dma")]
mod soft;

#[cfg(feature = "soft-dma")]
pub use soft::{SoftChannel, SoftProvider};

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::page_mgr::PooledPage;
use crate::stream::CompletionHandle;
use kernel_memory_addresses::BusAddress;
use std::sync::Arc;

/// Transfer direction relative to memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Transmit: memory is read by the device.
    MemToDev,
    /// Receive: memory is written by the device.
    DevToMem,
}

/// One fragment of a scatter-gather list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SgEntry {
    pub address: BusAddress,
    pub length: usize,
}

/// Identifies a submitted transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(pub u32);

/// A prepared, not yet submitted, transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDescriptor {
    entries: Vec<SgEntry>,
    direction: Direction,
}

impl TxDescriptor {
    #[must_use]
    pub const fn new(entries: Vec<SgEntry>, direction: Direction) -> Self {
        Self { entries, direction }
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Total bytes described.
    #[must_use]
    pub fn length(&self) -> usize {
        self.entries.iter().map(|e| e.length).sum()
    }
}

/// One DMA channel of the engine.
///
/// Implementations invoke the [`CompletionHandle`] passed to
/// [`submit`](Self::submit) from their completion context once the transfer
/// finished. They must not call back into the channel from there.
pub trait DmaChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Make `len` bytes of `page` accessible to the device.
    ///
    /// # Errors
    /// [`DmaError::Submission`](crate::DmaError::Submission) if no mapping
    /// could be set up.
    fn map_page(&self, page: &PooledPage, len: usize, direction: Direction) -> Result<BusAddress>;

    fn unmap_page(&self, address: BusAddress, len: usize, direction: Direction);

    /// Build a descriptor for `sg`; `None` when descriptors are exhausted.
    fn prep_slave_sg(&self, sg: &[SgEntry], direction: Direction) -> Option<TxDescriptor>;

    /// Queue `descriptor`. Nothing moves until [`issue_pending`](Self::issue_pending).
    ///
    /// # Errors
    /// [`DmaError::Submission`](crate::DmaError::Submission) if the channel
    /// rejects the descriptor. `on_complete` is dropped unused in that case.
    fn submit(&self, descriptor: TxDescriptor, on_complete: CompletionHandle) -> Result<Cookie>;

    /// Start processing everything submitted so far.
    fn issue_pending(&self);

    /// Abort every submitted transfer without completing it. Returns once the
    /// channel no longer touches any mapped memory.
    fn terminate_all(&self);

    /// Apply interrupt coalescing settings.
    ///
    /// # Errors
    /// [`DmaError::InvalidArgument`](crate::DmaError::InvalidArgument) for
    /// settings the channel cannot honor.
    fn configure(&self, config: &ChannelConfig) -> Result<()>;
}

/// Resolves DMA channels by name at probe time.
pub trait DmaProvider {
    /// # Errors
    /// [`DmaError::NoChannel`](crate::DmaError::NoChannel) if `name` is unknown.
    fn request_channel(&self, name: &str) -> Result<Arc<dyn DmaChannel>>;
}
