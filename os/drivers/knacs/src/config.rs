//! Tunables of the DMA data path.

use crate::error::{DmaError, Result};

/// Page pool recycling slots.
pub const DEFAULT_PAGE_POOL_CAPACITY: usize = 256;
/// Receive packets kept queued to the hardware.
pub const DEFAULT_RX_DEPTH: usize = 8;
/// Pages per receive packet.
pub const DEFAULT_RX_PACKET_PAGES: usize = 8;
/// Transmit lengths must be a multiple of this many bytes (the stream width).
pub const DEFAULT_TRANSFER_GRANULARITY: usize = 4;

/// Per-channel engine settings applied at probe time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Completions per interrupt.
    pub coalesce: u8,
    /// Interrupt delay timeout, in engine ticks. Zero disables it.
    pub delay: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            coalesce: 1,
            delay: 0,
        }
    }
}

/// Configuration of one device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub page_pool_capacity: usize,
    pub rx_depth: usize,
    pub rx_packet_pages: usize,
    pub transfer_granularity: usize,
    pub tx_channel: String,
    pub rx_channel: String,
    pub channel: ChannelConfig,
    /// Run the receive half (pre-queued read buffers).
    pub receive: bool,
    /// Completed receive packets kept for [`try_recv`](crate::Knacs::try_recv).
    /// Zero frees them as soon as they complete.
    pub rx_backlog: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_pool_capacity: DEFAULT_PAGE_POOL_CAPACITY,
            rx_depth: DEFAULT_RX_DEPTH,
            rx_packet_pages: DEFAULT_RX_PACKET_PAGES,
            transfer_granularity: DEFAULT_TRANSFER_GRANULARITY,
            tx_channel: "axidma0".into(),
            rx_channel: "axidma1".into(),
            channel: ChannelConfig::default(),
            receive: true,
            rx_backlog: 0,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn with_receive(mut self, receive: bool) -> Self {
        self.receive = receive;
        self
    }

    #[must_use]
    pub fn with_rx_depth(mut self, depth: usize) -> Self {
        self.rx_depth = depth;
        self
    }

    #[must_use]
    pub fn with_rx_packet_pages(mut self, pages: usize) -> Self {
        self.rx_packet_pages = pages;
        self
    }

    #[must_use]
    pub fn with_rx_backlog(mut self, backlog: usize) -> Self {
        self.rx_backlog = backlog;
        self
    }

    #[must_use]
    pub fn with_page_pool_capacity(mut self, capacity: usize) -> Self {
        self.page_pool_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_transfer_granularity(mut self, bytes: usize) -> Self {
        self.transfer_granularity = bytes;
        self
    }

    #[must_use]
    pub fn with_channels(mut self, tx: impl Into<String>, rx: impl Into<String>) -> Self {
        self.tx_channel = tx.into();
        self.rx_channel = rx.into();
        self
    }

    /// # Errors
    /// [`DmaError::InvalidArgument`] for a granularity that is not a power of
    /// two or an empty receive packet.
    pub fn validate(&self) -> Result<()> {
        if !self.transfer_granularity.is_power_of_two() {
            return Err(DmaError::InvalidArgument(
                "transfer granularity must be a power of two",
            ));
        }
        if self.receive && self.rx_packet_pages == 0 {
            return Err(DmaError::InvalidArgument(
                "receive packets need at least one page",
            ));
        }
        Ok(())
    }
}
