//! # KNaCs DMA data path
//!
//! The data path of the KNaCs control device: DMA-capable memory shared
//! between the driver and user space, streamed to and from an AXI DMA engine
//! in bounded packets.
//!
//! ## Layers
//!
//! - [`frames`]: where page frames come from ([`FrameSource`]).
//! - [`page_mgr`]: pool-recycled pages ([`PageManager`]).
//! - [`DmaPage`]: a page shared between an area and packets in flight.
//! - [`DmaArea`]: the demand-paged backing store of one user mapping.
//! - [`channel`]: the DMA engine interface ([`DmaChannel`]) and, with the
//!   `soft-dma` feature, an in-memory engine.
//! - [`DmaPacket`] and [`StreamEngine`]: transfer units and the worker that
//!   submits, completes and recycles them.
//! - [`Knacs`] and [`Driver`]: device instances with `mmap`, page faults and
//!   the control commands.
//!
//! ## Example
//!
//! ```
//! # #[cfg(feature = "soft-dma")] {
//! use knacs::{Driver, HeapFrames, IoctlArg, IoctlCommand, MmapRequest, SoftProvider, StreamConfig, UserMemory};
//! use knacs::ioctl::DmaBufferDesc;
//! use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
//! use std::sync::Arc;
//!
//! let config = StreamConfig::default().with_receive(false);
//! let driver = Driver::init(Arc::new(HeapFrames::new()), &config).unwrap();
//! let provider = SoftProvider::with_channels(&["axidma0", "axidma1"]).unwrap();
//! let device = driver.probe(config, &provider, None).unwrap();
//!
//! let file = device.open();
//! let mut mm = UserMemory::new();
//! let start = VirtualAddress::new(0x7000_0000);
//! device
//!     .mmap(&file, &mut mm, MmapRequest { start, len: PAGE_SIZE, page_offset: 1, shared: true })
//!     .unwrap();
//! mm.write(start, b"ping").unwrap();
//!
//! let desc = DmaBufferDesc::new(start, 4);
//! device
//!     .ioctl(&file, &mut mm, IoctlCommand::SEND_DMA_BUFFER, IoctlArg::DmaBuffer(desc))
//!     .unwrap();
//! device.remove();
//! # }
//! ```

pub mod channel;
mod completion;
pub mod config;
mod device;
mod dma_area;
mod dma_page;
pub mod error;
pub mod frames;
pub mod ioctl;
pub mod logger;
mod packet;
pub mod page_mgr;
mod stream;
mod vma;

pub use channel::{Cookie, DmaChannel, DmaProvider, Direction, SgEntry, TxDescriptor};
#[cfg(feature = "soft-dma")]
pub use channel::{SoftChannel, SoftProvider};
pub use config::{ChannelConfig, StreamConfig};
pub use device::{Driver, File, FileId, Knacs};
pub use dma_area::{AreaGuard, DmaArea};
pub use dma_page::DmaPage;
pub use error::{DmaError, Result};
pub use frames::{Frame, FrameSource, HeapFrames};
pub use ioctl::{IoctlArg, IoctlCommand, IoctlReply, Version};
pub use logger::KernelLogger;
pub use packet::DmaPacket;
pub use page_mgr::{PageManager, PooledPage};
pub use stream::{CompletionHandle, QueueDepths, RxBuffer, StreamEngine, StreamStats};
pub use vma::{MmapRequest, RegisterWindow, UserMemory, Vma, VmaKind};
