//! Device instances and the driver lifecycle.
//!
//! A [`Driver`] owns the page pool shared by every device it probes. Each
//! probed [`Knacs`] carries its own channels, streaming engine and worker
//! thread; nothing is global, so several instances can coexist.

use crate::channel::DmaProvider;
use crate::config::StreamConfig;
use crate::dma_area::DmaArea;
use crate::error::{DmaError, Result};
use crate::frames::FrameSource;
use crate::ioctl::{DmaBufferDesc, IoctlArg, IoctlCommand, IoctlReply, Request, VERSION_MAJOR, VERSION_MINOR, Version};
use crate::packet::DmaPacket;
use crate::page_mgr::PageManager;
use crate::stream::{QueueDepths, RxBuffer, StreamEngine, StreamStats};
use crate::vma::{MmapRequest, RegisterWindow, UserMemory, Vma, VmaKind};
use kernel_memory_addresses::{Size4K, pages_spanning};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of an open file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// An open handle on a device.
#[derive(Debug, PartialEq, Eq)]
pub struct File {
    id: FileId,
}

impl File {
    #[must_use]
    pub const fn id(&self) -> FileId {
        self.id
    }
}

/// Module-level state: the page pool every device instance draws from.
pub struct Driver {
    pages: Arc<PageManager>,
}

impl Driver {
    /// # Errors
    /// [`DmaError::OutOfMemory`] if the page pool cannot be set up.
    pub fn init(frames: Arc<dyn FrameSource>, config: &StreamConfig) -> Result<Self> {
        let pages = PageManager::new(frames, config.page_pool_capacity)?;
        log::info!(target: "knacs::device", "page pool ready, {} slots", pages.capacity());
        Ok(Self { pages })
    }

    /// Bring up one device instance.
    ///
    /// # Errors
    /// See [`Knacs::probe`].
    pub fn probe(
        &self,
        config: StreamConfig,
        provider: &dyn DmaProvider,
        registers: Option<RegisterWindow>,
    ) -> Result<Knacs> {
        Knacs::probe(config, &self.pages, provider, registers)
    }

    #[must_use]
    pub const fn pages(&self) -> &Arc<PageManager> {
        &self.pages
    }

    /// Tear the pool down.
    ///
    /// # Errors
    /// [`DmaError::Busy`] while pages are still handed out. The pool then
    /// stays alive until the last of them is freed.
    pub fn exit(self) -> Result<()> {
        let outstanding = self.pages.outstanding();
        if outstanding > 0 {
            log::warn!(target: "knacs::device", "exit while {outstanding} buffers are allocated");
            return Err(DmaError::Busy("buffers still allocated"));
        }
        log::info!(target: "knacs::device", "page pool released");
        Ok(())
    }
}

/// One probed device.
pub struct Knacs {
    pages: Arc<PageManager>,
    registers: Option<RegisterWindow>,
    stream: StreamEngine,
    next_file: AtomicU64,
}

impl Knacs {
    /// Request both DMA channels, configure them and start the stream.
    ///
    /// # Errors
    /// - [`DmaError::NoChannel`] if a channel is missing.
    /// - Configuration errors from the channels or [`StreamConfig::validate`].
    pub fn probe(
        config: StreamConfig,
        pages: &Arc<PageManager>,
        provider: &dyn DmaProvider,
        registers: Option<RegisterWindow>,
    ) -> Result<Self> {
        config.validate()?;

        let tx = provider.request_channel(&config.tx_channel).inspect_err(|err| {
            log::error!(target: "knacs::device", "unable to get tx channel: {err}");
        })?;
        let rx = provider.request_channel(&config.rx_channel).inspect_err(|err| {
            log::error!(target: "knacs::device", "unable to get rx channel: {err}");
        })?;
        tx.configure(&config.channel)?;
        rx.configure(&config.channel)?;

        let stream = StreamEngine::start(config, Arc::clone(pages), tx, rx)?;
        log::info!(target: "knacs::device", "probed, registers: {:?}", registers.map(|r| r.base));

        Ok(Self {
            pages: Arc::clone(pages),
            registers,
            stream,
            next_file: AtomicU64::new(1),
        })
    }

    pub fn open(&self) -> File {
        let id = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        log::trace!(target: "knacs::device", "open {id:?}");
        File { id }
    }

    /// Mappings created through `file` stay valid after this.
    pub fn release(&self, file: File) {
        log::trace!(target: "knacs::device", "release {:?}", file.id);
    }

    /// Map device memory into `mm`.
    ///
    /// # Errors
    /// [`DmaError::InvalidArgument`] for an unknown page offset, a private or
    /// empty DMA mapping, an oversized register mapping or an address range
    /// that collides with an existing mapping.
    pub fn mmap(&self, file: &File, mm: &mut UserMemory, request: MmapRequest) -> Result<()> {
        if !request.start.is_aligned::<Size4K>() {
            return Err(DmaError::InvalidArgument("unaligned mapping"));
        }

        let kind = match request.page_offset {
            0 => {
                let window = self.registers.ok_or(DmaError::InvalidArgument("no register window"))?;
                if request.len > window.len {
                    return Err(DmaError::InvalidArgument("mapping larger than the register window"));
                }
                VmaKind::Registers(window)
            }
            1 => {
                if !request.shared {
                    return Err(DmaError::InvalidArgument("DMA mappings must be shared"));
                }
                if request.len == 0 {
                    return Err(DmaError::InvalidArgument("empty mapping"));
                }
                VmaKind::DmaArea(DmaArea::new(&self.pages))
            }
            other => {
                log::warn!(target: "knacs::device", "mapping unknown pages at offset {other}");
                return Err(DmaError::InvalidArgument("unknown page offset"));
            }
        };

        mm.insert(Vma::new(request.start, request.len, file.id, kind))
    }

    /// # Errors
    /// See [`Request::decode`] and [`send_buffer`](Self::send_buffer).
    pub fn ioctl(
        &self,
        file: &File,
        mm: &mut UserMemory,
        command: IoctlCommand,
        arg: IoctlArg,
    ) -> Result<IoctlReply> {
        let request = Request::decode(command, arg).inspect_err(|err| {
            log::debug!(target: "knacs::device", "rejected ioctl {:#x}: {err}", command.into_bits());
        })?;

        match request {
            Request::GetVersion => Ok(IoctlReply::Version(Version {
                major: VERSION_MAJOR,
                minor: VERSION_MINOR,
            })),
            Request::SendDmaBuffer(desc) => {
                self.send_buffer(file, mm, desc)?;
                Ok(IoctlReply::Done)
            }
        }
    }

    /// Turn the start of a DMA mapping into a transmit packet.
    ///
    /// The mapping is removed from `mm`; its pages move to the stream
    /// without a copy and return to the pool once transmitted.
    ///
    /// # Errors
    /// - [`DmaError::InvalidArgument`] for an empty length, an address that
    ///   is not the start of a DMA mapping of `file`, a length past the end
    ///   of the mapping or one that is not a multiple of the transfer
    ///   granularity. Nothing changes in these cases.
    /// - [`DmaError::Fault`] if part of the range was never touched. The
    ///   mapping is gone by then.
    pub fn send_buffer(&self, file: &File, mm: &mut UserMemory, desc: DmaBufferDesc) -> Result<()> {
        let len = usize::try_from(desc.len).map_err(|_| DmaError::InvalidArgument("length out of range"))?;
        if len == 0 {
            return Err(DmaError::InvalidArgument("empty buffer"));
        }

        let start = desc.address();
        let vma = mm.find(start).ok_or(DmaError::InvalidArgument("address not mapped"))?;
        if vma.owner() != file.id {
            return Err(DmaError::InvalidArgument("mapping belongs to another file"));
        }
        let area = vma.area().ok_or(DmaError::InvalidArgument("not a DMA mapping"))?;
        if vma.start() != start {
            return Err(DmaError::InvalidArgument("buffer must start at the mapping"));
        }
        if len > vma.len() {
            return Err(DmaError::InvalidArgument("buffer exceeds the mapping"));
        }
        if len % self.stream.config().transfer_granularity != 0 {
            return Err(DmaError::InvalidArgument("length is not a multiple of the transfer size"));
        }

        let area = Arc::clone(area);
        drop(mm.unmap(start));

        let packet = {
            let guard = area.lock();
            if !guard.is_populated(pages_spanning::<Size4K>(len)) {
                return Err(DmaError::Fault("buffer has untouched pages"));
            }
            let packet = DmaPacket::from_area(&guard, len)?;
            guard.unlock();
            packet
        };
        drop(area);

        self.stream.send(packet)
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<RxBuffer> {
        self.stream.try_recv()
    }

    #[must_use]
    pub fn depths(&self) -> QueueDepths {
        self.stream.depths()
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    #[must_use]
    pub const fn stream(&self) -> &StreamEngine {
        &self.stream
    }

    /// Stop the stream and release everything still queued.
    pub fn remove(self) {
        self.stream.shutdown();
        log::info!(target: "knacs::device", "removed");
    }
}
