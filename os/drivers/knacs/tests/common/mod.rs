#![allow(dead_code)]

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use knacs::{
    Driver, File, FrameSource, HeapFrames, Knacs, MmapRequest, RegisterWindow, SoftChannel,
    SoftProvider, StreamConfig, UserMemory,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const MAP_BASE: u64 = 0x7f00_0000_0000;

pub const REGISTERS: RegisterWindow = RegisterWindow {
    base: PhysicalAddress::new(0x4000_0000),
    len: PAGE_SIZE,
};

/// A probed device over soft channels.
pub struct Rig {
    pub frames: Arc<HeapFrames>,
    pub driver: Driver,
    pub tx: Arc<SoftChannel>,
    pub rx: Arc<SoftChannel>,
    pub device: Knacs,
}

impl Rig {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_frames(config, HeapFrames::new())
    }

    pub fn with_frames(config: StreamConfig, frames: HeapFrames) -> Self {
        let frames = Arc::new(frames);
        let driver = Driver::init(Arc::clone(&frames) as Arc<dyn FrameSource>, &config).unwrap();
        let provider = SoftProvider::with_channels(&["axidma0", "axidma1"]).unwrap();
        let tx = provider.channel("axidma0").unwrap();
        let rx = provider.channel("axidma1").unwrap();
        let device = driver.probe(config, &provider, Some(REGISTERS)).unwrap();
        Self {
            frames,
            driver,
            tx,
            rx,
            device,
        }
    }

    /// Transmit only, so the wakeup count only moves with transmit traffic.
    pub fn tx_only() -> Self {
        Self::new(StreamConfig::default().with_receive(false))
    }

    /// Map `pages` pages of a fresh DMA area at `start`.
    pub fn map_area(&self, file: &File, mm: &mut UserMemory, start: u64, pages: usize) -> VirtualAddress {
        let start = VirtualAddress::new(start);
        self.device
            .mmap(
                file,
                mm,
                MmapRequest {
                    start,
                    len: pages * PAGE_SIZE,
                    page_offset: 1,
                    shared: true,
                },
            )
            .unwrap();
        start
    }

    pub fn outstanding(&self) -> usize {
        self.driver.pages().outstanding()
    }

    /// Remove the device and check nothing leaked.
    pub fn teardown(self) {
        let Self {
            frames,
            driver,
            tx,
            rx,
            device,
        } = self;
        device.remove();
        assert_eq!(tx.live_mappings(), 0);
        assert_eq!(rx.live_mappings(), 0);
        driver.exit().unwrap();
        drop((tx, rx));
        assert_eq!(frames.live(), 0);
    }
}

/// Poll `cond` for up to five seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
