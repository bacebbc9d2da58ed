//! The packet streaming engine.
//!
//! Four queues move packets between user requests, the DMA channels and a
//! worker thread:
//!
//! - `to_write`: transmit packets handed in by [`StreamEngine::send`], mapped
//!   but not yet submitted.
//! - `written_wait`: transmit packets submitted to the engine.
//! - `to_read`: receive packets submitted to the engine.
//! - `read_wait`: completed receive packets waiting for a consumer.
//!
//! All four, and every `finished` flag, sit behind one [`SpinLock`] that the
//! completion callback may take. Everything that can block or allocate runs
//! on the worker thread with the lock released.

use crate::channel::{DmaChannel, Direction};
use crate::completion::Completion;
use crate::config::StreamConfig;
use crate::error::{DmaError, Result};
use crate::packet::DmaPacket;
use crate::page_mgr::PageManager;
use kernel_sync::SpinLock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the worker sleeps before retrying a short receive queue.
const REFILL_RETRY: Duration = Duration::from_millis(10);

struct Inflight {
    id: u64,
    packet: DmaPacket,
    finished: bool,
    residue: usize,
}

impl Inflight {
    const fn new(id: u64, packet: DmaPacket) -> Self {
        Self {
            id,
            packet,
            finished: false,
            residue: 0,
        }
    }
}

#[derive(Default)]
struct Queues {
    to_write: VecDeque<DmaPacket>,
    /// Spliced out of `to_write` by the worker, not yet in `written_wait`.
    submitting: usize,
    written_wait: Vec<Inflight>,
    to_read: Vec<Inflight>,
    read_wait: VecDeque<Inflight>,
}

impl Queues {
    fn mark_finished(&mut self, id: u64, residue: usize) -> bool {
        let entry = self
            .written_wait
            .iter_mut()
            .chain(self.to_read.iter_mut())
            .find(|e| e.id == id);
        match entry {
            Some(entry) => {
                entry.finished = true;
                entry.residue = residue;
                true
            }
            None => false,
        }
    }
}

/// The part of the engine reachable from completion context.
struct CompletionSide {
    queues: SpinLock<Queues>,
    signal: Completion,
}

/// Handed to [`DmaChannel::submit`]; fired once the transfer is done.
///
/// The only things it can do are flag its packet as finished and wake the
/// worker. Neither blocks nor allocates.
#[must_use = "a dropped handle never completes its packet"]
pub struct CompletionHandle {
    side: Arc<CompletionSide>,
    id: u64,
}

impl CompletionHandle {
    pub fn complete(self) {
        self.complete_with_residue(0);
    }

    /// Complete a transfer that moved `residue` bytes less than described.
    pub fn complete_with_residue(self, residue: usize) {
        let found = self.side.queues.lock().mark_finished(self.id, residue);
        if found {
            self.side.signal.complete();
        }
    }
}

impl core::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Queue occupancy, taken under the queue lock.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub to_write: usize,
    pub submitting: usize,
    pub written_wait: usize,
    pub to_read: usize,
    pub read_wait: usize,
}

impl QueueDepths {
    /// Transmit packets somewhere between `send` and completion.
    #[must_use]
    pub const fn tx_pending(&self) -> usize {
        self.to_write + self.submitting + self.written_wait
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Transmit packets completed.
    pub sent: u64,
    /// Transmit packets dropped because they could not be submitted.
    pub send_failures: u64,
    /// Receive packets completed.
    pub received: u64,
    /// Completed receive packets freed without being consumed.
    pub rx_dropped: u64,
    /// Times the worker was signalled.
    pub wakeups: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    rx_dropped: AtomicU64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Destination {
    WrittenWait,
    ToRead,
}

struct Shared {
    config: StreamConfig,
    pages: Arc<PageManager>,
    tx: Arc<dyn DmaChannel>,
    rx: Arc<dyn DmaChannel>,
    side: Arc<CompletionSide>,
    stop: AtomicBool,
    /// Set while the receive queue sits below `rx_depth` after a failure.
    refill_stalled: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn queues(&self) -> &SpinLock<Queues> {
        &self.side.queues
    }

    /// Submit a mapped packet and park it in `dest`.
    ///
    /// On failure the packet is dropped (unmapped and freed) once the queue
    /// lock is released, and the error returned.
    fn queue(&self, packet: DmaPacket, dest: Destination) -> Result<()> {
        let Some((channel, direction)) = packet.mapping() else {
            self.abandon_submission(dest);
            return Err(DmaError::InvalidArgument("packet is not mapped"));
        };
        let channel = Arc::clone(channel);

        let Some(descriptor) = channel.prep_slave_sg(packet.sg(), direction) else {
            self.abandon_submission(dest);
            return Err(DmaError::OutOfMemory);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queues = self.queues().lock();
            let entry = Inflight::new(id, packet);
            match dest {
                Destination::WrittenWait => {
                    queues.written_wait.push(entry);
                    queues.submitting -= 1;
                }
                Destination::ToRead => queues.to_read.push(entry),
            }
        }

        let handle = CompletionHandle {
            side: Arc::clone(&self.side),
            id,
        };
        match channel.submit(descriptor, handle) {
            Ok(cookie) => {
                log::trace!(target: "knacs::stream", "packet {id} submitted on {} as cookie {}", channel.name(), cookie.0);
                channel.issue_pending();
                Ok(())
            }
            Err(err) => {
                let removed = {
                    let mut queues = self.queues().lock();
                    match dest {
                        Destination::WrittenWait => take_by_id(&mut queues.written_wait, id),
                        Destination::ToRead => take_by_id(&mut queues.to_read, id),
                    }
                };
                drop(removed);
                Err(err)
            }
        }
    }

    fn abandon_submission(&self, dest: Destination) {
        if dest == Destination::WrittenWait {
            self.queues().lock().submitting -= 1;
        }
    }

    /// One pass over all queues. Returns `false` while the receive queue
    /// could not be topped up, so the caller knows to retry.
    fn run_cycle(&self) -> bool {
        self.flush_writes();
        self.reap_written();
        if !self.config.receive {
            return true;
        }
        self.harvest_reads();
        self.trim_backlog();
        self.refill_reads()
    }

    fn flush_writes(&self) {
        let batch = {
            let mut queues = self.queues().lock();
            let batch = core::mem::take(&mut queues.to_write);
            queues.submitting += batch.len();
            batch
        };

        for packet in batch {
            let len = packet.len();
            if let Err(err) = self.queue(packet, Destination::WrittenWait) {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: "knacs::stream", "dropping {len}-byte transmit packet: {err}");
            }
        }
    }

    fn reap_written(&self) {
        let done: Vec<Inflight> = self
            .queues()
            .lock()
            .written_wait
            .extract_if(.., |e| e.finished)
            .collect();
        if done.is_empty() {
            return;
        }

        self.counters
            .sent
            .fetch_add(done.len() as u64, Ordering::Relaxed);
        log::trace!(target: "knacs::stream", "{} transmit packets completed", done.len());
    }

    fn harvest_reads(&self) {
        let mut done: Vec<Inflight> = self
            .queues()
            .lock()
            .to_read
            .extract_if(.., |e| e.finished)
            .collect();
        if done.is_empty() {
            return;
        }

        for entry in &mut done {
            entry.packet.unmap();
        }
        self.counters
            .received
            .fetch_add(done.len() as u64, Ordering::Relaxed);
        self.queues().lock().read_wait.extend(done);
    }

    /// Top `to_read` up to `rx_depth`. Returns whether it got there.
    fn refill_reads(&self) -> bool {
        let missing = self
            .config
            .rx_depth
            .saturating_sub(self.queues().lock().to_read.len());

        for _ in 0..missing {
            if let Err(err) = self.add_read() {
                self.refill_failed(&err);
                return false;
            }
        }
        if self.refill_stalled.swap(false, Ordering::Relaxed) {
            log::info!(target: "knacs::stream", "receive queue back at depth {}", self.config.rx_depth);
        }
        true
    }

    fn add_read(&self) -> Result<()> {
        let mut packet = DmaPacket::fresh(&self.pages, self.config.rx_packet_pages)?;
        packet.map(&self.rx, Direction::DevToMem)?;
        self.queue(packet, Destination::ToRead)
    }

    /// Warn once per stall; the retries that follow stay quiet.
    fn refill_failed(&self, err: &DmaError) {
        if self.refill_stalled.swap(true, Ordering::Relaxed) {
            log::trace!(target: "knacs::stream", "receive refill retry failed: {err}");
        } else {
            log::warn!(target: "knacs::stream", "cannot top up receive queue: {err}");
        }
    }

    fn trim_backlog(&self) {
        let dropped: Vec<Inflight> = {
            let mut queues = self.queues().lock();
            let excess = queues
                .read_wait
                .len()
                .saturating_sub(self.config.rx_backlog);
            queues.read_wait.drain(..excess).collect()
        };
        if !dropped.is_empty() {
            self.counters
                .rx_dropped
                .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        }
    }

    fn worker(&self) {
        log::info!(target: "knacs::stream", "worker started");
        let mut settled = true;
        loop {
            if settled {
                self.side.signal.wait();
            } else {
                // Pages only come back through drops nobody signals for.
                self.side.signal.wait_timeout(REFILL_RETRY);
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            settled = self.run_cycle();
        }
        log::info!(target: "knacs::stream", "worker stopped");
    }
}

fn take_by_id(list: &mut Vec<Inflight>, id: u64) -> Option<Inflight> {
    let index = list.iter().position(|e| e.id == id)?;
    Some(list.swap_remove(index))
}

/// A completed receive packet.
#[derive(Debug)]
pub struct RxBuffer {
    packet: DmaPacket,
    len: usize,
}

impl RxBuffer {
    /// Bytes the device delivered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the received bytes into `buf`; returns the count copied.
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        self.packet.copy_to(buf, self.len)
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.len];
        let n = self.copy_to(&mut bytes);
        bytes.truncate(n);
        bytes
    }
}

/// One streaming engine with its worker thread.
pub struct StreamEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamEngine {
    /// Start the worker and prime the receive queue.
    ///
    /// # Errors
    /// - [`DmaError::InvalidArgument`] for an invalid `config`.
    /// - [`DmaError::OutOfMemory`] if the worker cannot be spawned.
    pub fn start(
        config: StreamConfig,
        pages: Arc<PageManager>,
        tx: Arc<dyn DmaChannel>,
        rx: Arc<dyn DmaChannel>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            config,
            pages,
            tx,
            rx,
            side: Arc::new(CompletionSide {
                queues: SpinLock::new(Queues::default()),
                signal: Completion::new(),
            }),
            stop: AtomicBool::new(false),
            refill_stalled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("knacs-dma".into())
                .spawn(move || shared.worker())
                .map_err(|_| DmaError::OutOfMemory)?
        };

        // First cycle fills the receive queue.
        shared.side.signal.complete();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Map `packet` for transmit, queue it and wake the worker.
    ///
    /// # Errors
    /// - [`DmaError::Busy`] once the engine is shut down.
    /// - Mapping errors from the transmit channel; the packet is dropped.
    pub fn send(&self, mut packet: DmaPacket) -> Result<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(DmaError::Busy("stream is shut down"));
        }
        packet.map(&self.shared.tx, Direction::MemToDev)?;
        log::debug!(target: "knacs::stream", "queueing {}-byte transmit packet", packet.len());

        // `shutdown` raises `stop` before it drains the queues under this lock.
        let refused = {
            let mut queues = self.shared.queues().lock();
            if self.shared.stop.load(Ordering::Acquire) {
                Some(packet)
            } else {
                queues.to_write.push_back(packet);
                None
            }
        };
        if let Some(packet) = refused {
            drop(packet);
            return Err(DmaError::Busy("stream is shut down"));
        }
        self.shared.side.signal.complete();
        Ok(())
    }

    /// Take the oldest completed receive packet, if any are retained.
    #[must_use]
    pub fn try_recv(&self) -> Option<RxBuffer> {
        let entry = self.shared.queues().lock().read_wait.pop_front()?;
        let len = entry.packet.len().saturating_sub(entry.residue);
        Some(RxBuffer {
            packet: entry.packet,
            len,
        })
    }

    #[must_use]
    pub fn depths(&self) -> QueueDepths {
        let queues = self.shared.queues().lock();
        QueueDepths {
            to_write: queues.to_write.len(),
            submitting: queues.submitting,
            written_wait: queues.written_wait.len(),
            to_read: queues.to_read.len(),
            read_wait: queues.read_wait.len(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let counters = &self.shared.counters;
        StreamStats {
            sent: counters.sent.load(Ordering::Relaxed),
            send_failures: counters.send_failures.load(Ordering::Relaxed),
            received: counters.received.load(Ordering::Relaxed),
            rx_dropped: counters.rx_dropped.load(Ordering::Relaxed),
            wakeups: self.shared.side.signal.signals(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    /// Stop the worker, abort in-flight transfers and free every queued
    /// packet. Idempotent.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        // The flag has to be visible before the wakeup, or the worker runs
        // another cycle and goes back to sleep for good.
        self.shared.stop.store(true, Ordering::Release);
        self.shared.side.signal.complete();
        if worker.join().is_err() {
            log::error!(target: "knacs::stream", "worker panicked");
        }

        self.shared.tx.terminate_all();
        self.shared.rx.terminate_all();

        let queues = self.shared.queues().take();
        let leftover = queues.to_write.len()
            + queues.written_wait.len()
            + queues.to_read.len()
            + queues.read_wait.len();
        drop(queues);
        log::debug!(target: "knacs::stream", "released {leftover} queued packets");
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
