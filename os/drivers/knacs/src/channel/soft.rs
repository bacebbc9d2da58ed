//! An in-memory DMA engine.
//!
//! Bus addresses are the physical addresses of the mapped pages. Submitted
//! descriptors wait until `issue_pending`, then a per-channel completion
//! thread moves the bytes and fires the completion handles. Transmit
//! descriptors complete right away and their bytes are recorded; receive
//! descriptors complete one fed chunk at a time.

use super::{Cookie, DmaChannel, DmaProvider, Direction, SgEntry, TxDescriptor};
use crate::config::ChannelConfig;
use crate::error::{DmaError, Result};
use crate::page_mgr::PooledPage;
use crate::stream::CompletionHandle;
use kernel_memory_addresses::BusAddress;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A live device mapping.
struct Mapping {
    ptr: *mut u8,
    len: usize,
    direction: Direction,
}

// Safety: the pointee is a mapped DMA page; the owning packet keeps it alive
// until it unmaps, and all access happens under the channel state lock.
unsafe impl Send for Mapping {}

struct Submitted {
    cookie: Cookie,
    descriptor: TxDescriptor,
    on_complete: CompletionHandle,
}

#[derive(Default)]
struct State {
    /// A page may be mapped more than once at the same bus address.
    mappings: BTreeMap<u64, Vec<Mapping>>,
    submitted: Vec<Submitted>,
    issued: VecDeque<Submitted>,
    feed: VecDeque<Vec<u8>>,
    transmitted: Vec<Vec<u8>>,
    next_cookie: u32,
    paused: bool,
    shutdown: bool,
    fail_next_submit: bool,
    fail_next_prep: bool,
    fail_map_after: Option<usize>,
    config: Option<ChannelConfig>,
}

impl State {
    /// Index of the first issued descriptor that can complete now.
    fn next_ready(&self) -> Option<usize> {
        if self.paused {
            return None;
        }
        self.issued.iter().position(|s| match s.descriptor.direction() {
            Direction::MemToDev => true,
            Direction::DevToMem => !self.feed.is_empty(),
        })
    }

    /// Move the bytes of `descriptor`. Returns the residue.
    fn transfer(&mut self, descriptor: &TxDescriptor) -> usize {
        match descriptor.direction() {
            Direction::MemToDev => {
                let mut bytes = Vec::with_capacity(descriptor.length());
                for entry in descriptor.entries() {
                    if let Some(src) = self.resolve(entry) {
                        // SAFETY: `resolve` checked the range lies in a live mapping.
                        bytes.extend_from_slice(unsafe { core::slice::from_raw_parts(src, entry.length) });
                    }
                }
                self.transmitted.push(bytes);
                0
            }
            Direction::DevToMem => {
                let chunk = self.feed.pop_front().unwrap_or_default();
                let mut offset = 0;
                for entry in descriptor.entries() {
                    let n = entry.length.min(chunk.len() - offset);
                    if n == 0 {
                        break;
                    }
                    if let Some(dst) = self.resolve(entry) {
                        // SAFETY: as above; `n <= entry.length`.
                        unsafe { core::ptr::copy_nonoverlapping(chunk[offset..].as_ptr(), dst, n) };
                    }
                    offset += n;
                }
                descriptor.length() - offset
            }
        }
    }

    fn resolve(&self, entry: &SgEntry) -> Option<*mut u8> {
        self.mappings
            .get(&entry.address.as_u64())?
            .iter()
            .find(|m| entry.length <= m.len)
            .map(|m| m.ptr)
    }
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

impl Inner {
    fn run(&self, name: &str) {
        loop {
            let mut state = self.state.lock();
            let index = loop {
                if state.shutdown {
                    return;
                }
                if let Some(index) = state.next_ready() {
                    break index;
                }
                self.cond.wait(&mut state);
            };

            let Some(item) = state.issued.remove(index) else {
                continue;
            };
            let residue = state.transfer(&item.descriptor);
            drop(state);

            log::trace!(target: "knacs::soft", "{name}: cookie {} done, residue {residue}", item.cookie.0);
            item.on_complete.complete_with_residue(residue);
        }
    }
}

/// A software [`DmaChannel`].
pub struct SoftChannel {
    name: String,
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SoftChannel {
    /// # Errors
    /// [`DmaError::OutOfMemory`] if the completion thread cannot be spawned.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });

        let thread = {
            let inner = Arc::clone(&inner);
            let thread_name = name.clone();
            thread::Builder::new()
                .name(format!("{name}-irq"))
                .spawn(move || inner.run(&thread_name))
                .map_err(|_| DmaError::OutOfMemory)?
        };

        Ok(Arc::new(Self {
            name,
            inner,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Hold completions back until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.cond.notify_all();
    }

    /// Make `bytes` available to the next receive descriptor.
    pub fn feed(&self, bytes: impl Into<Vec<u8>>) {
        self.inner.state.lock().feed.push_back(bytes.into());
        self.inner.cond.notify_all();
    }

    /// Bytes of every completed transmit, in completion order.
    #[must_use]
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().transmitted.clone()
    }

    /// Descriptors submitted or issued but not completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let state = self.inner.state.lock();
        state.submitted.len() + state.issued.len()
    }

    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.inner.state.lock().mappings.values().map(Vec::len).sum()
    }

    /// The last configuration applied.
    #[must_use]
    pub fn config(&self) -> Option<ChannelConfig> {
        self.inner.state.lock().config
    }

    pub fn fail_next_submit(&self) {
        self.inner.state.lock().fail_next_submit = true;
    }

    pub fn fail_next_prep(&self) {
        self.inner.state.lock().fail_next_prep = true;
    }

    /// Let `successes` more page mappings succeed, then fail one.
    pub fn fail_map_after(&self, successes: usize) {
        self.inner.state.lock().fail_map_after = Some(successes);
    }
}

impl DmaChannel for SoftChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn map_page(&self, page: &PooledPage, len: usize, direction: Direction) -> Result<BusAddress> {
        let mut state = self.inner.state.lock();
        match state.fail_map_after {
            Some(0) => {
                state.fail_map_after = None;
                return Err(DmaError::Submission("page mapping failed"));
            }
            Some(n) => state.fail_map_after = Some(n - 1),
            None => {}
        }

        let address = BusAddress::identity(page.phys());
        let mapping = Mapping {
            ptr: page.as_ptr(),
            len,
            direction,
        };
        state.mappings.entry(address.as_u64()).or_default().push(mapping);
        Ok(address)
    }

    fn unmap_page(&self, address: BusAddress, len: usize, direction: Direction) {
        let mut state = self.inner.state.lock();
        let Some(list) = state.mappings.get_mut(&address.as_u64()) else {
            log::warn!(target: "knacs::soft", "{}: unmap of unmapped {address}", self.name);
            return;
        };
        match list.iter().position(|m| m.len == len && m.direction == direction) {
            Some(index) => {
                list.swap_remove(index);
            }
            None => {
                log::warn!(target: "knacs::soft", "{}: unmap of {address} does not match its mapping", self.name);
                list.pop();
            }
        }
        if list.is_empty() {
            state.mappings.remove(&address.as_u64());
        }
    }

    fn prep_slave_sg(&self, sg: &[SgEntry], direction: Direction) -> Option<TxDescriptor> {
        let mut state = self.inner.state.lock();
        if core::mem::take(&mut state.fail_next_prep) || sg.is_empty() {
            return None;
        }
        Some(TxDescriptor::new(sg.to_vec(), direction))
    }

    fn submit(&self, descriptor: TxDescriptor, on_complete: CompletionHandle) -> Result<Cookie> {
        let mut state = self.inner.state.lock();
        if core::mem::take(&mut state.fail_next_submit) {
            return Err(DmaError::Submission("descriptor rejected"));
        }
        let cookie = Cookie(state.next_cookie);
        state.next_cookie = state.next_cookie.wrapping_add(1);
        state.submitted.push(Submitted {
            cookie,
            descriptor,
            on_complete,
        });
        Ok(cookie)
    }

    fn issue_pending(&self) {
        let mut state = self.inner.state.lock();
        let submitted = core::mem::take(&mut state.submitted);
        state.issued.extend(submitted);
        drop(state);
        self.inner.cond.notify_all();
    }

    fn terminate_all(&self) {
        // The completion thread copies only while holding the state lock, so
        // once we own it nothing touches mapped memory any more.
        let (submitted, issued) = {
            let mut state = self.inner.state.lock();
            (
                core::mem::take(&mut state.submitted),
                core::mem::take(&mut state.issued),
            )
        };
        let aborted = submitted.len() + issued.len();
        if aborted > 0 {
            log::debug!(target: "knacs::soft", "{}: aborted {aborted} descriptors", self.name);
        }
    }

    fn configure(&self, config: &ChannelConfig) -> Result<()> {
        if config.coalesce == 0 {
            return Err(DmaError::InvalidArgument("coalesce count must be at least 1"));
        }
        self.inner.state.lock().config = Some(*config);
        Ok(())
    }
}

impl Drop for SoftChannel {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cond.notify_all();
        if let Some(thread) = self.thread.get_mut().take()
            && thread.join().is_err()
        {
            log::error!(target: "knacs::soft", "{}: completion thread panicked", self.name);
        }
    }
}

/// A [`DmaProvider`] over named [`SoftChannel`]s.
#[derive(Default)]
pub struct SoftProvider {
    channels: HashMap<String, Arc<SoftChannel>>,
}

impl SoftProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with the usual transmit and receive channels.
    ///
    /// # Errors
    /// See [`SoftChannel::new`].
    pub fn with_channels(names: &[&str]) -> Result<Self> {
        let mut provider = Self::new();
        for name in names {
            provider.add(name)?;
        }
        Ok(provider)
    }

    /// Create and register a channel.
    ///
    /// # Errors
    /// See [`SoftChannel::new`].
    pub fn add(&mut self, name: &str) -> Result<Arc<SoftChannel>> {
        let channel = SoftChannel::new(name)?;
        self.channels.insert(name.to_owned(), Arc::clone(&channel));
        Ok(channel)
    }

    #[must_use]
    pub fn channel(&self, name: &str) -> Option<Arc<SoftChannel>> {
        self.channels.get(name).cloned()
    }
}

impl DmaProvider for SoftProvider {
    fn request_channel(&self, name: &str) -> Result<Arc<dyn DmaChannel>> {
        self.channels
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn DmaChannel>)
            .ok_or_else(|| DmaError::NoChannel(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_is_reported() {
        let provider = SoftProvider::with_channels(&["axidma0"]).unwrap();
        assert!(provider.request_channel("axidma0").is_ok());
        assert_eq!(
            provider.request_channel("axidma7").err(),
            Some(DmaError::NoChannel("axidma7".into()))
        );
    }

    #[test]
    fn zero_coalesce_is_rejected() {
        let channel = SoftChannel::new("axidma0").unwrap();
        let bad = ChannelConfig {
            coalesce: 0,
            delay: 0,
        };
        assert!(channel.configure(&bad).is_err());
        assert_eq!(channel.config(), None);
        channel.configure(&ChannelConfig::default()).unwrap();
        assert_eq!(channel.config(), Some(ChannelConfig::default()));
    }

    #[test]
    fn prep_failure_is_one_shot() {
        let channel = SoftChannel::new("axidma0").unwrap();
        let sg = [SgEntry {
            address: BusAddress::new(0x1000),
            length: 16,
        }];
        channel.fail_next_prep();
        assert!(channel.prep_slave_sg(&sg, Direction::MemToDev).is_none());
        let descriptor = channel.prep_slave_sg(&sg, Direction::MemToDev).unwrap();
        assert_eq!(descriptor.length(), 16);
    }
}
