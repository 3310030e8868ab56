//! Raw packet I/O capability.
//!
//! The core never looks inside an adapter. It opens one per configured
//! interface through an [`AdapterFactory`], stores it in a
//! [`crate::raw::RawItem`], lets workers send and receive frames through it,
//! and closes it by dropping it once no worker can reach it anymore.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_queue::SegQueue;
use tracing::debug;

use crate::config::CapabilityFlags;

/// Packet I/O bound to one network interface.
///
/// Shared by all workers of one raw-set generation, so every method takes
/// `&self`. Dropping the adapter closes it.
pub trait Adapter: Send + Sync {
    fn ifname(&self) -> &str;

    /// Hardware address of the interface, if the backend can discover it.
    fn mac_address(&self) -> Option<[u8; 6]>;

    /// Receive one frame into `buf`. `Ok(None)` means nothing is pending.
    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    fn send(&self, frame: &[u8]) -> io::Result<()>;
}

/// Opens adapters for the control thread.
pub trait AdapterFactory: Send + Sync {
    fn open(&self, ifname: &str, flags: &CapabilityFlags) -> io::Result<Box<dyn Adapter>>;
}

/// Factory for builds without a raw capture backend.
#[derive(Debug, Default)]
pub struct UnsupportedAdapters;

impl AdapterFactory for UnsupportedAdapters {
    fn open(&self, ifname: &str, flags: &CapabilityFlags) -> io::Result<Box<dyn Adapter>> {
        let backend = if flags.pfring { "PF_RING" } else { "raw socket" };
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no {backend} backend available for {ifname}"),
        ))
    }
}

/// In-memory frame queues standing in for one interface.
#[derive(Debug, Default)]
pub struct MemoryWire {
    inbound: SegQueue<Vec<u8>>,
    outbound: SegQueue<Vec<u8>>,
}

impl MemoryWire {
    /// Queue a frame for adapters on this wire to receive.
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbound.push(frame);
    }

    /// Drain every frame the adapters have sent.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.outbound.pop()).collect()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }
}

/// Adapter over a [`MemoryWire`]; used for offline mode and tests.
pub struct MemoryAdapter {
    ifname: String,
    mac: [u8; 6],
    wire: Arc<MemoryWire>,
    closed: Arc<AtomicUsize>,
}

impl Adapter for MemoryAdapter {
    fn ifname(&self) -> &str {
        &self.ifname
    }

    fn mac_address(&self) -> Option<[u8; 6]> {
        Some(self.mac)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let Some(frame) = self.wire.inbound.pop() else {
            return Ok(None);
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(Some(len))
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.wire.outbound.push(frame.to_vec());
        Ok(())
    }
}

impl Drop for MemoryAdapter {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        debug!(ifname = %self.ifname, "memory adapter closed");
    }
}

/// Factory handing out [`MemoryAdapter`]s, one wire per interface name.
///
/// Reopening an interface attaches to the same wire, so frames injected before
/// and after a raw-set swap reach whichever generation is current.
#[derive(Default)]
pub struct MemoryAdapters {
    wires: Mutex<HashMap<String, Arc<MemoryWire>>>,
    refuse: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl MemoryAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wire behind `ifname`, created on first use.
    pub fn wire(&self, ifname: &str) -> Arc<MemoryWire> {
        let mut wires = self.wires.lock().unwrap_or_else(PoisonError::into_inner);
        wires.entry(ifname.to_string()).or_default().clone()
    }

    /// Make every later open of `ifname` fail.
    pub fn refuse(&self, ifname: &str) {
        self.refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ifname.to_string());
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Adapters opened and not yet closed.
    pub fn open_count(&self) -> usize {
        self.opened() - self.closed()
    }

    fn mac_for(ifname: &str) -> [u8; 6] {
        let hash = ifname
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        let [a, b, c, d] = hash.to_be_bytes();
        [0x02, 0x00, a, b, c, d]
    }
}

impl AdapterFactory for MemoryAdapters {
    fn open(&self, ifname: &str, _flags: &CapabilityFlags) -> io::Result<Box<dyn Adapter>> {
        let refused = self
            .refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|name| name == ifname);
        if refused {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such interface: {ifname}"),
            ));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryAdapter {
            ifname: ifname.to_string(),
            mac: Self::mac_for(ifname),
            wire: self.wire(ifname),
            closed: self.closed.clone(),
        }))
    }
}
