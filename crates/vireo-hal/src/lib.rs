//! Host platform services consumed by the NVMe transport.
//!
//! The transport core never talks to the operating system directly. Whatever
//! environment hosts it (a DPDK-style runtime, a VFIO harness, a test rig)
//! supplies two seams:
//!
//! - [`DmaMemory`]: pinned, zeroed, bus-addressable allocations plus
//!   virtual-to-bus translation of caller buffers
//! - [`PciFunction`]: BAR mapping and config space access for one PCI function
//!
//! Implementations own the actual mappings; the transport only holds the
//! (virtual, bus, length) descriptors handed back through [`DmaBuffer`] and
//! [`BarMapping`].

use std::ptr::NonNull;
use thiserror::Error;

/// Host page size assumed by the transport's PRP arithmetic.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("no bus mapping for virtual address {addr:#x}")]
    NoTranslation { addr: usize },

    #[error("BAR {bar} is not present or could not be mapped")]
    BarUnavailable { bar: u8 },

    #[error("config space access at {offset:#x} out of range")]
    CfgOutOfRange { offset: u16 },
}

/// A pinned, DMA-visible allocation.
///
/// The implementation that produced the buffer keeps the backing mapping
/// alive until the buffer is handed back through [`DmaMemory::dma_free`].
#[derive(Debug)]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    bus: u64,
    len: usize,
}

// The descriptor is an exclusive handle to its mapping; the mapping itself
// is pinned and valid from any thread.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn new(virt: NonNull<u8>, bus: u64, len: usize) -> Self {
        Self { virt, bus, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A mapped PCI base address register.
#[derive(Debug)]
pub struct BarMapping {
    virt: NonNull<u8>,
    bus: u64,
    len: usize,
}

unsafe impl Send for BarMapping {}
unsafe impl Sync for BarMapping {}

impl BarMapping {
    pub fn new(virt: NonNull<u8>, bus: u64, len: usize) -> Self {
        Self { virt, bus, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Vendor/device identity of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciId {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subvendor_id: u16,
    pub subdevice_id: u16,
}

/// DMA-safe memory services.
///
/// `vtophys` must resolve any address inside a live [`DmaBuffer`] as well as
/// caller payload buffers that were pinned by the same environment.
pub trait DmaMemory: Send + Sync {
    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    /// Returns `None` when the environment is out of DMA-safe memory.
    fn dma_zalloc(&self, len: usize, align: usize) -> Option<DmaBuffer>;

    fn dma_free(&self, buf: DmaBuffer);

    /// Translate a virtual address to its bus address.
    fn vtophys(&self, virt: *const u8) -> Result<u64, HalError>;
}

/// Access to one PCI function: BAR mappings and config space.
pub trait PciFunction: Send {
    fn map_bar(&mut self, bar: u8) -> Result<BarMapping, HalError>;

    fn unmap_bar(&mut self, bar: u8, mapping: BarMapping);

    fn cfg_read32(&mut self, offset: u16) -> u32;

    fn cfg_write32(&mut self, offset: u16, value: u32);

    fn id(&self) -> PciId;
}
