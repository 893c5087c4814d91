//! Access to the DMA controller's registers.
use core::ptr;

use crate::{config::DmaConfig, dmac::control_block::ControlBlock};

/// The capability to read and write the DMA controller's 32-bit registers.
///
/// Implementations must be strongly ordered with respect to the DMA
/// controller: a write is visible to the controller before the next access
/// through the same port.
pub trait RegisterPort {
    /// Reads the 32-bit register at `addr`.
    fn read32(&self, addr: u32) -> u32;

    /// Writes `value` to the 32-bit register at `addr`.
    fn write32(&self, addr: u32, value: u32);

    /// Returns the address at which the DMA engine will find `block`.
    fn bus_address(&self, block: &ControlBlock) -> u32;
}

impl<P: RegisterPort + ?Sized> RegisterPort for &P {
    #[inline]
    fn read32(&self, addr: u32) -> u32 {
        P::read32(self, addr)
    }

    #[inline]
    fn write32(&self, addr: u32, value: u32) {
        P::write32(self, addr, value)
    }

    #[inline]
    fn bus_address(&self, block: &ControlBlock) -> u32 {
        P::bus_address(self, block)
    }
}

/// Volatile memory-mapped register access.
///
/// Control blocks are published at their CPU address, OR-ed with a bus
/// alias. The BCM2835's DMA engines see SDRAM through the VideoCore bus, so
/// the alias selects which of its cached or uncached views is used.
#[derive(Copy, Clone, Debug)]
pub struct Mmio {
    bus_alias: u32,
}

impl Mmio {
    /// # Safety
    ///
    /// Every address later passed to [`RegisterPort::read32`] and
    /// [`RegisterPort::write32`] must be a valid, identity-mapped device
    /// register, and control blocks must live in the low 4 GiB of the
    /// address space.
    #[must_use]
    pub const unsafe fn new(bus_alias: u32) -> Self {
        Self { bus_alias }
    }

    /// # Safety
    ///
    /// See [`Mmio::new`]. The register map in `config` must match the SoC
    /// this is running on.
    #[must_use]
    pub const unsafe fn from_config(config: &DmaConfig) -> Self {
        Self::new(config.bus_alias)
    }
}

impl RegisterPort for Mmio {
    #[inline]
    fn read32(&self, addr: u32) -> u32 {
        unsafe { ptr::read_volatile(addr as usize as *const u32) }
    }

    #[inline]
    fn write32(&self, addr: u32, value: u32) {
        unsafe { ptr::write_volatile(addr as usize as *mut u32, value) }
    }

    #[inline]
    fn bus_address(&self, block: &ControlBlock) -> u32 {
        (block as *const ControlBlock as usize as u32) | self.bus_alias
    }
}
