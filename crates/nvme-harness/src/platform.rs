//! Host-side collaborators the engine is written against.
//!
//! The harness never touches hardware directly. Physical memory, user pages,
//! coherent DMA memory, the BAR0 register window and interrupt vectors are all
//! reached through the traits below, so the same engine runs against a kernel
//! shim or against the in-process simulator.

use std::sync::Arc;

use crate::error::PlatformError;
use crate::irq::InterruptScheme;

/// Physical memory access used to fill descriptor pages and to read/write
/// queue rings.
pub trait MemoryBus: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), PlatformError>;
    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), PlatformError>;

    fn read_u16(&self, paddr: u64) -> Result<u16, PlatformError> {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u64(&self, paddr: u64) -> Result<u64, PlatformError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, paddr: u64, val: u64) -> Result<(), PlatformError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    /// Zero `len` bytes starting at `paddr`.
    fn fill_zero(&self, paddr: u64, len: usize) -> Result<(), PlatformError> {
        const CHUNK: usize = 512;
        let zeros = [0u8; CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK);
            self.write_physical(paddr + done as u64, &zeros[..n])?;
            done += n;
        }
        Ok(())
    }
}

/// The test program's address space.
pub trait UserMemory: Send + Sync {
    fn copy_from_user(&self, uaddr: u64, buf: &mut [u8]) -> Result<(), PlatformError>;
    fn copy_to_user(&self, uaddr: u64, buf: &[u8]) -> Result<(), PlatformError>;

    /// Pin `count` pages starting at the page-aligned address `uaddr` and
    /// return the physical frame address of each page, in order.
    ///
    /// Either every page is pinned or none is.
    fn pin_user_pages(&self, uaddr: u64, count: usize) -> Result<Vec<u64>, PlatformError>;

    /// Drop one pin from each frame. `dirty` marks the pages as written by the
    /// device.
    fn unpin_user_pages(&self, frames: &[u64], dirty: bool);
}

/// Coherent DMA memory. Returned regions are zeroed and page aligned.
pub trait DmaMemory: Send + Sync {
    fn alloc_coherent(&self, len: usize) -> Result<u64, PlatformError>;
    fn free_coherent(&self, paddr: u64, len: usize);
}

/// BAR0 register window of the controller.
pub trait RegisterBus: Send + Sync {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);
    fn read64(&self, offset: u64) -> u64;
    fn write64(&self, offset: u64, value: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    /// The vector did not belong to this device.
    None,
}

/// Top-half entry point registered for each interrupt vector.
pub trait IrqHandler: Send + Sync {
    fn handle(&self, vector: u32) -> IrqReturn;
}

/// Vector allocation and per-vector masking owned by the host's PCI layer.
pub trait InterruptController: Send + Sync {
    /// Number of lines the device advertises for `scheme`; `0` means the
    /// scheme is unsupported.
    fn max_lines(&self, scheme: InterruptScheme) -> u16;

    /// Allocate `count` vectors for `scheme`, returning one platform vector
    /// per line in line order.
    fn enable_interrupts(
        &self,
        scheme: InterruptScheme,
        count: u16,
    ) -> Result<Vec<u32>, PlatformError>;

    fn disable_interrupts(&self, scheme: InterruptScheme);

    fn request_irq(&self, vector: u32, handler: Arc<dyn IrqHandler>) -> Result<(), PlatformError>;

    fn free_irq(&self, vector: u32);

    /// Set or clear the mask bit of an MSI-X table entry.
    fn set_msix_mask(&self, entry: u16, masked: bool);

    /// Pending-bit-array state of an MSI-X table entry.
    fn msix_pending(&self, entry: u16) -> bool;
}

/// Everything one harness device needs from its host.
pub trait Platform:
    MemoryBus + UserMemory + DmaMemory + RegisterBus + InterruptController
{
}

impl<T> Platform for T where
    T: MemoryBus + UserMemory + DmaMemory + RegisterBus + InterruptController
{
}

pub type SharedPlatform = Arc<dyn Platform>;
