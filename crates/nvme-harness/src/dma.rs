//! Coherent DMA allocation pools.
//!
//! Every block handed out owns its memory: dropping a [`DmaBlock`] returns it
//! to the platform and decrements the pool's outstanding count. The counts are
//! what tests use to prove nothing leaked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::platform::SharedPlatform;

#[derive(Debug, Default)]
struct PoolStats {
    outstanding: AtomicUsize,
}

/// A named source of coherent DMA blocks of one default size.
#[derive(Clone)]
pub struct DmaPool {
    name: &'static str,
    platform: SharedPlatform,
    block_size: usize,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for DmaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaPool")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl DmaPool {
    pub fn new(name: &'static str, platform: SharedPlatform, block_size: usize) -> Self {
        Self {
            name,
            platform,
            block_size,
            stats: Arc::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn platform(&self) -> &SharedPlatform {
        &self.platform
    }

    pub fn alloc(&self) -> Result<DmaBlock> {
        self.alloc_len(self.block_size)
    }

    pub fn alloc_len(&self, len: usize) -> Result<DmaBlock> {
        if len == 0 {
            return Err(Error::invalid(format!("{}: zero-length allocation", self.name)));
        }
        let paddr = self.platform.alloc_coherent(len).map_err(|err| {
            Error::ResourceExhausted(format!("{} pool: {err}", self.name))
        })?;
        self.stats.outstanding.fetch_add(1, Ordering::Relaxed);
        trace!(pool = self.name, paddr, len, "dma alloc");
        Ok(DmaBlock {
            paddr,
            len,
            platform: self.platform.clone(),
            stats: self.stats.clone(),
        })
    }

    /// Blocks handed out and not yet dropped.
    pub fn outstanding(&self) -> usize {
        self.stats.outstanding.load(Ordering::Relaxed)
    }
}

/// One coherent allocation. Freed on drop.
pub struct DmaBlock {
    paddr: u64,
    len: usize,
    platform: SharedPlatform,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for DmaBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBlock")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("len", &self.len)
            .finish()
    }
}

impl DmaBlock {
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        self.platform
            .write_physical(self.paddr + offset as u64, bytes)
            .map_err(Error::from)
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.platform
            .read_physical(self.paddr + offset as u64, buf)
            .map_err(Error::from)
    }

    pub fn zero(&self) -> Result<()> {
        self.platform
            .fill_zero(self.paddr, self.len)
            .map_err(Error::from)
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::invalid(format!(
                "dma access {offset}+{len} outside block of {}",
                self.len
            ))),
        }
    }
}

impl Drop for DmaBlock {
    fn drop(&mut self) {
        self.platform.free_coherent(self.paddr, self.len);
        self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Descriptor pages and contiguous queue rings of one device.
#[derive(Debug)]
pub struct DmaPools {
    pub descriptors: DmaPool,
    pub rings: DmaPool,
}

impl DmaPools {
    pub fn new(platform: SharedPlatform, page_size: usize) -> Self {
        Self {
            descriptors: DmaPool::new("descriptor", platform.clone(), page_size),
            rings: DmaPool::new("ring", platform, page_size),
        }
    }
}
