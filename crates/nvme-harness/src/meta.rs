//! Per-command metadata buffers, addressed by a caller-chosen id.

use std::collections::BTreeMap;

use tracing::debug;

use crate::chain::Release;
use crate::dma::{DmaBlock, DmaPool};
use crate::error::{Error, Object, Result};
use crate::platform::SharedPlatform;

#[derive(Debug, Default)]
pub struct MetadataStore {
    pool: Option<DmaPool>,
    buffers: BTreeMap<u32, DmaBlock>,
}

impl MetadataStore {
    /// Create the backing pool. Buffers are `size` bytes, dword multiples, at
    /// most one page.
    pub fn create_pool(
        &mut self,
        platform: SharedPlatform,
        size: u32,
        page_size: usize,
    ) -> Result<()> {
        if self.pool.is_some() {
            return Err(Error::exists(Object::MetadataPool, 0u32));
        }
        if size == 0 || size % 4 != 0 || size as usize > page_size {
            return Err(Error::invalid(format!(
                "metadata buffer size {size} must be a non-zero dword multiple of at most {page_size}"
            )));
        }
        self.pool = Some(DmaPool::new("metadata", platform, size as usize));
        debug!(size, "metadata pool created");
        Ok(())
    }

    pub fn create(&mut self, id: u32) -> Result<u64> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::not_found(Object::MetadataPool, 0u32))?;
        if self.buffers.contains_key(&id) {
            return Err(Error::exists(Object::MetadataBuffer, id));
        }
        let block = pool.alloc()?;
        let paddr = block.paddr();
        self.buffers.insert(id, block);
        debug!(id, paddr, "metadata buffer created");
        Ok(paddr)
    }

    pub fn delete(&mut self, id: u32) -> Release {
        match self.buffers.remove(&id) {
            Some(_) => Release::Released,
            None => Release::AlreadyGone,
        }
    }

    pub fn lookup(&self, id: u32) -> Result<u64> {
        self.buffers
            .get(&id)
            .map(DmaBlock::paddr)
            .ok_or_else(|| Error::not_found(Object::MetadataBuffer, id))
    }

    pub fn outstanding(&self) -> usize {
        self.pool.as_ref().map_or(0, DmaPool::outstanding)
    }

    /// Free every buffer and the pool itself.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.pool = None;
    }
}
