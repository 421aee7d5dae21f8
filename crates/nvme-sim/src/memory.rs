//! Host memory model: sparse physical frames, coherent DMA regions and a test
//! program's virtual address space backed by scattered frames.

use std::collections::{BTreeMap, HashMap};

use nvme_harness::PlatformError;

pub const PAGE_SIZE: usize = 4096;
const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

const COHERENT_BASE: u64 = 0x1000_0000;
const USER_FRAME_BASE: u64 = 0x8000_0000;
const USER_VA_BASE: u64 = 0x7f00_0000_0000;

#[derive(Debug, Default)]
pub(crate) struct Memory {
    frames: HashMap<u64, Box<[u8]>>,
    coherent: BTreeMap<u64, usize>,
    next_coherent: u64,
    /// User virtual page -> physical frame.
    user_pages: HashMap<u64, u64>,
    next_user_va: u64,
    next_user_frame: u64,
    pins: HashMap<u64, u32>,
    pub(crate) fail_next_pin: bool,
    pub(crate) fail_coherent: bool,
    /// Frames unpinned with the dirty flag set.
    pub(crate) dirty_unpins: usize,
}

fn fault(addr: u64, len: usize) -> PlatformError {
    PlatformError::Fault { addr, len }
}

impl Memory {
    pub(crate) fn new() -> Self {
        Self {
            next_coherent: COHERENT_BASE,
            next_user_va: USER_VA_BASE,
            next_user_frame: USER_FRAME_BASE,
            ..Self::default()
        }
    }

    fn frame(&self, paddr: u64) -> Option<&[u8]> {
        self.frames.get(&(paddr & !PAGE_MASK)).map(|f| &f[..])
    }

    fn frame_mut(&mut self, paddr: u64) -> Option<&mut [u8]> {
        self.frames.get_mut(&(paddr & !PAGE_MASK)).map(|f| &mut f[..])
    }

    pub(crate) fn read(&self, paddr: u64, buf: &mut [u8]) -> Result<(), PlatformError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = paddr + done as u64;
            let offset = (addr & PAGE_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            let frame = self.frame(addr).ok_or_else(|| fault(paddr, buf.len()))?;
            buf[done..done + n].copy_from_slice(&frame[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, paddr: u64, buf: &[u8]) -> Result<(), PlatformError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = paddr + done as u64;
            let offset = (addr & PAGE_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            let frame = self.frame_mut(addr).ok_or_else(|| fault(paddr, buf.len()))?;
            frame[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn read_u64(&self, paddr: u64) -> Result<u64, PlatformError> {
        let mut buf = [0u8; 8];
        self.read(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn alloc_coherent(&mut self, len: usize) -> Result<u64, PlatformError> {
        if self.fail_coherent {
            return Err(PlatformError::OutOfMemory { len });
        }
        let pages = len.div_ceil(PAGE_SIZE).max(1);
        let base = self.next_coherent;
        for page in 0..pages as u64 {
            self.frames
                .insert(base + page * PAGE_SIZE as u64, vec![0u8; PAGE_SIZE].into());
        }
        // Leave a hole after each region so overruns fault.
        self.next_coherent += (pages as u64 + 1) * PAGE_SIZE as u64;
        self.coherent.insert(base, pages);
        Ok(base)
    }

    pub(crate) fn free_coherent(&mut self, paddr: u64) {
        if let Some(pages) = self.coherent.remove(&paddr) {
            for page in 0..pages as u64 {
                self.frames.remove(&(paddr + page * PAGE_SIZE as u64));
            }
        }
    }

    pub(crate) fn coherent_regions(&self) -> usize {
        self.coherent.len()
    }

    /// Map `len` bytes of fresh user memory. Consecutive virtual pages land on
    /// frames two apart, so no two are physically adjacent.
    pub(crate) fn map_user(&mut self, len: usize) -> u64 {
        let pages = len.div_ceil(PAGE_SIZE).max(1);
        let base = self.next_user_va;
        for page in 0..pages as u64 {
            let frame = self.next_user_frame;
            self.next_user_frame += 2 * PAGE_SIZE as u64;
            self.frames.insert(frame, vec![0u8; PAGE_SIZE].into());
            self.user_pages.insert(base + page * PAGE_SIZE as u64, frame);
        }
        self.next_user_va += (pages as u64 + 1) * PAGE_SIZE as u64;
        base
    }

    fn translate(&self, uaddr: u64) -> Option<u64> {
        self.user_pages
            .get(&(uaddr & !PAGE_MASK))
            .map(|frame| frame + (uaddr & PAGE_MASK))
    }

    pub(crate) fn copy_from_user(&self, uaddr: u64, buf: &mut [u8]) -> Result<(), PlatformError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = uaddr + done as u64;
            let n = (PAGE_SIZE - (addr & PAGE_MASK) as usize).min(buf.len() - done);
            let paddr = self.translate(addr).ok_or_else(|| fault(uaddr, buf.len()))?;
            self.read(paddr, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    pub(crate) fn copy_to_user(&mut self, uaddr: u64, buf: &[u8]) -> Result<(), PlatformError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = uaddr + done as u64;
            let n = (PAGE_SIZE - (addr & PAGE_MASK) as usize).min(buf.len() - done);
            let paddr = self.translate(addr).ok_or_else(|| fault(uaddr, buf.len()))?;
            self.write(paddr, &buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    pub(crate) fn pin(&mut self, uaddr: u64, count: usize) -> Result<Vec<u64>, PlatformError> {
        if std::mem::take(&mut self.fail_next_pin) {
            return Err(PlatformError::Fault {
                addr: uaddr,
                len: count * PAGE_SIZE,
            });
        }
        let frames = (0..count as u64)
            .map(|page| {
                self.translate(uaddr + page * PAGE_SIZE as u64)
                    .ok_or_else(|| fault(uaddr, count * PAGE_SIZE))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for &frame in &frames {
            *self.pins.entry(frame).or_default() += 1;
        }
        Ok(frames)
    }

    pub(crate) fn unpin(&mut self, frames: &[u64], dirty: bool) {
        if dirty {
            self.dirty_unpins += frames.len();
        }
        for frame in frames {
            if let Some(count) = self.pins.get_mut(frame) {
                *count -= 1;
                if *count == 0 {
                    self.pins.remove(frame);
                }
            }
        }
    }

    /// Total pins held across all frames.
    pub(crate) fn pinned_pages(&self) -> usize {
        self.pins.values().map(|&n| n as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_pages_are_scattered() {
        let mut mem = Memory::new();
        let va = mem.map_user(3 * PAGE_SIZE);
        let frames = mem.pin(va, 3).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.windows(2).all(|w| w[1] != w[0] + PAGE_SIZE as u64));
        assert_eq!(mem.pinned_pages(), 3);
        mem.unpin(&frames, false);
        assert_eq!(mem.pinned_pages(), 0);
    }

    #[test]
    fn user_copies_span_pages() {
        let mut mem = Memory::new();
        let va = mem.map_user(2 * PAGE_SIZE);
        let data: Vec<u8> = (0..100u8).collect();
        mem.copy_to_user(va + PAGE_SIZE as u64 - 50, &data).unwrap();
        let mut back = vec![0u8; 100];
        mem.copy_from_user(va + PAGE_SIZE as u64 - 50, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn pin_is_all_or_nothing() {
        let mut mem = Memory::new();
        let va = mem.map_user(PAGE_SIZE);
        assert!(mem.pin(va, 2).is_err());
        assert_eq!(mem.pinned_pages(), 0);
    }

    #[test]
    fn freed_coherent_memory_faults() {
        let mut mem = Memory::new();
        let paddr = mem.alloc_coherent(100).unwrap();
        mem.write(paddr, &[1, 2, 3]).unwrap();
        mem.free_coherent(paddr);
        assert!(mem.read(paddr, &mut [0u8; 3]).is_err());
        assert_eq!(mem.coherent_regions(), 0);
    }
}
