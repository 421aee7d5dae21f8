//! Descriptor chains: pinned user buffers described to the controller as PRP
//! lists or SGL segments.
//!
//! Building happens in two phases. The layout is planned from page geometry
//! alone (so every capability and argument check runs before anything is
//! pinned), then descriptor pages are allocated, the buffer is pinned, and the
//! planned descriptors are written with the real frame addresses.
//!
//! A [`DescriptorChain`] owns its pins and descriptor pages. Releasing it, or
//! dropping it, returns both exactly once.

pub(crate) mod prp;
pub(crate) mod sgl;

use tracing::{debug, warn};

use crate::command::{CommandBytes, DataDirection, DescriptorCaps};
use crate::dma::{DmaBlock, DmaPool};
use crate::error::{Error, Result};
use crate::platform::SharedPlatform;

/// A range of the test program's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    pub addr: u64,
    pub len: usize,
}

/// A range of the data buffer the controller must discard instead of
/// transferring. `offset` is relative to the start of the data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitBucket {
    pub offset: u32,
    pub length: u32,
}

impl BitBucket {
    fn start(&self) -> usize {
        self.offset as usize
    }

    fn end(&self) -> usize {
        self.offset as usize + self.length as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Prp,
    Sgl,
}

/// What the chain describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// A command's data buffer.
    Data,
    /// The ring of a non-contiguous I/O queue, handed over by a create-queue
    /// command.
    QueueRing,
}

#[derive(Debug, Clone, Copy)]
pub struct ChainRequest<'a> {
    pub buffer: UserBuffer,
    pub direction: DataDirection,
    pub caps: DescriptorCaps,
    pub framing: Framing,
    pub kind: ChainKind,
    pub bit_buckets: &'a [BitBucket],
}

/// The value a chain contributes to the command's data pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPointer {
    Prp { prp1: u64, prp2: u64 },
    Sgl([u8; 16]),
}

impl DataPointer {
    pub fn apply(&self, cmd: &mut CommandBytes) {
        match *self {
            DataPointer::Prp { prp1, prp2 } => {
                cmd.set_prp1(prp1);
                cmd.set_prp2(prp2);
            }
            DataPointer::Sgl(desc) => cmd.set_sgl1(desc),
        }
    }
}

/// One physically contiguous piece of the data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub paddr: u64,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    /// The chain had already been released; nothing was done.
    AlreadyGone,
}

/// Page geometry of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub offset: usize,
    pub len: usize,
    pub page_size: usize,
    pub pages: usize,
}

/// A data segment in buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageSpan {
    pub page: usize,
    pub page_offset: usize,
    /// Offset from the start of the data buffer.
    pub start: usize,
    pub len: usize,
}

impl Geometry {
    pub fn new(addr: u64, len: usize, page_size: usize) -> Self {
        let offset = (addr % page_size as u64) as usize;
        Geometry {
            offset,
            len,
            page_size,
            pages: (offset + len).div_ceil(page_size),
        }
    }

    /// One span per page; no merging of physically adjacent frames.
    pub fn spans(&self) -> impl Iterator<Item = PageSpan> + '_ {
        (0..self.pages).map(move |page| {
            let page_offset = if page == 0 { self.offset } else { 0 };
            let start = if page == 0 {
                0
            } else {
                page * self.page_size - self.offset
            };
            let len = (self.page_size - page_offset).min(self.len - start);
            PageSpan {
                page,
                page_offset,
                start,
                len,
            }
        })
    }
}

/// Entries per descriptor page for `entries` descriptors when each page has
/// room for `per_page`. A page that is not the last gives up its final slot
/// to the pointer to the next page.
pub(crate) fn list_layout(entries: usize, per_page: usize) -> Vec<usize> {
    let mut pages = Vec::new();
    let mut remaining = entries;
    while remaining > 0 {
        let take = if remaining > per_page {
            per_page - 1
        } else {
            remaining
        };
        pages.push(take);
        remaining -= take;
    }
    pages
}

struct PinnedPages {
    platform: SharedPlatform,
    frames: Vec<u64>,
    dirty: bool,
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        self.platform.unpin_user_pages(&self.frames, self.dirty);
    }
}

struct ChainResources {
    pinned: PinnedPages,
    descriptor_pages: Vec<DmaBlock>,
    segments: Vec<Segment>,
}

pub struct DescriptorChain {
    kind: ChainKind,
    framing: Framing,
    buffer: UserBuffer,
    page_size: usize,
    pointer: DataPointer,
    resources: Option<ChainResources>,
}

impl std::fmt::Debug for DescriptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorChain")
            .field("kind", &self.kind)
            .field("framing", &self.framing)
            .field("buffer", &self.buffer)
            .field("pointer", &self.pointer)
            .field("released", &self.is_released())
            .finish()
    }
}

impl DescriptorChain {
    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn buffer(&self) -> UserBuffer {
        self.buffer
    }

    pub fn pointer(&self) -> DataPointer {
        self.pointer
    }

    pub fn is_released(&self) -> bool {
        self.resources.is_none()
    }

    pub fn segments(&self) -> &[Segment] {
        match &self.resources {
            Some(res) => &res.segments,
            None => &[],
        }
    }

    pub fn pinned_pages(&self) -> usize {
        self.resources.as_ref().map_or(0, |res| res.pinned.frames.len())
    }

    /// Physical addresses of the PRP list or SGL segment pages.
    pub fn descriptor_pages(&self) -> Vec<u64> {
        self.resources.as_ref().map_or_else(Vec::new, |res| {
            res.descriptor_pages.iter().map(DmaBlock::paddr).collect()
        })
    }

    /// Physical address of byte `offset` of the buffer, if it is still pinned.
    pub fn phys_at(&self, offset: usize) -> Option<u64> {
        let res = self.resources.as_ref()?;
        if offset >= self.buffer.len {
            return None;
        }
        let absolute = (self.buffer.addr % self.page_size as u64) as usize + offset;
        let frame = res.pinned.frames.get(absolute / self.page_size)?;
        Some(frame + (absolute % self.page_size) as u64)
    }

    /// Unpin the buffer and free the descriptor pages.
    pub fn release(&mut self) -> Release {
        match self.resources.take() {
            Some(res) => {
                debug!(
                    addr = self.buffer.addr,
                    len = self.buffer.len,
                    pages = res.pinned.frames.len(),
                    "descriptor chain released"
                );
                drop(res);
                Release::Released
            }
            None => {
                warn!(addr = self.buffer.addr, "descriptor chain already released");
                Release::AlreadyGone
            }
        }
    }
}

/// Builds chains out of one device's descriptor pool.
pub struct ChainBuilder<'a> {
    pool: &'a DmaPool,
    page_size: usize,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(pool: &'a DmaPool, page_size: usize) -> Self {
        Self { pool, page_size }
    }

    pub fn build(&self, req: &ChainRequest<'_>) -> Result<DescriptorChain> {
        let buffer = req.buffer;
        if buffer.addr == 0 {
            return Err(Error::invalid("data buffer address is null"));
        }
        if buffer.addr % 4 != 0 {
            return Err(Error::invalid(format!(
                "data buffer {:#x} is not dword aligned",
                buffer.addr
            )));
        }
        if buffer.len == 0 {
            return Err(Error::invalid("data buffer length is zero"));
        }
        if buffer.addr.checked_add(buffer.len as u64).is_none() {
            return Err(Error::invalid("data buffer wraps the address space"));
        }
        if req.framing == Framing::Prp && !req.bit_buckets.is_empty() {
            return Err(Error::invalid("bit buckets require SGL framing"));
        }

        let geom = Geometry::new(buffer.addr, buffer.len, self.page_size);
        let layout = match req.framing {
            Framing::Prp => Layout::Prp(prp::plan(&geom, req.caps, req.kind)?),
            Framing::Sgl => Layout::Sgl(sgl::plan(&geom, req.bit_buckets)?),
        };

        let descriptor_pages = (0..layout.page_count())
            .map(|_| self.pool.alloc())
            .collect::<Result<Vec<_>>>()?;

        let platform = self.pool.platform();
        let page_base = buffer.addr - geom.offset as u64;
        let frames = platform.pin_user_pages(page_base, geom.pages)?;
        let pinned = PinnedPages {
            platform: platform.clone(),
            frames,
            dirty: req.direction.device_writes(),
        };
        if pinned.frames.len() != geom.pages {
            return Err(Error::ResourceExhausted(format!(
                "pinned {} of {} pages",
                pinned.frames.len(),
                geom.pages
            )));
        }

        let pointer = match &layout {
            Layout::Prp(plan) => {
                prp::write(plan, &geom, &pinned.frames, &descriptor_pages)?
            }
            Layout::Sgl(plan) => sgl::write(plan, &pinned.frames, &descriptor_pages)?,
        };

        let segments = geom
            .spans()
            .map(|span| Segment {
                paddr: pinned.frames[span.page] + span.page_offset as u64,
                len: span.len,
            })
            .collect();

        debug!(
            addr = buffer.addr,
            len = buffer.len,
            pages = geom.pages,
            descriptor_pages = descriptor_pages.len(),
            framing = ?req.framing,
            "descriptor chain built"
        );

        Ok(DescriptorChain {
            kind: req.kind,
            framing: req.framing,
            buffer,
            page_size: self.page_size,
            pointer,
            resources: Some(ChainResources {
                pinned,
                descriptor_pages,
                segments,
            }),
        })
    }
}

enum Layout {
    Prp(prp::PrpPlan),
    Sgl(sgl::SglPlan),
}

impl Layout {
    fn page_count(&self) -> usize {
        match self {
            Layout::Prp(plan) => plan.list_pages.len(),
            Layout::Sgl(plan) => plan.pages.len(),
        }
    }
}
