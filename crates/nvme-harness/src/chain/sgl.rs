//! SGL framing with bit-bucket splicing.
//!
//! Data descriptors follow the buffer one page at a time. Bit buckets overlay
//! byte ranges of the buffer: the overlapped part of each data descriptor is
//! cut out and a single bit-bucket descriptor of the bucket's full length is
//! emitted where the bucket starts.
//!
//! A single descriptor travels inline in SGL1. Anything longer goes into
//! segment pages; a page that is not the last ends with a pointer to the next
//! page, typed "last segment" when the next page is the final one.

use crate::dma::DmaBlock;
use crate::error::{Error, Result};

use super::{list_layout, BitBucket, DataPointer, Geometry};

const SGL_DESC_SIZE: usize = 16;

pub(crate) const TYPE_DATA_BLOCK: u8 = 0x0;
pub(crate) const TYPE_BIT_BUCKET: u8 = 0x1;
pub(crate) const TYPE_SEGMENT: u8 = 0x2;
pub(crate) const TYPE_LAST_SEGMENT: u8 = 0x3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SglEntry {
    Data {
        page: usize,
        page_offset: usize,
        len: usize,
    },
    BitBucket {
        len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SglPlan {
    pub entries: Vec<SglEntry>,
    /// Entries per segment page, excluding the pointer slot. Empty when the
    /// single entry is carried inline.
    pub pages: Vec<usize>,
}

pub(crate) fn descriptor(addr: u64, len: u32, ty: u8) -> [u8; SGL_DESC_SIZE] {
    let mut desc = [0u8; SGL_DESC_SIZE];
    desc[0..8].copy_from_slice(&addr.to_le_bytes());
    desc[8..12].copy_from_slice(&len.to_le_bytes());
    desc[15] = ty << 4;
    desc
}

fn checked_buckets(geom: &Geometry, buckets: &[BitBucket]) -> Result<Vec<BitBucket>> {
    let mut sorted = buckets.to_vec();
    sorted.sort_by_key(|b| b.offset);
    for b in &sorted {
        if b.length == 0 {
            return Err(Error::invalid(format!(
                "bit bucket at offset {} has zero length",
                b.offset
            )));
        }
        if b.end() > geom.len {
            return Err(Error::invalid(format!(
                "bit bucket {}+{} extends past the {}-byte buffer",
                b.offset, b.length, geom.len
            )));
        }
    }
    for pair in sorted.windows(2) {
        if pair[0].end() > pair[1].start() {
            return Err(Error::invalid(format!(
                "bit buckets at {} and {} overlap",
                pair[0].offset, pair[1].offset
            )));
        }
    }
    Ok(sorted)
}

pub(crate) fn plan(geom: &Geometry, buckets: &[BitBucket]) -> Result<SglPlan> {
    let buckets = checked_buckets(geom, buckets)?;
    let mut entries = Vec::with_capacity(geom.pages + buckets.len() * 2);

    let mut next = 0;
    let mut emitted = false;
    for span in geom.spans() {
        let end = span.start + span.len;
        let mut cursor = span.start;
        let data = |from: usize, to: usize| SglEntry::Data {
            page: span.page,
            page_offset: span.page_offset + (from - span.start),
            len: to - from,
        };

        while let Some(bucket) = buckets.get(next).filter(|b| b.start() < end) {
            if bucket.start() > cursor {
                entries.push(data(cursor, bucket.start()));
            }
            if !emitted {
                entries.push(SglEntry::BitBucket {
                    len: bucket.length as usize,
                });
                emitted = true;
            }
            cursor = bucket.end().min(end);
            if bucket.end() > end {
                break;
            }
            next += 1;
            emitted = false;
        }
        if cursor < end {
            entries.push(data(cursor, end));
        }
    }

    let pages = if entries.len() > 1 {
        list_layout(entries.len(), geom.page_size / SGL_DESC_SIZE)
    } else {
        Vec::new()
    };
    Ok(SglPlan { entries, pages })
}

fn encode(entry: &SglEntry, frames: &[u64]) -> [u8; SGL_DESC_SIZE] {
    match *entry {
        SglEntry::Data {
            page,
            page_offset,
            len,
        } => descriptor(frames[page] + page_offset as u64, len as u32, TYPE_DATA_BLOCK),
        SglEntry::BitBucket { len } => descriptor(0, len as u32, TYPE_BIT_BUCKET),
    }
}

fn segment_pointer(plan: &SglPlan, pages: &[DmaBlock], index: usize) -> [u8; SGL_DESC_SIZE] {
    let last = index + 1 == plan.pages.len();
    let slots = plan.pages[index] + usize::from(!last);
    let ty = if last { TYPE_LAST_SEGMENT } else { TYPE_SEGMENT };
    descriptor(pages[index].paddr(), (slots * SGL_DESC_SIZE) as u32, ty)
}

pub(crate) fn write(plan: &SglPlan, frames: &[u64], pages: &[DmaBlock]) -> Result<DataPointer> {
    if plan.pages.is_empty() {
        let only = plan
            .entries
            .first()
            .ok_or_else(|| Error::invalid("empty scatter-gather list"))?;
        return Ok(DataPointer::Sgl(encode(only, frames)));
    }

    let mut next = 0;
    for (index, &count) in plan.pages.iter().enumerate() {
        let mut raw = Vec::with_capacity((count + 1) * SGL_DESC_SIZE);
        for entry in &plan.entries[next..next + count] {
            raw.extend_from_slice(&encode(entry, frames));
        }
        next += count;
        if index + 1 < plan.pages.len() {
            raw.extend_from_slice(&segment_pointer(plan, pages, index + 1));
        }
        pages[index].write(0, &raw)?;
    }

    Ok(DataPointer::Sgl(segment_pointer(plan, pages, 0)))
}
