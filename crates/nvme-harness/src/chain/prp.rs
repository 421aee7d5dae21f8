//! PRP framing.
//!
//! - one page: PRP1 holds the (possibly offset) address, PRP2 is zero.
//! - two pages: PRP1 and PRP2 each hold one page address.
//! - more: PRP1 holds the first page, PRP2 points at a chain of list pages.
//! - queue rings: PRP1 points at a list describing every ring page.

use crate::command::DescriptorCaps;
use crate::dma::DmaBlock;
use crate::error::{Error, Result};

use super::{list_layout, ChainKind, DataPointer, Geometry};

const PRP_ENTRY_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PrpPlan {
    /// Addresses stored in each list page, excluding the chain pointer.
    pub list_pages: Vec<usize>,
    /// The list describes the first page too (PRP1 is the list pointer).
    pub first_in_list: bool,
}

fn require(caps: DescriptorCaps, needed: DescriptorCaps, pages: usize) -> Result<()> {
    if caps.contains(needed) {
        return Ok(());
    }
    Err(Error::invalid(format!(
        "{pages}-page transfer needs {:?}, command allows {:?}",
        needed.difference(caps),
        caps
    )))
}

/// Decide the framing and check it against the command's capability mask.
pub(crate) fn plan(geom: &Geometry, caps: DescriptorCaps, kind: ChainKind) -> Result<PrpPlan> {
    let per_page = geom.page_size / PRP_ENTRY_SIZE;

    if kind == ChainKind::QueueRing {
        require(caps, DescriptorCaps::PRP1_LIST, geom.pages)?;
        if geom.offset != 0 {
            return Err(Error::invalid("queue ring buffer must be page aligned"));
        }
        return Ok(PrpPlan {
            list_pages: list_layout(geom.pages, per_page),
            first_in_list: true,
        });
    }

    let list_pages = match geom.pages {
        1 => {
            require(caps, DescriptorCaps::PRP1_PAGE, 1)?;
            Vec::new()
        }
        2 => {
            require(caps, DescriptorCaps::PRP1_PAGE | DescriptorCaps::PRP2_PAGE, 2)?;
            Vec::new()
        }
        n => {
            require(caps, DescriptorCaps::PRP1_PAGE | DescriptorCaps::PRP2_LIST, n)?;
            list_layout(n - 1, per_page)
        }
    };
    Ok(PrpPlan {
        list_pages,
        first_in_list: false,
    })
}

/// Fill the list pages with frame addresses and return PRP1/PRP2.
pub(crate) fn write(
    plan: &PrpPlan,
    geom: &Geometry,
    frames: &[u64],
    lists: &[DmaBlock],
) -> Result<DataPointer> {
    let per_page = geom.page_size / PRP_ENTRY_SIZE;
    let listed = if plan.first_in_list {
        frames
    } else {
        &frames[1..]
    };

    let mut next = 0;
    for (index, (&count, block)) in plan.list_pages.iter().zip(lists).enumerate() {
        let mut page = vec![0u8; geom.page_size];
        for (slot, addr) in listed[next..next + count].iter().enumerate() {
            page[slot * PRP_ENTRY_SIZE..(slot + 1) * PRP_ENTRY_SIZE]
                .copy_from_slice(&addr.to_le_bytes());
        }
        next += count;
        if let Some(following) = lists.get(index + 1) {
            let at = (per_page - 1) * PRP_ENTRY_SIZE;
            page[at..at + PRP_ENTRY_SIZE].copy_from_slice(&following.paddr().to_le_bytes());
        }
        block.write(0, &page)?;
    }
    if next != listed.len() && !plan.list_pages.is_empty() {
        return Err(Error::ProtocolViolation(format!(
            "PRP list holds {next} of {} pages",
            listed.len()
        )));
    }

    if plan.first_in_list {
        return Ok(DataPointer::Prp {
            prp1: lists[0].paddr(),
            prp2: 0,
        });
    }

    let prp1 = frames[0] + geom.offset as u64;
    let prp2 = match (geom.pages, lists.first()) {
        (1, _) => 0,
        (2, _) => frames[1],
        (_, Some(list)) => list.paddr(),
        (_, None) => {
            return Err(Error::ProtocolViolation(
                "multi-page PRP transfer without a list page".into(),
            ))
        }
    };
    Ok(DataPointer::Prp { prp1, prp2 })
}
