//! Controller register map (BAR0) and the fields the engine touches.

use bitflags::bitflags;

pub const CAP: u64 = 0x00;
pub const VS: u64 = 0x08;
pub const INTMS: u64 = 0x0c;
pub const INTMC: u64 = 0x10;
pub const CC: u64 = 0x14;
pub const CSTS: u64 = 0x1c;
pub const NSSR: u64 = 0x20;
pub const AQA: u64 = 0x24;
pub const ASQ: u64 = 0x28;
pub const ACQ: u64 = 0x30;

pub const DOORBELL_BASE: u64 = 0x1000;

/// "NVMe" in ASCII; writing it to NSSR starts a subsystem reset.
pub const NSSR_RESET_MAGIC: u32 = 0x4e56_4d65;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        const NSSRO = 1 << 4;
    }
}

pub const CC_EN: u32 = 1 << 0;
const CC_IOSQES_SHIFT: u32 = 16;
const CC_IOCQES_SHIFT: u32 = 20;
const CC_QES_MASK: u32 = 0xf;

pub const AQA_ACQS_MASK: u32 = 0x0fff;
pub const AQA_ASQS_SHIFT: u32 = 16;
pub const AQA_ASQS_MASK: u32 = 0x0fff << AQA_ASQS_SHIFT;

/// Decoded fields of the 64-bit CAP register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Maximum queue entries supported, as a 1-based count.
    pub fn max_queue_entries(self) -> u32 {
        (self.0 & 0xffff) as u32 + 1
    }

    /// Contiguous queues required.
    pub fn contiguous_required(self) -> bool {
        self.0 & (1 << 16) != 0
    }

    /// Worst-case ready transition time in 500 ms units.
    pub fn timeout_units(self) -> u64 {
        (self.0 >> 24) & 0xff
    }

    pub fn doorbell_stride(self) -> u64 {
        4 << ((self.0 >> 32) & 0xf)
    }

    pub fn subsystem_reset_supported(self) -> bool {
        self.0 & (1 << 36) != 0
    }
}

/// Offset of the tail (SQ) or head (CQ) doorbell of queue `qid`.
pub fn doorbell_offset(qid: u16, completion: bool, stride: u64) -> u64 {
    DOORBELL_BASE + (2 * qid as u64 + completion as u64) * stride
}

/// CC with the I/O queue entry sizes replaced.
pub fn cc_with_entry_sizes(cc: u32, sq_shift: u8, cq_shift: u8) -> u32 {
    let cleared = cc
        & !(CC_QES_MASK << CC_IOSQES_SHIFT)
        & !(CC_QES_MASK << CC_IOCQES_SHIFT);
    cleared
        | ((sq_shift as u32 & CC_QES_MASK) << CC_IOSQES_SHIFT)
        | ((cq_shift as u32 & CC_QES_MASK) << CC_IOCQES_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbells_interleave_sq_and_cq() {
        assert_eq!(doorbell_offset(0, false, 4), 0x1000);
        assert_eq!(doorbell_offset(0, true, 4), 0x1004);
        assert_eq!(doorbell_offset(3, false, 4), 0x1018);
        assert_eq!(doorbell_offset(3, true, 16), 0x1000 + 7 * 16);
    }

    #[test]
    fn cap_fields_decode() {
        let cap = Capabilities(0x3ff | (1 << 16) | (20 << 24) | (2u64 << 32));
        assert_eq!(cap.max_queue_entries(), 1024);
        assert!(cap.contiguous_required());
        assert_eq!(cap.timeout_units(), 20);
        assert_eq!(cap.doorbell_stride(), 16);
    }

    #[test]
    fn cc_entry_sizes_preserve_other_bits() {
        let cc = cc_with_entry_sizes(CC_EN | (0xf << 16), 6, 4);
        assert_eq!(cc, CC_EN | (6 << 16) | (4 << 20));
    }
}
