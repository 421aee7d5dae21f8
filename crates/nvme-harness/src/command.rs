//! Submission and completion entry layouts.

use bitflags::bitflags;

pub const COMMAND_SIZE: usize = 64;
pub const COMPLETION_SIZE: usize = 16;

/// Admin opcodes whose completion changes queue state.
pub mod admin {
    pub const DELETE_SQ: u8 = 0x00;
    pub const CREATE_SQ: u8 = 0x01;
    pub const DELETE_CQ: u8 = 0x04;
    pub const CREATE_CQ: u8 = 0x05;
}

bitflags! {
    /// Descriptor slots a command type may use.
    ///
    /// Filled in by the test program per command. The chain builder refuses
    /// any PRP framing that needs a slot outside this set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescriptorCaps: u32 {
        const PRP1_PAGE = 1 << 0;
        const PRP1_LIST = 1 << 1;
        const PRP2_PAGE = 1 << 2;
        const PRP2_LIST = 1 << 3;
        const MPTR = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
    Bidirectional,
}

impl DataDirection {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => DataDirection::None,
            1 => DataDirection::ToDevice,
            2 => DataDirection::FromDevice,
            3 => DataDirection::Bidirectional,
            _ => return None,
        })
    }

    /// The device may write into the buffer.
    pub fn device_writes(self) -> bool {
        matches!(self, DataDirection::FromDevice | DataDirection::Bidirectional)
    }
}

/// A 64-byte submission queue entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandBytes(pub [u8; COMMAND_SIZE]);

impl std::fmt::Debug for CommandBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBytes")
            .field("opcode", &self.opcode())
            .field("cid", &self.cid())
            .field("nsid", &self.nsid())
            .field("cdw10", &self.cdw10())
            .field("cdw11", &self.cdw11())
            .finish()
    }
}

impl CommandBytes {
    pub fn new(opcode: u8) -> Self {
        let mut bytes = [0u8; COMMAND_SIZE];
        bytes[0] = opcode;
        CommandBytes(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.get(..COMMAND_SIZE)?.try_into().ok().map(CommandBytes)
    }

    fn dword(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.0[at],
            self.0[at + 1],
            self.0[at + 2],
            self.0[at + 3],
        ])
    }

    fn set_dword(&mut self, at: usize, val: u32) {
        self.0[at..at + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn qword(&self, at: usize) -> u64 {
        self.dword(at) as u64 | (self.dword(at + 4) as u64) << 32
    }

    fn set_qword(&mut self, at: usize, val: u64) {
        self.0[at..at + 8].copy_from_slice(&val.to_le_bytes());
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    /// PRP or SGL data transfer field (CDW0 bits 15:14).
    pub fn psdt(&self) -> u8 {
        (self.0[1] >> 6) & 0x3
    }

    pub fn with_psdt(mut self, psdt: u8) -> Self {
        self.0[1] = (self.0[1] & 0x3f) | ((psdt & 0x3) << 6);
        self
    }

    pub fn cid(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn set_cid(&mut self, cid: u16) {
        self.0[2..4].copy_from_slice(&cid.to_le_bytes());
    }

    pub fn nsid(&self) -> u32 {
        self.dword(4)
    }

    pub fn set_nsid(&mut self, nsid: u32) {
        self.set_dword(4, nsid);
    }

    pub fn metadata_ptr(&self) -> u64 {
        self.qword(16)
    }

    pub fn set_metadata_ptr(&mut self, addr: u64) {
        self.set_qword(16, addr);
    }

    pub fn prp1(&self) -> u64 {
        self.qword(24)
    }

    pub fn set_prp1(&mut self, addr: u64) {
        self.set_qword(24, addr);
    }

    pub fn prp2(&self) -> u64 {
        self.qword(32)
    }

    pub fn set_prp2(&mut self, addr: u64) {
        self.set_qword(32, addr);
    }

    /// SGL descriptor 1 overlays PRP1/PRP2.
    pub fn set_sgl1(&mut self, desc: [u8; 16]) {
        self.0[24..40].copy_from_slice(&desc);
    }

    pub fn cdw10(&self) -> u32 {
        self.dword(40)
    }

    pub fn set_cdw10(&mut self, val: u32) {
        self.set_dword(40, val);
    }

    pub fn cdw11(&self) -> u32 {
        self.dword(44)
    }

    pub fn set_cdw11(&mut self, val: u32) {
        self.set_dword(44, val);
    }

    pub fn set_cdw12(&mut self, val: u32) {
        self.set_dword(48, val);
    }

    /// Queue id a create/delete-queue admin command targets.
    pub fn target_qid(&self) -> u16 {
        (self.cdw10() & 0xffff) as u16
    }

    /// Physically-contiguous flag of a create-queue command.
    pub fn create_contiguous(&self) -> bool {
        self.cdw11() & 0x1 != 0
    }

    /// Interrupts-enabled flag of a create-CQ command.
    pub fn create_irq_enabled(&self) -> bool {
        self.cdw11() & 0x2 != 0
    }

    /// Interrupt vector field of a create-CQ command.
    pub fn create_irq_vector(&self) -> u16 {
        (self.cdw11() >> 16) as u16
    }
}

/// A completion queue entry as the controller wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    /// Status field including the phase tag in bit 0.
    pub status: u16,
}

impl CompletionEntry {
    pub fn parse(raw: &[u8; COMPLETION_SIZE]) -> Self {
        let word = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let dword = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        CompletionEntry {
            dw0: dword(0),
            dw1: dword(4),
            sq_head: word(8),
            sq_id: word(10),
            cid: word(12),
            status: word(14),
        }
    }

    pub fn to_bytes(self) -> [u8; COMPLETION_SIZE] {
        let mut out = [0u8; COMPLETION_SIZE];
        out[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.dw1.to_le_bytes());
        out[8..10].copy_from_slice(&self.sq_head.to_le_bytes());
        out[10..12].copy_from_slice(&self.sq_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.cid.to_le_bytes());
        out[14..16].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    /// Status code and status code type, phase tag stripped.
    pub fn status_field(&self) -> u16 {
        (self.status >> 1) & 0x7ff
    }

    pub fn succeeded(&self) -> bool {
        self.status_field() == 0
    }
}

/// Byte offset of the status word inside a completion entry.
pub const COMPLETION_STATUS_OFFSET: u64 = 14;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_fields_land_at_protocol_offsets() {
        let mut cmd = CommandBytes::new(admin::CREATE_SQ).with_psdt(1);
        cmd.set_cid(0xbeef);
        cmd.set_nsid(7);
        cmd.set_prp1(0x1234_5000);
        cmd.set_prp2(0x6789_a000);
        cmd.set_cdw10(3 | (63 << 16));
        cmd.set_cdw11(1 | (2 << 16));

        assert_eq!(cmd.0[0], 0x01);
        assert_eq!(cmd.0[1], 0x40);
        assert_eq!(&cmd.0[2..4], &[0xef, 0xbe]);
        assert_eq!(cmd.psdt(), 1);
        assert_eq!(cmd.prp1(), 0x1234_5000);
        assert_eq!(cmd.prp2(), 0x6789_a000);
        assert_eq!(cmd.target_qid(), 3);
        assert!(cmd.create_contiguous());
        assert!(!cmd.create_irq_enabled());
        assert_eq!(cmd.create_irq_vector(), 2);
    }

    #[test]
    fn completion_entry_splits_status_and_phase() {
        let entry = CompletionEntry {
            dw0: 1,
            dw1: 2,
            sq_head: 5,
            sq_id: 1,
            cid: 42,
            status: (0x2 << 1) | 1,
        };
        let parsed = CompletionEntry::parse(&entry.to_bytes());
        assert_eq!(parsed, entry);
        assert!(parsed.phase());
        assert_eq!(parsed.status_field(), 0x2);
        assert!(!parsed.succeeded());
    }
}
